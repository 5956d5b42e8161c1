// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pooled byte-buffer primitive (§3, §4.A): a fixed-capacity region with two
//! cursors `[start, end]` and tracked ownership, optionally carrying a
//! per-packet UDP address sideband tag.

mod multi;
pub mod pool;

use std::fmt;

pub use multi::MultiBuffer;
use thiserror::Error;

use crate::destination::Destination;

/// How a [`Buffer`]'s backing storage is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Returns to the default pool on release.
    Managed,
    /// Borrowed data; release is a no-op.
    Unmanaged,
    /// Allocated from a size-class pool keyed by capacity.
    Sized,
}

/// Leaf errors for buffer operations (§4.A).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer full: tried to write {attempted} bytes, {available} available")]
    BufferFull { attempted: usize, available: usize },
    #[error("buffer is unmanaged/immutable and cannot be written to")]
    Immutable,
}

enum Storage {
    /// Owned, mutable slot — backs `Managed` and `Sized` buffers.
    Owned(Box<[u8]>),
    /// Shared, immutable bytes — backs `Unmanaged` buffers (zero-copy
    /// `from_bytes`).
    Shared(bytes::Bytes),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(b) => b,
            Storage::Shared(b) => b,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Owned(b) => b.len(),
            Storage::Shared(b) => b.len(),
        }
    }
}

/// A fixed-capacity byte region with `[start, end]` cursors (§3).
///
/// A released `Buffer` is unusable: further `write`/`advance`/`resize`
/// calls are no-ops once `released` is set, matching the spec's "release
/// is idempotent; a released Buffer is unusable" invariant.
pub struct Buffer {
    storage: Storage,
    start: usize,
    end: usize,
    ownership: Ownership,
    pool: Option<&'static pool::Pool>,
    released: bool,
    /// Per-packet UDP source/destination sideband tag (§3, §4.E).
    pub udp_addr: Option<Destination>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ownership", &self.ownership)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("cap", &self.cap())
            .field("udp_addr", &self.udp_addr)
            .finish()
    }
}

impl Buffer {
    /// Obtain a pooled buffer of the default capacity (8192 B), length 0.
    pub fn new() -> Self {
        let slot = pool::DEFAULT_POOL.acquire();
        Self {
            storage: Storage::Owned(slot),
            start: 0,
            end: 0,
            ownership: Ownership::Managed,
            pool: Some(&pool::DEFAULT_POOL),
            released: false,
            udp_addr: None,
        }
    }

    /// Borrow an unmanaged, size-fixed region. `release` on this buffer is
    /// a no-op; the content is already fully "written" (`start=0,
    /// end=len`).
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            storage: Storage::Shared(bytes::Bytes::copy_from_slice(data)),
            start: 0,
            end: data.len(),
            ownership: Ownership::Unmanaged,
            pool: None,
            released: false,
            udp_addr: None,
        }
    }

    /// Allocate a zero-length buffer from a size-class pool.
    pub fn with_size(n: usize) -> Self {
        let p = pool::size_class_pool(n);
        let slot = p.acquire();
        Self {
            storage: Storage::Owned(slot),
            start: 0,
            end: 0,
            ownership: Ownership::Sized,
            pool: Some(p),
            released: false,
            udp_addr: None,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn cap(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage.as_slice()[self.start..self.end]
    }

    /// Copy `data` into `[end..cap]`. Returns the number of bytes actually
    /// written; if that is less than `data.len()` the caller receives
    /// `BufferError::BufferFull` rather than a silently short write.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        if self.released {
            return Ok(0);
        }
        let Storage::Owned(slot) = &mut self.storage else {
            return Err(BufferError::Immutable);
        };
        let available = slot.len() - self.end;
        if data.len() > available {
            return Err(BufferError::BufferFull {
                attempted: data.len(),
                available,
            });
        }
        slot[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
        Ok(data.len())
    }

    /// Move the start cursor forward by `n`, clamped to `end`.
    pub fn advance(&mut self, n: usize) {
        if self.released {
            return;
        }
        self.start = (self.start + n).min(self.end);
    }

    /// Reposition both cursors, clamped to `[0, cap]`; bytes newly exposed
    /// by growing `end` past the previous `end` are zeroed.
    pub fn resize(&mut self, from: usize, to: usize) {
        if self.released {
            return;
        }
        let cap = self.cap();
        let from = from.min(cap);
        let to = to.min(cap);
        if let Storage::Owned(slot) = &mut self.storage {
            if to > self.end {
                slot[self.end..to].fill(0);
            }
        }
        self.start = from;
        self.end = to;
    }

    /// Zero the used range and return the slot to its pool. No-op on
    /// `Unmanaged`; idempotent once released.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let (Storage::Owned(slot), Some(pool)) =
            (std::mem::replace(&mut self.storage, Storage::Shared(bytes::Bytes::new())), self.pool)
        {
            pool.release(slot);
        }
        self.start = 0;
        self.end = 0;
    }

    /// Split off a view of the trailing `len() - at` bytes, leaving `self`
    /// holding only the first `at` bytes. Used by `MultiBuffer::split_at`.
    pub fn split_off(&mut self, at: usize) -> Buffer {
        let at = at.min(self.len());
        let mid = self.start + at;
        let tail_len = self.end - mid;
        let tail_bytes = bytes::Bytes::copy_from_slice(&self.storage.as_slice()[mid..self.end]);
        self.end = mid;
        Buffer {
            storage: Storage::Shared(tail_bytes),
            start: 0,
            end: tail_len,
            ownership: Ownership::Unmanaged,
            pool: None,
            released: false,
            udp_addr: self.udp_addr.clone(),
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_release_zeroes_and_recycles() {
        let mut b = Buffer::new();
        assert_eq!(b.write(b"hello").expect("write"), 5);
        assert_eq!(b.as_slice(), b"hello");
        b.release();
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn write_past_capacity_is_rejected() {
        let mut b = Buffer::with_size(4);
        let err = b.write(b"hello").unwrap_err();
        assert_eq!(err, BufferError::BufferFull { attempted: 5, available: 4 });
    }

    #[test]
    fn from_bytes_is_immediately_readable() {
        let b = Buffer::from_bytes(b"abc");
        assert_eq!(b.as_slice(), b"abc");
        assert_eq!(b.ownership(), Ownership::Unmanaged);
    }

    #[test]
    fn advance_clamps_to_end() {
        let mut b = Buffer::new();
        b.write(b"abc").expect("write");
        b.advance(100);
        assert_eq!(b.len(), 0);
    }
}
