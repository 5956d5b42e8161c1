// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Thread-safe pool of fixed-capacity byte regions backing
//! [`Ownership::Managed`](super::Ownership) buffers, plus a size-class
//! variant for [`Ownership::Sized`](super::Ownership).

use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Default per-buffer capacity (§3): 8192 bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// A pool of same-sized byte regions. Released regions are zeroed and
/// pushed back (§4.A `release`); acquiring pops one or allocates fresh.
pub struct Pool {
    slot_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl Pool {
    pub fn new(slot_size: usize) -> Self {
        Self { slot_size, free: Mutex::new(Vec::new()) }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Pop a recycled slot or allocate a fresh zeroed one.
    #[allow(clippy::unwrap_used, reason = "poisoned pool mutex is unrecoverable")]
    pub fn acquire(&self) -> Box<[u8]> {
        if let Some(slot) = self.free.lock().unwrap().pop() {
            return slot;
        }
        vec![0u8; self.slot_size].into_boxed_slice()
    }

    /// Zero and return a slot. Slots of the wrong size are dropped instead
    /// of pooled (can happen if a caller mixes pools; never by this
    /// crate's own code paths).
    #[allow(clippy::unwrap_used, reason = "poisoned pool mutex is unrecoverable")]
    pub fn release(&self, mut slot: Box<[u8]>) {
        if slot.len() != self.slot_size {
            return;
        }
        slot.fill(0);
        self.free.lock().unwrap().push(slot);
    }

    /// Number of recycled (idle) slots currently held — exposed for tests
    /// that assert pool counters return to baseline after an interrupt.
    #[allow(clippy::unwrap_used, reason = "poisoned pool mutex is unrecoverable")]
    pub fn idle_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// Process-wide pool for the default 8192-byte slot size, used by
/// [`Buffer::new`](super::Buffer::new).
pub static DEFAULT_POOL: Lazy<Pool> = Lazy::new(|| Pool::new(DEFAULT_BUFFER_SIZE));

/// Obtain (or lazily create) a size-class pool for a specific slot size,
/// used by [`Buffer::with_size`](super::Buffer::with_size). Keyed pools are
/// cached for the process lifetime, mirroring the teacher's
/// `OnceCell`/`DashMap`-backed singletons.
pub fn size_class_pool(size: usize) -> &'static Pool {
    use dashmap::DashMap;

    static CLASSES: Lazy<DashMap<usize, &'static Pool>> = Lazy::new(DashMap::new);

    if let Some(p) = CLASSES.get(&size) {
        return *p;
    }
    let leaked: &'static Pool = Box::leak(Box::new(Pool::new(size)));
    CLASSES.entry(size).or_insert(leaked);
    leaked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_slots_are_zeroed() {
        let pool = Pool::new(16);
        let mut slot = pool.acquire();
        slot.fill(0xAB);
        pool.release(slot);
        assert_eq!(pool.idle_len(), 1);
        let slot2 = pool.acquire();
        assert!(slot2.iter().all(|&b| b == 0));
        assert_eq!(pool.idle_len(), 0);
    }
}
