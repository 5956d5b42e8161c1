// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded, backpressured, interruptible async `MultiBuffer` conduit (§3,
//! §4.B). A `Pipe` is the sole inter-task channel in the data-plane: every
//! logical flow is two lightweight tasks (uplink/downlink copier) talking
//! through a pair of these.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::timeout};
use tracing::debug;

use crate::{buffer::MultiBuffer, error::CoreError};

/// `OnTransmission` hook: rewrites every `MultiBuffer` passing through a
/// pipe (used for per-packet UDP address rewriting, §4.E).
pub type TransmissionHook = Arc<dyn Fn(MultiBuffer) -> MultiBuffer + Send + Sync>;

/// Pipe construction options (§3).
#[derive(Clone)]
pub struct PipeOptions {
    /// `None` = unbounded (never suspends the writer).
    pub size_limit: Option<u64>,
    /// If set, a write exceeding the limit drops the excess instead of
    /// suspending the writer.
    pub discard_overflow: bool,
    pub on_transmission: Option<TransmissionHook>,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            size_limit: Some(1 << 20),
            discard_overflow: false,
            on_transmission: None,
        }
    }
}

impl PipeOptions {
    pub fn unbounded() -> Self {
        Self { size_limit: None, discard_overflow: false, on_transmission: None }
    }

    pub fn with_size_limit(bytes: u64) -> Self {
        Self { size_limit: Some(bytes), discard_overflow: false, on_transmission: None }
    }

    pub fn discard_overflow(mut self) -> Self {
        self.discard_overflow = true;
        self
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open = 0,
    WriteClosed = 1,
    Interrupted = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::WriteClosed,
            2 => State::Interrupted,
            _ => State::Open,
        }
    }
}

struct Inner {
    queue: Mutex<VecDeque<MultiBuffer>>,
    queued_bytes: std::sync::atomic::AtomicU64,
    state: AtomicU8,
    limit: Option<u64>,
    discard_overflow: bool,
    on_transmission: Mutex<Option<TransmissionHook>>,
    data_ready: Notify,
    space_ready: Notify,
}

impl Inner {
    fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn apply_hook(&self, mb: MultiBuffer) -> MultiBuffer {
        let hook = self.on_transmission.lock().expect("on_transmission mutex poisoned").clone();
        match hook {
            Some(f) => f(mb),
            None => mb,
        }
    }
}

/// One direction's reader handle. Exactly one exists per pipe; dropping it
/// behaves as if `interrupt()` had been called on the writer side.
pub struct PipeReader {
    inner: Arc<Inner>,
}

/// One direction's writer handle. Exactly one exists per pipe. Dropping it
/// performs a graceful `close()`.
pub struct PipeWriter {
    inner: Arc<Inner>,
}

/// Object-safe write side of a pipe. `PipeWriter` is the base
/// implementation; rate limiting and per-user byte counters (§4.C, §4.E)
/// are decorators implementing this same trait so they can stand in for a
/// `Link`'s writer without changing `Link`'s shape.
pub trait PipeWrite: Send + Sync {
    fn write<'a>(&'a self, mb: MultiBuffer) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>>;
    fn close(&self);
    fn interrupt(&self);
}

impl PipeWrite for PipeWriter {
    fn write<'a>(&'a self, mb: MultiBuffer) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>> {
        Box::pin(PipeWriter::write(self, mb))
    }

    fn close(&self) {
        PipeWriter::close(self)
    }

    fn interrupt(&self) {
        PipeWriter::interrupt(self)
    }
}

/// Object-safe read side of a pipe, mirroring [`PipeWrite`]. The content
/// sniffer's `CachedReader` (§4.D) implements this so it can stand in as a
/// `Link`'s reader for the remainder of a flow once sniffing completes.
pub trait PipeRead: Send + Sync {
    fn read<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>>;
    fn interrupt(&self);

    /// As `read`, but fails with `ReadTimeout` if no data arrives within
    /// `d`. Implementors with a cheaper native timeout should override this.
    fn read_timeout<'a>(&'a self, d: Duration) -> Pin<Box<dyn Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            match timeout(d, self.read()).await {
                Ok(res) => res,
                Err(_) => Err(CoreError::ReadTimeout),
            }
        })
    }
}

impl PipeWrite for Box<dyn PipeWrite> {
    fn write<'a>(&'a self, mb: MultiBuffer) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>> {
        (**self).write(mb)
    }

    fn close(&self) {
        (**self).close()
    }

    fn interrupt(&self) {
        (**self).interrupt()
    }
}

impl PipeRead for Box<dyn PipeRead> {
    fn read<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>> {
        (**self).read()
    }

    fn interrupt(&self) {
        (**self).interrupt()
    }

    fn read_timeout<'a>(&'a self, d: Duration) -> Pin<Box<dyn Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>> {
        (**self).read_timeout(d)
    }
}

impl PipeRead for PipeReader {
    fn read<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>> {
        Box::pin(PipeReader::read(self))
    }

    fn interrupt(&self) {
        PipeReader::interrupt(self)
    }

    fn read_timeout<'a>(&'a self, d: Duration) -> Pin<Box<dyn Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>> {
        Box::pin(PipeReader::read_timeout(self, d))
    }
}

/// A `(reader, writer)` pair, one direction's end of a bidirectional
/// conduit (§3). A full conduit is two `Link`s whose reader/writer are
/// cross-connected. Both sides are boxed so decorators (rate limiting,
/// traffic counters, the sniffer's cached reader) can be layered on
/// without changing this shape.
pub struct Link {
    pub reader: Box<dyn PipeRead>,
    pub writer: Box<dyn PipeWrite>,
}

/// Build a new pipe, returning its reader and writer handles.
pub fn pipe(options: PipeOptions) -> (PipeReader, PipeWriter) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::new()),
        queued_bytes: std::sync::atomic::AtomicU64::new(0),
        state: AtomicU8::new(State::Open as u8),
        limit: options.size_limit,
        discard_overflow: options.discard_overflow,
        on_transmission: Mutex::new(options.on_transmission),
        data_ready: Notify::new(),
        space_ready: Notify::new(),
    });
    (PipeReader { inner: inner.clone() }, PipeWriter { inner })
}

/// Build a pipe and wrap it directly as a `Link`.
pub fn link(options: PipeOptions) -> Link {
    let (reader, writer) = pipe(options);
    Link { reader: Box::new(reader), writer: Box::new(writer) }
}

fn release_all(queue: &mut VecDeque<MultiBuffer>) {
    for mut mb in queue.drain(..) {
        mb.release_all();
    }
}

impl PipeWriter {
    /// Install (or replace) the `OnTransmission` hook for this pipe.
    pub fn set_on_transmission(&self, hook: TransmissionHook) {
        *self.inner.on_transmission.lock().expect("on_transmission mutex poisoned") = Some(hook);
    }

    /// Append `mb` to the queue. Suspends while the pipe is full unless
    /// `DiscardOverflow` is set; `Unbounded` pipes never suspend.
    pub async fn write(&self, mb: MultiBuffer) -> Result<(), CoreError> {
        let mut mb = self.inner.apply_hook(mb);
        let len = mb.len() as u64;

        loop {
            match self.inner.state() {
                State::Interrupted => {
                    mb.release_all();
                    return Err(CoreError::PipeInterrupted);
                },
                State::WriteClosed => return Err(CoreError::ClosedPipe),
                State::Open => {},
            }

            let Some(limit) = self.inner.limit else {
                break;
            };
            let current = self.inner.queued_bytes.load(Ordering::Acquire);
            if current + len <= limit {
                break;
            }
            if self.inner.discard_overflow {
                debug!(len, limit, "pipe discarding overflow write");
                mb.release_all();
                return Ok(());
            }

            let notified = self.inner.space_ready.notified();
            // Re-check state/space after registering for notification to
            // avoid a missed-wakeup race against a concurrent drain.
            let current = self.inner.queued_bytes.load(Ordering::Acquire);
            if current + len <= limit || self.inner.state() != State::Open {
                continue;
            }
            notified.await;
        }

        {
            let mut q = self.inner.queue.lock().expect("pipe queue mutex poisoned");
            q.push_back(mb);
        }
        self.inner.queued_bytes.fetch_add(len, Ordering::AcqRel);
        self.inner.data_ready.notify_one();
        Ok(())
    }

    /// Transition to `WriteClosed`. Idempotent.
    pub fn close(&self) {
        if self.inner.state() == State::Open {
            self.inner.set_state(State::WriteClosed);
        }
        self.inner.data_ready.notify_waiters();
    }

    /// Transition to `Interrupted`: queued data is released, both sides
    /// observe failure.
    pub fn interrupt(&self) {
        self.inner.set_state(State::Interrupted);
        let mut q = self.inner.queue.lock().expect("pipe queue mutex poisoned");
        release_all(&mut q);
        self.inner.queued_bytes.store(0, Ordering::Release);
        drop(q);
        self.inner.data_ready.notify_waiters();
        self.inner.space_ready.notify_waiters();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl PipeReader {
    pub fn set_on_transmission(&self, hook: TransmissionHook) {
        *self.inner.on_transmission.lock().expect("on_transmission mutex poisoned") = Some(hook);
    }

    /// Drain and merge all queued `MultiBuffer`s, suspending until data
    /// arrives or the pipe closes/is interrupted.
    pub async fn read(&self) -> Result<MultiBuffer, CoreError> {
        loop {
            if let Some(merged) = self.try_drain() {
                return Ok(merged);
            }
            match self.inner.state() {
                State::Interrupted => return Err(CoreError::PipeInterrupted),
                State::WriteClosed => return Err(CoreError::EndOfStream),
                State::Open => {},
            }

            let notified = self.inner.data_ready.notified();
            if self.try_drain().is_some() || self.inner.state() != State::Open {
                continue;
            }
            notified.await;
        }
    }

    /// As `read`, but fails with `ReadTimeout` if no data arrives within
    /// `d`.
    pub async fn read_timeout(&self, d: Duration) -> Result<MultiBuffer, CoreError> {
        match timeout(d, self.read()).await {
            Ok(res) => res,
            Err(_) => Err(CoreError::ReadTimeout),
        }
    }

    fn try_drain(&self) -> Option<MultiBuffer> {
        let mut q = self.inner.queue.lock().expect("pipe queue mutex poisoned");
        if q.is_empty() {
            return None;
        }
        let mut merged = MultiBuffer::new();
        for part in q.drain(..) {
            merged.merge(part);
        }
        drop(q);
        self.inner.queued_bytes.store(0, Ordering::Release);
        self.inner.space_ready.notify_waiters();
        Some(merged)
    }

    /// Same semantics as `PipeWriter::interrupt` — either side may call it.
    pub fn interrupt(&self) {
        self.inner.set_state(State::Interrupted);
        let mut q = self.inner.queue.lock().expect("pipe queue mutex poisoned");
        release_all(&mut q);
        self.inner.queued_bytes.store(0, Ordering::Release);
        drop(q);
        self.inner.data_ready.notify_waiters();
        self.inner.space_ready.notify_waiters();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.interrupt();
    }
}
