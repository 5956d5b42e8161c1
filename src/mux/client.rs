// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Mux client side (§4.H): multiplexes many dispatched flows as substreams
//! of a small pool of underlying transport connections ("workers").

use std::{
    sync::{Arc, atomic::{AtomicBool, Ordering}},
    time::Duration,
};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    destination::Destination,
    dispatch::RequestCtx,
    error::CoreError,
    mux::{
        frame::{FrameFlags, FrameMetadata, FrameReader, FrameStatus, FrameWriter, SessionFrame},
        session::{Session, SessionManager, TransferType},
    },
    pipe::{self, Link, PipeOptions, PipeRead, PipeWrite},
};

/// Caps on how many substreams (and how many have ever been minted) one
/// worker may carry before the manager must open another (§4.H).
#[derive(Debug, Clone, Copy)]
pub struct ClientStrategy {
    pub max_concurrency: usize,
    pub max_connection: u64,
    /// How long a worker may sit with no sessions before it closes its
    /// underlying link (§9), normally sourced from
    /// `MuxConfig::client_idle_close_after`.
    pub idle_close_after: Duration,
}

impl Default for ClientStrategy {
    fn default() -> Self {
        Self { max_concurrency: 128, max_connection: 256, idle_close_after: Duration::from_secs(16) }
    }
}

/// One underlying transport connection carrying many Mux substreams.
pub struct ClientWorker {
    manager: Arc<SessionManager>,
    frame_writer: Arc<FrameWriter>,
    strategy: ClientStrategy,
    done: Arc<Notify>,
    closed: AtomicBool,
}

impl ClientWorker {
    /// Take ownership of a fresh underlying `Link` and start its output
    /// (`fetch_output`) and idle-monitor tasks.
    pub fn spawn(link: Link, strategy: ClientStrategy) -> Arc<Self> {
        let frame_writer = Arc::new(FrameWriter::new(link.writer));
        let frame_reader = FrameReader::new(link.reader);
        let worker = Arc::new(Self {
            manager: Arc::new(SessionManager::new()),
            frame_writer,
            strategy,
            done: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });

        let output_worker = worker.clone();
        tokio::spawn(async move { output_worker.fetch_output(frame_reader).await });

        let monitor_worker = worker.clone();
        tokio::spawn(async move { monitor_worker.idle_monitor().await });

        worker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.manager.size() >= self.strategy.max_concurrency || self.manager.snapshot_count() >= self.strategy.max_connection
    }

    /// Allocate a substream for `target` and spawn its `fetch_input` task,
    /// copying `caller_link`'s uplink into Keep frames and its downlink
    /// from whatever this substream receives back. `global_id` is the
    /// XUDP resumption key (§4.I): pass `Some` for a UDP flow that should
    /// be able to resume onto an existing peer-side entry across a fresh
    /// Mux connection, `None` for everything else.
    pub fn dispatch(self: &Arc<Self>, ctx: &RequestCtx, target: Destination, caller_link: Link, global_id: Option<[u8; 8]>) {
        let transfer_type = TransferType::for_network(target.network);
        let (session, input_reader) = self.manager.allocate(target.clone(), transfer_type);
        let worker = self.clone();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move { worker.fetch_input(session, target, caller_link, input_reader, cancel, global_id).await });
    }

    async fn fetch_input(
        self: Arc<Self>,
        session: Arc<Session>,
        target: Destination,
        caller_link: Link,
        input_reader: pipe::PipeReader,
        cancel: CancellationToken,
        global_id: Option<[u8; 8]>,
    ) {
        let Link { reader: caller_reader, writer: caller_writer } = caller_link;

        let relay_task = tokio::spawn(async move {
            loop {
                match input_reader.read().await {
                    Ok(mb) => {
                        if caller_writer.write(mb).await.is_err() {
                            break;
                        }
                    },
                    Err(_) => break,
                }
            }
            caller_writer.close();
        });

        let first = caller_reader.read_timeout(Duration::from_millis(100)).await;
        let (flags, first_payload) = match first {
            Ok(mb) => (FrameFlags::HAS_DATA, Some(mb)),
            Err(_) => (FrameFlags::empty(), None),
        };

        let new_frame = SessionFrame {
            meta: FrameMetadata {
                session_id: session.id,
                status: FrameStatus::New,
                flags,
                target: Some(target),
                inbound_source: None,
                inbound_local: None,
                global_id,
            },
            payload: first_payload,
        };

        if self.frame_writer.write_frame(&new_frame).await.is_err() {
            session.interrupt_input();
            self.manager.remove(session.id);
            relay_task.abort();
            return;
        }

        let mut had_error = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => { had_error = true; break; },
                res = caller_reader.read() => match res {
                    Ok(mb) => {
                        if self.write_keep_chunks(&session, mb).await.is_err() {
                            had_error = true;
                            break;
                        }
                    },
                    Err(CoreError::EndOfStream) => break,
                    Err(_) => { had_error = true; break; },
                },
            }
        }

        let _ = self.frame_writer.write_frame(&SessionFrame { meta: FrameMetadata::end(session.id, had_error), payload: None }).await;
        self.manager.remove(session.id);
        relay_task.abort();
    }

    async fn write_keep_chunks(&self, session: &Session, mb: crate::buffer::MultiBuffer) -> Result<(), CoreError> {
        match session.transfer_type {
            TransferType::Packet => {
                self.frame_writer
                    .write_frame(&SessionFrame { meta: FrameMetadata::keep_packet(session.id, session.target.clone()), payload: Some(mb) })
                    .await
            },
            TransferType::Stream => {
                let mut remaining = mb;
                while !remaining.is_empty() {
                    let take = remaining.len().min(8192);
                    let tail = remaining.split_at(take);
                    let chunk = std::mem::replace(&mut remaining, tail);
                    self.frame_writer.write_frame(&SessionFrame { meta: FrameMetadata::keep_data(session.id), payload: Some(chunk) }).await?;
                }
                Ok(())
            },
        }
    }

    async fn fetch_output(self: Arc<Self>, mut frame_reader: FrameReader) {
        loop {
            let manager = self.manager.clone();
            let result = frame_reader.read_frame(move |id| manager.get(id).map(|s| s.network), false).await;
            match result {
                Ok(frame) => self.handle_output_frame(frame).await,
                Err(e) => {
                    debug!(error = %e, "mux client underlying link ended");
                    break;
                },
            }
        }
        self.manager.close();
        self.closed.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    async fn handle_output_frame(&self, frame: SessionFrame) {
        match frame.meta.status {
            // Drain-only: KeepAlive carries no session-addressed data, and
            // a server-originated New is not meaningful in this variant.
            FrameStatus::KeepAlive | FrameStatus::New => {},
            FrameStatus::Keep => {
                let Some(session) = self.manager.get(frame.meta.session_id) else {
                    let synth_end = SessionFrame { meta: FrameMetadata::end(frame.meta.session_id, false), payload: None };
                    let _ = self.frame_writer.write_frame(&synth_end).await;
                    return;
                };
                if let Some(payload) = frame.payload {
                    if session.deliver(payload).await.is_err() {
                        session.close_input();
                        self.manager.remove(frame.meta.session_id);
                    }
                }
            },
            FrameStatus::End => {
                if let Some(session) = self.manager.remove(frame.meta.session_id) {
                    session.close_input();
                }
            },
        }
    }

    async fn idle_monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.strategy.idle_close_after).await;
            if self.is_closed() {
                return;
            }
            let prev_size = self.manager.size();
            let prev_count = self.manager.snapshot_count();
            if self.manager.close_if_no_session_and_idle(prev_size, prev_count) {
                self.closed.store(true, Ordering::SeqCst);
                self.frame_writer.close();
                self.done.notify_waiters();
                return;
            }
        }
    }
}

/// Pool of `ClientWorker`s for one outbound tag (§4.H lifecycle).
pub struct ClientManager<F> {
    workers: Mutex<Vec<Arc<ClientWorker>>>,
    strategy: ClientStrategy,
    new_underlying_link: F,
}

impl<F> ClientManager<F>
where
    F: Fn() -> Option<Link> + Send + Sync,
{
    pub fn new(strategy: ClientStrategy, new_underlying_link: F) -> Self {
        Self { workers: Mutex::new(Vec::new()), strategy, new_underlying_link }
    }

    /// Pick the first worker that is neither full nor closed; if none
    /// qualify, try to build a new one via the injected factory, retrying
    /// up to 16 times before surfacing `NoAvailableWorker` (§4.H).
    pub async fn dispatch(&self, ctx: &RequestCtx, target: Destination, caller_link: Link, global_id: Option<[u8; 8]>) -> Result<(), CoreError> {
        for _ in 0..16 {
            {
                let mut workers = self.workers.lock().await;
                workers.retain(|w| !w.is_closed());
                if let Some(worker) = workers.iter().find(|w| !w.is_full()) {
                    worker.dispatch(ctx, target, caller_link, global_id);
                    return Ok(());
                }
            }

            let Some(underlying) = (self.new_underlying_link)() else {
                warn!("mux client could not open a new underlying link");
                continue;
            };
            let worker = ClientWorker::spawn(underlying, self.strategy);
            self.workers.lock().await.push(worker);
        }
        Err(CoreError::NoAvailableWorker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, MultiBuffer};

    fn mb_of(s: &[u8]) -> MultiBuffer {
        let mut b = Buffer::new();
        b.write(s).expect("write");
        MultiBuffer::from_buffer(b)
    }

    /// Runs the "server" end of a fake underlying link well enough to
    /// exercise `ClientWorker`: echoes every Keep frame's payload back on
    /// the same session, and closes with `End` once it sees one.
    async fn fake_peer(mut reader: FrameReader, writer: Arc<FrameWriter>) {
        loop {
            match reader.read_frame(|_| None, false).await {
                Ok(frame) => match frame.meta.status {
                    FrameStatus::New | FrameStatus::Keep => {
                        if let Some(payload) = frame.payload {
                            let echo = SessionFrame { meta: FrameMetadata::keep_data(frame.meta.session_id), payload: Some(payload) };
                            if writer.write_frame(&echo).await.is_err() {
                                break;
                            }
                        }
                    },
                    FrameStatus::End => {
                        let _ = writer.write_frame(&SessionFrame { meta: FrameMetadata::end(frame.meta.session_id, false), payload: None }).await;
                    },
                    FrameStatus::KeepAlive => {},
                },
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn dispatch_echoes_payload_back_to_caller() {
        let (underlying_a_reader, underlying_a_writer) = pipe::pipe(PipeOptions::unbounded());
        let (underlying_b_reader, underlying_b_writer) = pipe::pipe(PipeOptions::unbounded());

        // `worker` sees `a` as its reader and `b` as its writer; the fake
        // peer sees the cross-connected ends.
        let worker_link = Link { reader: Box::new(underlying_a_reader), writer: Box::new(underlying_b_writer) };
        let peer_reader = FrameReader::new(underlying_b_reader);
        let peer_writer = Arc::new(FrameWriter::new(underlying_a_writer));
        tokio::spawn(fake_peer(peer_reader, peer_writer));

        let worker = ClientWorker::spawn(worker_link, ClientStrategy::default());

        let (caller_in_reader, caller_in_writer) = pipe::pipe(PipeOptions::unbounded());
        let (caller_out_reader, caller_out_writer) = pipe::pipe(PipeOptions::unbounded());
        let caller_link = Link { reader: Box::new(caller_in_reader), writer: Box::new(caller_out_writer) };

        let ctx = RequestCtx::new(CancellationToken::new());
        worker.dispatch(&ctx, Destination::tcp(crate::destination::Address::Domain("example.com".into()), 80), caller_link, None);

        caller_in_writer.write(mb_of(b"ping")).await.expect("write");
        let got = caller_out_reader.read().await.expect("read echo");
        assert_eq!(got.to_vec(), b"ping");

        caller_in_writer.close();
    }
}
