// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Mux server side (§4.I): de-frames substreams off one underlying
//! transport connection and re-dispatches each as a fresh outbound flow,
//! the peer of `client::ClientWorker`.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    buffer::MultiBuffer,
    destination::{Destination, Network},
    dispatch::{DispatchTarget, Dispatcher, RequestCtx},
    error::CoreError,
    mux::{
        frame::{FrameMetadata, FrameReader, FrameStatus, FrameWriter, SessionFrame},
        session::{Session, SessionManager, TransferType},
        xudp::{self, XudpState},
    },
    pipe::{self, Link, PipeOptions, PipeRead, PipeReader, PipeWrite, PipeWriter},
};

/// One underlying transport connection carrying many Mux substreams
/// admitted from the peer, each re-dispatched through `dispatcher`.
pub struct ServerWorker {
    manager: Arc<SessionManager>,
    frame_writer: Arc<FrameWriter>,
    dispatcher: Arc<Dispatcher>,
    pipe_options: PipeOptions,
    reverse_mux: bool,
    idle_close_after: Duration,
    xudp_sweep_interval: Duration,
    done: Arc<Notify>,
    closed: AtomicBool,
}

impl ServerWorker {
    /// Take ownership of a fresh underlying `Link` and start its read and
    /// idle-monitor tasks.
    pub fn spawn(link: Link, dispatcher: Arc<Dispatcher>, pipe_options: PipeOptions, reverse_mux: bool) -> Arc<Self> {
        Self::spawn_with_mux_timing(link, dispatcher, pipe_options, reverse_mux, Duration::from_secs(60), Duration::from_secs(60))
    }

    /// As `spawn`, but with explicit idle-close and XUDP sweep intervals
    /// (§9), normally sourced from `MuxConfig`.
    pub fn spawn_with_mux_timing(
        link: Link,
        dispatcher: Arc<Dispatcher>,
        pipe_options: PipeOptions,
        reverse_mux: bool,
        idle_close_after: Duration,
        xudp_sweep_interval: Duration,
    ) -> Arc<Self> {
        let frame_writer = Arc::new(FrameWriter::new(link.writer));
        let frame_reader = FrameReader::new(link.reader);
        let worker = Arc::new(Self {
            manager: Arc::new(SessionManager::new()),
            frame_writer,
            dispatcher,
            pipe_options,
            reverse_mux,
            idle_close_after,
            xudp_sweep_interval,
            done: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });

        let read_worker = worker.clone();
        tokio::spawn(async move { read_worker.read_loop(frame_reader).await });

        let monitor_worker = worker.clone();
        tokio::spawn(async move { monitor_worker.idle_monitor().await });

        worker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn read_loop(self: Arc<Self>, mut frame_reader: FrameReader) {
        loop {
            let manager = self.manager.clone();
            let reverse_mux = self.reverse_mux;
            let result = frame_reader.read_frame(move |id| manager.get(id).map(|s| s.network), reverse_mux).await;
            match result {
                Ok(frame) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        warn!(error = %e, "mux server tearing down connection");
                        break;
                    }
                },
                Err(e) => {
                    debug!(error = %e, "mux server underlying link ended");
                    break;
                },
            }
        }
        self.manager.close();
        self.frame_writer.close();
        self.closed.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    async fn handle_frame(self: &Arc<Self>, frame: SessionFrame) -> Result<(), CoreError> {
        match frame.meta.status {
            FrameStatus::KeepAlive => Ok(()),
            FrameStatus::New => self.handle_new(frame.meta, frame.payload).await,
            FrameStatus::Keep => self.handle_keep(frame.meta, frame.payload).await,
            FrameStatus::End => {
                if let Some(session) = self.manager.remove(frame.meta.session_id) {
                    session.close_input();
                }
                Ok(())
            },
        }
    }

    async fn handle_new(self: &Arc<Self>, meta: FrameMetadata, payload: Option<MultiBuffer>) -> Result<(), CoreError> {
        let Some(target) = meta.target.clone() else {
            return Err(CoreError::MalformedFrame("New frame missing target".into()));
        };

        if target.network == Network::Udp {
            if let Some(global_id) = meta.global_id {
                if global_id != [0u8; 8] {
                    self.handle_xudp_new(meta.session_id, target, global_id, payload).await;
                    return Ok(());
                }
            }
        }

        self.spawn_session(meta.session_id, target, payload);
        Ok(())
    }

    async fn handle_keep(&self, meta: FrameMetadata, payload: Option<MultiBuffer>) -> Result<(), CoreError> {
        let Some(session) = self.manager.get(meta.session_id) else {
            // Unknown session: tell the peer to stop sending on it rather
            // than tearing down the whole connection.
            let synth_end = SessionFrame { meta: FrameMetadata::end(meta.session_id, false), payload: None };
            let _ = self.frame_writer.write_frame(&synth_end).await;
            return Ok(());
        };

        if let Some(target) = &meta.target {
            if target.network != session.network {
                return Err(CoreError::NetworkMismatch { expected: session.network, got: target.network });
            }
        }

        if let Some(payload) = payload {
            if session.deliver(payload).await.is_err() {
                session.close_input();
                self.manager.remove(meta.session_id);
            }
        }
        Ok(())
    }

    /// Build the pipes the dispatcher needs, admit the session, hand it
    /// off to `dispatch_link`, and spawn the two copier tasks that relay
    /// between the session's Keep frames and the dispatched flow.
    fn spawn_session(self: &Arc<Self>, session_id: u16, target: Destination, first_payload: Option<MultiBuffer>) {
        let transfer_type = TransferType::for_network(target.network);
        let (session, input_reader) = self.manager.admit(session_id, target.clone(), transfer_type);

        let (uplink_reader, uplink_writer) = pipe::pipe(self.pipe_options.clone());
        let (downlink_reader, downlink_writer) = pipe::pipe(self.pipe_options.clone());
        let outbound_link = Link { reader: Box::new(uplink_reader), writer: Box::new(downlink_writer) };

        let ctx = RequestCtx::new(CancellationToken::new());
        if let Err(e) = self.dispatcher.dispatch_link(ctx, DispatchTarget::new(target), outbound_link) {
            warn!(error = %e, session_id, "mux server refused to dispatch New frame");
            self.manager.remove(session_id);
            return;
        }

        Self::spawn_uplink_relay(input_reader, uplink_writer, first_payload);

        let output_worker = self.clone();
        tokio::spawn(async move { output_worker.emit_output(session, downlink_reader).await });
    }

    async fn handle_xudp_new(self: &Arc<Self>, session_id: u16, target: Destination, global_id: [u8; 8], first_payload: Option<MultiBuffer>) {
        xudp::ensure_sweeper_started(self.xudp_sweep_interval);

        let transfer_type = TransferType::for_network(target.network);
        let (session, input_reader) = self.manager.admit(session_id, target.clone(), transfer_type);

        if let Some(existing) = xudp::get(global_id) {
            match existing.state() {
                XudpState::Active => {
                    if let Some(prev) = existing.detach() {
                        prev.close_input();
                        self.manager.remove(prev.id);
                    }
                    existing.attach(session.clone());
                    if let Some(payload) = first_payload {
                        let _ = existing.writer().write(payload).await;
                    }
                    Self::spawn_xudp_relay(input_reader, existing.writer());
                    return;
                },
                XudpState::Initializing => {
                    // A dispatch for this GlobalID is already in flight:
                    // tell this New frame's session to retry later rather
                    // than racing the first dispatch (§9).
                    self.manager.remove(session_id);
                    let _ = self.frame_writer.write_frame(&SessionFrame { meta: FrameMetadata::end(session_id, false), payload: None }).await;
                    return;
                },
                XudpState::Expiring => {
                    xudp::remove(&global_id);
                },
            }
        }

        let (uplink_reader, uplink_writer) = pipe::pipe(self.pipe_options.clone());
        let (downlink_reader, downlink_writer) = pipe::pipe(self.pipe_options.clone());
        let outbound_link = Link { reader: Box::new(uplink_reader), writer: Box::new(downlink_writer) };

        let ctx = RequestCtx::new(CancellationToken::new());
        if let Err(e) = self.dispatcher.dispatch_link(ctx, DispatchTarget::new(target), outbound_link) {
            warn!(error = %e, session_id, "mux server refused to dispatch XUDP New frame");
            self.manager.remove(session_id);
            return;
        }

        let entry_link = Link { reader: Box::new(downlink_reader), writer: Box::new(uplink_writer) };
        let entry = xudp::insert(global_id, entry_link, self.frame_writer.clone(), session.clone());
        if let Some(payload) = first_payload {
            let _ = entry.writer().write(payload).await;
        }
        entry.attach(session.clone());
        Self::spawn_xudp_relay(input_reader, entry.writer());
    }

    /// Writes `first_payload` (if any) then relays everything Keep-framed
    /// into `session.input` on to `uplink_writer`, the pipe the dispatched
    /// handler reads from.
    fn spawn_uplink_relay(input_reader: PipeReader, uplink_writer: PipeWriter, first_payload: Option<MultiBuffer>) {
        tokio::spawn(async move {
            if let Some(payload) = first_payload {
                if uplink_writer.write(payload).await.is_err() {
                    return;
                }
            }
            loop {
                match input_reader.read().await {
                    Ok(mb) => {
                        if uplink_writer.write(mb).await.is_err() {
                            break;
                        }
                    },
                    Err(_) => break,
                }
            }
            uplink_writer.close();
        });
    }

    /// As `spawn_uplink_relay`, but forwards into an XUDP entry's shared
    /// writer instead of a privately-owned pipe, so resumption can retarget
    /// `writer` without touching this task.
    fn spawn_xudp_relay(input_reader: PipeReader, writer: Arc<dyn PipeWrite>) {
        tokio::spawn(async move {
            loop {
                match input_reader.read().await {
                    Ok(mb) => {
                        if writer.write(mb).await.is_err() {
                            break;
                        }
                    },
                    Err(_) => break,
                }
            }
        });
    }

    async fn emit_output(&self, session: Arc<Session>, downlink_reader: PipeReader) {
        let mut had_error = false;
        loop {
            match downlink_reader.read().await {
                Ok(mb) => {
                    if self.write_keep_chunks(&session, mb).await.is_err() {
                        had_error = true;
                        break;
                    }
                },
                Err(CoreError::EndOfStream) => break,
                Err(_) => {
                    had_error = true;
                    break;
                },
            }
        }
        let _ = self.frame_writer.write_frame(&SessionFrame { meta: FrameMetadata::end(session.id, had_error), payload: None }).await;
        self.manager.remove(session.id);
    }

    async fn write_keep_chunks(&self, session: &Session, mb: MultiBuffer) -> Result<(), CoreError> {
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

    async fn idle_monitor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.idle_close_after).await;
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
