// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide XUDP resumption table (§4.I, §5, §9): lets a server worker
//! hand a reconnecting client's `New` frame the same underlying UDP link it
//! already had open, keyed by the frame's `GlobalID`, instead of opening a
//! fresh outbound connection every time the client's Mux connection drops.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::{
    mux::{
        frame::{FrameMetadata, FrameWriter, SessionFrame},
        session::Session,
    },
    pipe::{Link, PipeRead, PipeWrite},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XudpState {
    /// A dispatch is in flight; conflicting `New` frames for the same
    /// GlobalID are told to retry via an `End` frame rather than racing
    /// the first dispatch.
    Initializing,
    Active,
    /// Marked by the sweeper once its owning session has detached and the
    /// entry has sat idle past the sweep window.
    Expiring,
}

/// One resumable UDP flow: the underlying dispatched `Link`'s writer (to
/// forward newly-arrived payload into it) and a swappable pointer to
/// whichever Mux session currently owns replies from it.
pub struct XudpEntry {
    state: Mutex<XudpState>,
    writer: Arc<dyn PipeWrite>,
    current_session: Mutex<Option<Arc<Session>>>,
    last_active: Mutex<Instant>,
}

impl XudpEntry {
    /// Build an entry and spawn the background task that forwards
    /// downstream packets from `link.reader` into the currently-attached
    /// session as Keep frames written through `frame_writer`.
    fn spawn(link: Link, frame_writer: Arc<FrameWriter>, initial_session: Arc<Session>) -> Arc<Self> {
        let entry = Arc::new(Self {
            state: Mutex::new(XudpState::Initializing),
            writer: Arc::from(link.writer),
            current_session: Mutex::new(Some(initial_session)),
            last_active: Mutex::new(Instant::now()),
        });

        let forwarding = entry.clone();
        let reader = link.reader;
        tokio::spawn(async move { forwarding.forward_loop(reader, frame_writer).await });

        entry
    }

    async fn forward_loop(self: Arc<Self>, reader: Box<dyn PipeRead>, frame_writer: Arc<FrameWriter>) {
        loop {
            match reader.read().await {
                Ok(mb) => {
                    self.touch();
                    let (session_id, target) = {
                        let current = self.current_session.lock().expect("xudp entry mutex poisoned");
                        match current.as_ref() {
                            Some(s) => (s.id, s.target.clone()),
                            None => continue,
                        }
                    };
                    let frame = SessionFrame { meta: FrameMetadata::keep_packet(session_id, target), payload: Some(mb) };
                    if frame_writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                },
                Err(_) => break,
            }
        }
        self.mark_expiring();
    }

    pub fn writer(&self) -> Arc<dyn PipeWrite> {
        self.writer.clone()
    }

    pub fn attach(&self, session: Arc<Session>) {
        *self.current_session.lock().expect("xudp entry mutex poisoned") = Some(session);
        *self.state.lock().expect("xudp entry mutex poisoned") = XudpState::Active;
        self.touch();
    }

    /// Detach whatever session currently owns this entry, returning it so
    /// the caller can close it out on the old connection.
    pub fn detach(&self) -> Option<Arc<Session>> {
        self.current_session.lock().expect("xudp entry mutex poisoned").take()
    }

    pub fn state(&self) -> XudpState {
        *self.state.lock().expect("xudp entry mutex poisoned")
    }

    fn mark_expiring(&self) {
        *self.state.lock().expect("xudp entry mutex poisoned") = XudpState::Expiring;
    }

    fn touch(&self) {
        *self.last_active.lock().expect("xudp entry mutex poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_active.lock().expect("xudp entry mutex poisoned"))
    }
}

/// Process-wide table keyed by the 8-byte GlobalID carried on UDP `New`
/// frames (§5: "the XUDP table is process-wide and protected by a single
/// mutex"; a `DashMap` gives the same guarantee with per-shard locking,
/// matching this crate's other process-wide registries).
pub static XUDP_TABLE: Lazy<DashMap<[u8; 8], Arc<XudpEntry>>> = Lazy::new(DashMap::new);

static SWEEPER_STARTED: AtomicU16 = AtomicU16::new(0);

/// Look up an existing entry, or dispatch-and-register a new one, for
/// `global_id`. Returns `(entry, is_new)`.
pub fn get(global_id: [u8; 8]) -> Option<Arc<XudpEntry>> {
    XUDP_TABLE.get(&global_id).map(|e| e.clone())
}

pub fn insert(global_id: [u8; 8], link: Link, frame_writer: Arc<FrameWriter>, initial_session: Arc<Session>) -> Arc<XudpEntry> {
    let entry = XudpEntry::spawn(link, frame_writer, initial_session);
    XUDP_TABLE.insert(global_id, entry.clone());
    entry
}

pub fn remove(global_id: &[u8; 8]) {
    XUDP_TABLE.remove(global_id);
}

/// Start the background sweeper once per process (§5, §9): every
/// `sweep_interval`, drop `Expiring` entries that have sat idle at least
/// that long. Subsequent calls with a different interval are ignored —
/// the first caller to run wins, matching the table's process-wide scope.
pub fn ensure_sweeper_started(sweep_interval: Duration) {
    if SWEEPER_STARTED.swap(1, Ordering::SeqCst) == 1 {
        return;
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            sweep(sweep_interval);
        }
    });
}

fn sweep(max_idle: Duration) {
    let before = XUDP_TABLE.len();
    XUDP_TABLE.retain(|_, entry| !(entry.state() == XudpState::Expiring && entry.idle_for() >= max_idle));
    let removed = before - XUDP_TABLE.len();
    if removed > 0 {
        debug!(removed, "xudp sweeper evicted expired entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        destination::{Address, Destination, Network},
        mux::{
            frame::FrameReader,
            session::{SessionManager, TransferType},
        },
        pipe,
    };

    fn udp_dest() -> Destination {
        Destination::udp(Address::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), 53)
    }

    #[tokio::test]
    async fn second_global_id_resumes_the_first_entrys_link_under_the_new_session() {
        let mgr = SessionManager::new();
        let (session_a, _reader_a) = mgr.allocate(udp_dest(), TransferType::Packet);

        // `downstream` models the already-dispatched outbound link for this
        // UDP flow; `fw` models the Mux connection frames are re-emitted on.
        let (_downstream_reader, downstream_writer) = pipe::pipe(pipe::PipeOptions::unbounded());
        let (downstream_reply_reader, downstream_reply_writer) = pipe::pipe(pipe::PipeOptions::unbounded());
        let link = Link { reader: Box::new(downstream_reply_reader), writer: Box::new(downstream_writer) };

        let (fw_reader, fw_writer) = pipe::pipe(pipe::PipeOptions::unbounded());
        let frame_writer = Arc::new(crate::mux::frame::FrameWriter::new(fw_writer));
        let mut frame_reader = FrameReader::new(fw_reader);

        let gid = [9u8; 8];
        let entry = insert(gid, link, frame_writer, session_a.clone());
        assert_eq!(entry.state(), XudpState::Initializing);

        // The client reconnects: a second `New` frame with the same
        // GlobalID detaches the stale session and re-attaches under a
        // fresh one, without touching the underlying outbound link.
        let (session_b, _reader_b) = mgr.allocate(udp_dest(), TransferType::Packet);
        let detached = entry.detach();
        assert_eq!(detached.map(|s| s.id), Some(session_a.id));
        entry.attach(session_b.clone());
        assert_eq!(entry.state(), XudpState::Active);

        let mut buf = crate::buffer::Buffer::new();
        buf.write(b"resumed").expect("write");
        downstream_reply_writer
            .write(crate::buffer::MultiBuffer::from_buffer(buf))
            .await
            .expect("deliver reply from the resumed link");

        let frame = frame_reader.read_frame(|_| Some(Network::Udp), false).await.expect("read forwarded frame");
        assert_eq!(frame.meta.session_id, session_b.id);
        assert_eq!(frame.payload.expect("payload").to_vec(), b"resumed");
    }
}
