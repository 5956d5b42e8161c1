// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Mux protocol (§2 components F-I, §4.F-§4.I): multiplexes many logical
//! flows as framed substreams of a small pool of underlying transport
//! connections. An outbound handler that sees [`Destination::mux_cool`]
//! as its target routes the flow's `Link` into a [`client::ClientWorker`]
//! instead of opening a fresh connection; on the peer, a
//! [`server::ServerWorker`] de-frames each substream and re-dispatches it
//! through a [`crate::dispatch::Dispatcher`].

pub mod client;
pub mod frame;
pub mod server;
pub mod session;
pub mod xudp;

pub use client::{ClientManager, ClientStrategy, ClientWorker};
pub use frame::{FrameFlags, FrameMetadata, FrameReader, FrameStatus, FrameWriter, SessionFrame};
pub use server::ServerWorker;
pub use session::{Session, SessionManager, TransferType};
