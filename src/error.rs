// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Semantic error kinds shared across the data-plane (§7 of the design).
//!
//! Leaf modules return [`CoreError`] directly so callers can match on kind
//! (`EndOfStream` is not a failure, `MalformedFrame` is fatal for the whole
//! Mux connection, …). Orchestration code above the leaves wraps these in
//! `anyhow::Error` with call-site context instead of inventing new variants.

use thiserror::Error;

/// Semantic error kinds produced by the core data-plane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Caller supplied a destination the core cannot act on (bad input, not
    /// an invariant violation).
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Normal pipe termination: writer closed and the queue drained.
    #[error("end of stream")]
    EndOfStream,

    /// A bounded read did not complete before its deadline.
    #[error("read timed out")]
    ReadTimeout,

    /// Sniffing did not complete before its own timeout; treated like
    /// `UnknownContent` by the dispatcher.
    #[error("sniffing timed out")]
    SniffingTimeout,

    /// Sniffers exhausted their data budget without a decision.
    #[error("unknown content")]
    UnknownContent,

    /// A pipe side was interrupted; queued data was released.
    #[error("pipe interrupted")]
    PipeInterrupted,

    /// Write attempted on a pipe whose writer already closed it.
    #[error("pipe closed")]
    ClosedPipe,

    /// Mux client could not find or build a worker within the retry budget.
    #[error("no available mux worker")]
    NoAvailableWorker,

    /// Outbound tag did not resolve to a registered handler.
    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    /// Declared network did not match the negotiated/allowed one.
    #[error("network mismatch: expected {expected:?}, got {got:?}")]
    NetworkMismatch {
        expected: crate::destination::Network,
        got: crate::destination::Network,
    },

    /// A Mux frame violated the wire contract (meta_len > 512, unknown
    /// status, bad address encoding). Fatal for the whole Mux connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Read side of a copy failed; wraps the underlying I/O/pipe error so
    /// callers can tell which side of a link failed.
    #[error("read error: {0}")]
    ReadError(String),

    /// Write side of a copy failed.
    #[error("write error: {0}")]
    WriteError(String),
}

impl CoreError {
    /// Whether this error should be logged beyond debug (§7 propagation
    /// policy: `EndOfStream` is routine, everything else is not).
    pub fn is_routine(&self) -> bool {
        matches!(self, CoreError::EndOfStream)
    }
}
