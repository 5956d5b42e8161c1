// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ambient per-request state (§9 design note): the source carries current
//! inbound/outbound/content/timeouts/FakeDNS-probe state as dynamically
//! typed context values threaded through the whole call stack. This is
//! that state made explicit: a `RequestCtx` with tagged optional fields,
//! passed by `&mut` reference instead of looked up dynamically.

use tokio_util::sync::CancellationToken;

use crate::{destination::Destination, sniff::OverrideMode};

/// Authenticated user identity attached to an inbound session, if any.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub email: String,
    pub level: u32,
}

/// Per-request sniffing configuration (§4.D).
#[derive(Debug, Clone, Default)]
pub struct SniffingRequest {
    pub enabled: bool,
    pub override_protocols: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub override_mode: OverrideMode,
}

/// Ambient state for one dispatched flow. Threaded by `&mut` through
/// `Dispatcher::dispatch`/`routed_dispatch` rather than looked up from a
/// dynamically-typed bag.
pub struct RequestCtx {
    pub inbound_tag: Option<String>,
    /// Set by an inbound protocol that already knows its outbound tag
    /// (e.g. Mux server re-dispatch). Cleared by `routed_dispatch` the
    /// first time it is consulted, matching the source's "clear on read"
    /// semantics.
    pub forced_outbound_tag: Option<String>,
    pub user: Option<UserContext>,
    pub sniffing: SniffingRequest,
    pub cancel: CancellationToken,
}

impl RequestCtx {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inbound_tag: None,
            forced_outbound_tag: None,
            user: None,
            sniffing: SniffingRequest::default(),
            cancel,
        }
    }
}

/// The destination(s) a dispatched flow carries (§4.E step 1, §4.D
/// `RouteOnly`): `transport` is what the outbound handler actually
/// connects to; `route` is populated only when a sniffed domain should
/// steer routing without changing the transport target.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub transport: Destination,
    pub route: Option<Destination>,
}

impl DispatchTarget {
    pub fn new(transport: Destination) -> Self {
        Self { transport, route: None }
    }

    /// The destination routing decisions should be made against: the
    /// `route` override if sniffing set one, else the transport target.
    pub fn routing_destination(&self) -> &Destination {
        self.route.as_ref().unwrap_or(&self.transport)
    }
}
