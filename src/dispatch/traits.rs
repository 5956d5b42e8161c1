// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! External collaborator traits the dispatcher consumes (§6): routing,
//! outbound registration, per-level policy, stats, and DNS/FakeDNS. The
//! core only calls these interfaces; it never implements routing rules,
//! DNS resolution, or statistics storage itself.

use std::{future::Future, net::IpAddr, pin::Pin, sync::Arc};

use crate::{destination::Destination, error::CoreError, pipe::Link};

/// Routing lookup key handed to a [`Router`].
pub struct RoutingCtx<'a> {
    pub destination: &'a Destination,
    pub inbound_tag: Option<&'a str>,
}

/// Outcome of a route lookup: the tag of the outbound handler to use.
#[derive(Debug, Clone)]
pub struct Route {
    pub outbound_tag: String,
}

/// Routing rule evaluation, injected by the outer layer (§1: out of scope
/// for the core).
pub trait Router: Send + Sync {
    fn pick(&self, ctx: &RoutingCtx<'_>) -> Option<Route>;
}

/// One outbound protocol implementation (§6): connects (or, for Mux,
/// re-dispatches) a `Link` toward `target`.
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    fn dispatch<'a>(
        &'a self,
        target: &'a Destination,
        link: Link,
    ) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>>;
}

/// Lookup table of registered outbound handlers, plus the configured
/// fallback (§6).
pub trait OutboundHandlerRegistry: Send + Sync {
    fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>>;
    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>>;
}

/// Per-level policy: whether this user's traffic is counted, and any
/// associated timeouts (only the stats flags are consumed by the
/// dispatcher; timeouts are carried for the outer layer's benefit).
#[derive(Debug, Clone, Copy, Default)]
pub struct Policy {
    pub stats_user_uplink: bool,
    pub stats_user_downlink: bool,
    /// Whether this user's uplink is metered against the dispatcher's
    /// default per-user token bucket (§4.C).
    pub rate_limited: bool,
}

pub trait PolicyManager: Send + Sync {
    fn policy_for_level(&self, level: u32) -> Policy;
}

/// A single named, monotonically-adjustable counter.
pub trait Counter: Send + Sync {
    fn add(&self, n: i64);
}

/// Registry of named counters (§6), e.g. `"user>>>alice@example.com>>>traffic>>>uplink"`.
pub trait StatsManager: Send + Sync {
    fn get_or_register_counter(&self, name: &str) -> Arc<dyn Counter>;
}

/// Static domain→IP overrides consulted before routing (§4.E step 1).
pub trait HostsLookup: Send + Sync {
    fn lookup(&self, domain: &str) -> Option<IpAddr>;
}

/// Synthetic-IP allocator used to carry domain identity through UDP paths
/// that only forward IP addresses (§4.E, §4.D metadata sniffer).
pub trait FakeDnsEngine: Send + Sync {
    fn get_domain_from_ip(&self, ip: IpAddr) -> Option<String>;
    fn get_fake_ip_for_domain(&self, domain: &str) -> IpAddr;
    fn is_ip_in_pool(&self, ip: IpAddr) -> bool;
}

/// DNS resolution, injected by the outer layer.
pub trait DnsClient: Send + Sync {
    fn lookup_ip<'a>(&'a self, domain: &'a str) -> Pin<Box<dyn Future<Output = Vec<IpAddr>> + Send + 'a>>;

    fn hosts(&self) -> Option<&dyn HostsLookup> {
        None
    }

    fn fakedns(&self) -> Option<&dyn FakeDnsEngine> {
        None
    }
}
