// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Content sniffing (§4.D): protocol/domain classifiers over a peeked
//! prefix, plus the override decision that decides whether a sniffed
//! domain replaces the routing/transport target.

mod cached_reader;

pub use cached_reader::{CachedReader, SniffOutcome, run_sniff_loop, MAX_SNIFF_ATTEMPTS, SNIFF_READ_BUDGET};

/// Result of trying one [`Sniffer`] against the current cached prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// Not enough bytes yet to decide.
    NoClue,
    /// Protocol and domain identified.
    Match { protocol: String, domain: String },
    /// Hard failure; the sniff loop stops entirely (§4.D).
    Error,
}

/// A classifier that inspects the initial bytes of a flow.
pub trait Sniffer: Send + Sync {
    fn name(&self) -> &str;
    fn sniff(&self, prefix: &[u8]) -> SniffResult;
}

/// Whether the router-vs-transport override applies to the whole
/// destination or only to the routing lookup (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideMode {
    /// Rewrite both the routing target and the transport target.
    #[default]
    Full,
    /// Rewrite only the value used for routing; outbound handlers still
    /// connect to the original (un-sniffed) address.
    RouteOnly,
}

/// Decide whether a sniffed `(protocol, domain)` should override the
/// destination (§4.D): the domain must be non-empty, absent from
/// `exclude` (case-insensitive), and `protocol` must match one of
/// `override_protocols` via a bidirectional prefix match.
pub fn should_override(domain: &str, protocol: &str, exclude: &[String], override_protocols: &[String]) -> bool {
    if domain.is_empty() {
        return false;
    }
    if exclude.iter().any(|e| e.eq_ignore_ascii_case(domain)) {
        return false;
    }
    override_protocols.iter().any(|p| bidirectional_prefix_match(p, protocol))
}

fn bidirectional_prefix_match(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Resolve the effective override mode for one sniff match (§9 design
/// note, first open question). The source has two divergent behaviours
/// for "FakeDNS+others" ordering vs `RouteOnly`; this picks the later one:
/// a FakeDNS-family protocol always overrides the full destination (that
/// is the point of restoring domain identity over an IP-only path), and
/// every other protocol only gets `RouteOnly` when the transport target
/// is not itself a FakeDNS pool IP — otherwise the caller's requested mode
/// is honoured as-is.
pub fn resolve_override_mode(protocol: &str, requested: OverrideMode, transport_is_fakedns_ip: bool) -> OverrideMode {
    if protocol == "fakedns" || protocol == "fakedns+others" {
        return OverrideMode::Full;
    }
    if transport_is_fakedns_ip {
        return OverrideMode::Full;
    }
    requested
}

/// Outcome of the FakeDNS metadata pre-check (§4.D): the metadata sniffer
/// is tried first and, if it finds the destination IP already in the
/// FakeDNS pool, returns the mapped domain without consuming any bytes. A
/// chained content-sniffer pass only runs when this says `InPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeDnsPrecheck {
    /// No FakeDNS engine configured, or the destination is not an IP.
    NotApplicable,
    /// Destination IP resolves to a domain in the FakeDNS pool.
    InPool { domain: String },
    /// FakeDNS is configured but this IP is not one of its allocations.
    NotInPool,
}
