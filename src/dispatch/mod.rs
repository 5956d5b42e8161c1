// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatcher (§4.E): glues buffer pipes, content sniffing, routing, and
//! an outbound handler together. `Dispatcher::dispatch` is the single
//! entry point every inbound protocol calls once it has accepted a flow;
//! `dispatch_link` is the variant used by the Mux server, which already
//! owns a fully-wired outbound `Link` and only needs routing/handoff.

pub mod counting;
pub mod ctx;
pub mod fakedns_udp;
pub mod traits;

use std::sync::Arc;

use tracing::{info, warn};

pub use ctx::{DispatchTarget, RequestCtx, SniffingRequest, UserContext};
pub use traits::{
    Counter, DnsClient, FakeDnsEngine, HostsLookup, OutboundHandler, OutboundHandlerRegistry, Policy, PolicyManager, Route,
    Router, RoutingCtx, StatsManager,
};

use crate::{
    destination::{Address, Network},
    error::CoreError,
    pipe::{self, Link, PipeOptions, PipeWrite},
    sniff::{self, CachedReader, OverrideMode, SniffOutcome, Sniffer},
};

/// Everything the dispatcher needs to resolve a flow (§6 external
/// collaborators). All fields beyond `outbounds` are optional: a minimal
/// deployment can run with just a default outbound handler.
pub struct Dispatcher {
    pub outbounds: Arc<dyn OutboundHandlerRegistry>,
    pub router: Option<Arc<dyn Router>>,
    pub policy: Option<Arc<dyn PolicyManager>>,
    pub stats: Option<Arc<dyn StatsManager>>,
    pub dns: Option<Arc<dyn DnsClient>>,
    pub sniffers: Vec<Arc<dyn Sniffer>>,
    pub pipe_options: PipeOptions,
    pub sniff_cache_limit: usize,
    pub sniff_probe_timeout: std::time::Duration,
    /// Per-user token-bucket defaults (§4.C), consulted when a user's
    /// `Policy::rate_limited` is set.
    pub default_rate_bytes_per_sec: u64,
    pub default_burst_bytes: u64,
}

impl Dispatcher {
    pub fn new(outbounds: Arc<dyn OutboundHandlerRegistry>) -> Self {
        Self {
            outbounds,
            router: None,
            policy: None,
            stats: None,
            dns: None,
            sniffers: Vec::new(),
            pipe_options: PipeOptions::default(),
            sniff_cache_limit: 8192,
            sniff_probe_timeout: sniff::SNIFF_READ_BUDGET,
            default_rate_bytes_per_sec: 0,
            default_burst_bytes: 0,
        }
    }

    /// Construct an uplink pipe and a downlink pipe, return the
    /// inbound-facing `Link`, and spawn a task that sniffs (if configured)
    /// and then runs `routed_dispatch` on the outbound-facing `Link`
    /// (§4.E).
    pub fn dispatch(self: &Arc<Self>, ctx: RequestCtx, target: DispatchTarget) -> Link {
        validate_destination(&target.transport).expect("dispatch() requires a valid destination");

        let (uplink_reader, uplink_writer) = pipe::pipe(self.pipe_options.clone());
        let (downlink_reader, downlink_writer) = pipe::pipe(self.pipe_options.clone());

        if target.transport.network == Network::Udp {
            if let Some(dns) = &self.dns {
                fakedns_udp::install_udp_fakedns_hooks(&uplink_writer, &downlink_writer, dns.clone());
            }
        }

        let inbound_writer = self.wrap_inbound_writer(&ctx, Box::new(uplink_writer));
        let outbound_writer = self.wrap_outbound_writer(&ctx, Box::new(downlink_writer));

        let inbound_link = Link { reader: Box::new(downlink_reader), writer: inbound_writer };
        let outbound_link = Link { reader: Box::new(uplink_reader), writer: outbound_writer };

        self.spawn_flow(ctx, target, outbound_link);
        inbound_link
    }

    /// As `dispatch`, but the caller supplies the outbound-facing `Link`
    /// directly (§4.E: used by the Mux server to avoid an extra pipe
    /// layer). Unlike `dispatch`, a bad destination is the peer's fault,
    /// not this process's, so it comes back as `InvalidDestination` rather
    /// than a panic.
    pub fn dispatch_link(self: &Arc<Self>, ctx: RequestCtx, target: DispatchTarget, outbound_link: Link) -> Result<(), CoreError> {
        validate_destination(&target.transport)?;
        self.spawn_flow(ctx, target, outbound_link);
        Ok(())
    }

    fn spawn_flow(self: &Arc<Self>, ctx: RequestCtx, target: DispatchTarget, outbound_link: Link) {
        let dispatcher = self.clone();
        let mut ctx = ctx;
        let mut target = target;
        tokio::spawn(async move {
            let outbound_link = if ctx.sniffing.enabled {
                match dispatcher.run_sniffing(&mut ctx, &mut target, outbound_link).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(error = %e, "sniffing failed, tearing down flow");
                        return;
                    },
                }
            } else {
                outbound_link
            };

            if let Err(e) = dispatcher.routed_dispatch(&mut ctx, target, outbound_link).await {
                if !e.is_routine() {
                    warn!(error = %e, "dispatch failed");
                }
            }
        });
    }

    /// Wrap the inbound side's writer (uplink) in a size-counting
    /// decorator when the user's policy enables uplink stats (§4.E), then
    /// in a token-bucket decorator when it enables rate limiting (§4.C).
    fn wrap_inbound_writer(&self, ctx: &RequestCtx, writer: Box<dyn PipeWrite>) -> Box<dyn PipeWrite> {
        let writer = self.maybe_wrap_counter(ctx, writer, "uplink", |p| p.stats_user_uplink);
        self.maybe_wrap_rate_limit(ctx, writer)
    }

    fn maybe_wrap_rate_limit(&self, ctx: &RequestCtx, writer: Box<dyn PipeWrite>) -> Box<dyn PipeWrite> {
        let (Some(user), Some(policy_mgr)) = (ctx.user.as_ref(), self.policy.as_ref()) else {
            return writer;
        };
        if user.email.is_empty() || !policy_mgr.policy_for_level(user.level).rate_limited {
            return writer;
        }
        let bucket = crate::ratelimit::bucket_for_user(&user.email, self.default_rate_bytes_per_sec, self.default_burst_bytes);
        Box::new(crate::ratelimit::RateLimitedWriter::new(writer, bucket, ctx.cancel.clone()))
    }

    /// Wrap the outbound side's writer (downlink) in a size-counting
    /// decorator when the user's policy enables downlink stats (§4.E).
    fn wrap_outbound_writer(&self, ctx: &RequestCtx, writer: Box<dyn PipeWrite>) -> Box<dyn PipeWrite> {
        self.maybe_wrap_counter(ctx, writer, "downlink", |p| p.stats_user_downlink)
    }

    fn maybe_wrap_counter(
        &self,
        ctx: &RequestCtx,
        writer: Box<dyn PipeWrite>,
        direction: &str,
        enabled: impl Fn(&Policy) -> bool,
    ) -> Box<dyn PipeWrite> {
        let (Some(user), Some(policy_mgr), Some(stats)) = (ctx.user.as_ref(), self.policy.as_ref(), self.stats.as_ref()) else {
            return writer;
        };
        if user.email.is_empty() {
            return writer;
        }
        let policy = policy_mgr.policy_for_level(user.level);
        if !enabled(&policy) {
            return writer;
        }
        let counter = stats.get_or_register_counter(&format!("user>>>{}>>>traffic>>>{}", user.email, direction));
        Box::new(counting::CountingWriter::new(writer, counter))
    }

    /// Wrap the outbound reader in a `CachedReader`, run the sniff loop,
    /// and — on a match the caller's override policy accepts — rewrite
    /// `target` (§4.D). Returns a `Link` whose reader is the `CachedReader`
    /// so the outbound handler still sees the full original stream.
    async fn run_sniffing(&self, ctx: &mut RequestCtx, target: &mut DispatchTarget, outbound_link: Link) -> Result<Link, CoreError> {
        let Link { reader, writer } = outbound_link;
        let cached = CachedReader::with_read_budget(reader, self.sniff_cache_limit, self.sniff_probe_timeout);

        match sniff::run_sniff_loop(&cached, &self.sniffers, &ctx.cancel).await {
            Ok(SniffOutcome::Matched { protocol, domain }) => {
                if sniff::should_override(&domain, &protocol, &ctx.sniffing.exclude_domains, &ctx.sniffing.override_protocols) {
                    let transport_is_fakedns_ip = self.is_fakedns_ip(&target.transport.address);
                    let mode = sniff::resolve_override_mode(&protocol, ctx.sniffing.override_mode, transport_is_fakedns_ip);
                    match mode {
                        OverrideMode::Full => {
                            target.transport.address = Address::Domain(domain);
                            target.route = None;
                        },
                        OverrideMode::RouteOnly => {
                            target.route = Some(crate::destination::Destination {
                                network: target.transport.network,
                                address: Address::Domain(domain),
                                port: target.transport.port,
                            });
                        },
                    }
                }
            },
            Ok(SniffOutcome::NoDecision) => {},
            Err(e) => return Err(e),
        }

        Ok(Link { reader: Box::new(cached), writer })
    }

    fn is_fakedns_ip(&self, address: &Address) -> bool {
        let Some(fakedns) = self.dns.as_ref().and_then(|d| d.fakedns()) else {
            return false;
        };
        let ip = match address {
            Address::V4(v4) => std::net::IpAddr::V4(*v4),
            Address::V6(v6) => std::net::IpAddr::V6(*v6),
            Address::Domain(_) => return false,
        };
        fakedns.is_ip_in_pool(ip)
    }

    /// The core routing and handoff algorithm (§4.E `routed_dispatch`).
    async fn routed_dispatch(&self, ctx: &mut RequestCtx, mut target: DispatchTarget, outbound_link: Link) -> Result<(), CoreError> {
        self.rewrite_via_hosts(&mut target);

        let (handler, pick_mode) = match self.select_handler(ctx, &target) {
            Ok(h) => h,
            Err(e) => {
                outbound_link.writer.interrupt();
                outbound_link.reader.interrupt();
                return Err(e);
            },
        };

        info!(
            inbound_tag = ctx.inbound_tag.as_deref().unwrap_or("-"),
            outbound_tag = handler.tag(),
            pick_mode,
            target = %target.transport,
            "dispatching flow"
        );

        handler.dispatch(&target.transport, outbound_link).await
    }

    fn rewrite_via_hosts(&self, target: &mut DispatchTarget) {
        let Some(hosts) = self.dns.as_ref().and_then(|d| d.hosts()) else {
            return;
        };
        if let Some(route) = target.route.as_mut() {
            if let Address::Domain(d) = &route.address {
                if let Some(ip) = hosts.lookup(d) {
                    route.address = ip_to_address(ip);
                }
            }
        } else if let Address::Domain(d) = &target.transport.address {
            if let Some(ip) = hosts.lookup(d) {
                target.transport.address = ip_to_address(ip);
            }
        }
    }

    fn select_handler(&self, ctx: &mut RequestCtx, target: &DispatchTarget) -> Result<(Arc<dyn OutboundHandler>, &'static str), CoreError> {
        if let Some(tag) = ctx.forced_outbound_tag.take() {
            return self.outbounds.get(&tag).map(|h| (h, "forced")).ok_or(CoreError::HandlerNotFound(tag));
        }

        if let Some(router) = &self.router {
            let routing_ctx = RoutingCtx { destination: target.routing_destination(), inbound_tag: ctx.inbound_tag.as_deref() };
            if let Some(route) = router.pick(&routing_ctx) {
                if let Some(h) = self.outbounds.get(&route.outbound_tag) {
                    return Ok((h, "route"));
                }
            }
        }

        self.outbounds
            .default_handler()
            .map(|h| (h, "default"))
            .ok_or_else(|| CoreError::HandlerNotFound("default".to_string()))
    }
}

/// A destination this core cannot act on: no network to speak to, or a
/// domain name with nothing in it. §7 treats this as a caller bug for
/// `dispatch()` (process-local, so it panics) and a peer-supplied fault
/// for `dispatch_link()` (surfaced as `CoreError::InvalidDestination`).
fn validate_destination(target: &crate::destination::Destination) -> Result<(), CoreError> {
    if target.network == Network::Unknown {
        return Err(CoreError::InvalidDestination(format!("destination {target} has no network")));
    }
    if let Address::Domain(d) = &target.address {
        if d.is_empty() {
            return Err(CoreError::InvalidDestination("destination domain is empty".to_string()));
        }
    }
    Ok(())
}

fn ip_to_address(ip: std::net::IpAddr) -> Address {
    match ip {
        std::net::IpAddr::V4(v4) => Address::V4(v4),
        std::net::IpAddr::V6(v6) => Address::V6(v6),
    }
}
