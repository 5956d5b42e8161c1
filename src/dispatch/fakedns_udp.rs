// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! UDP-over-TCP with FakeDNS (§4.E): installs a per-connection
//! `on_transmission` hook on both halves of a flow so a client that only
//! ever addresses UDP datagrams by IP can still carry domain identity
//! through an outbound handler that dispatches by domain.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use crate::{
    destination::Address,
    dispatch::traits::DnsClient,
    pipe::PipeWriter,
};

/// Per-connection IP⇄domain table built as packets flow through, so the
/// same fake IP is reused consistently for the lifetime of one flow.
struct UdpFakeDnsTable {
    ip_to_domain: Mutex<HashMap<IpAddr, String>>,
    domain_to_ip: Mutex<HashMap<String, IpAddr>>,
}

impl UdpFakeDnsTable {
    fn new() -> Self {
        Self { ip_to_domain: Mutex::new(HashMap::new()), domain_to_ip: Mutex::new(HashMap::new()) }
    }

    fn remember(&self, ip: IpAddr, domain: &str) {
        self.ip_to_domain.lock().expect("udp fakedns table poisoned").insert(ip, domain.to_string());
        self.domain_to_ip.lock().expect("udp fakedns table poisoned").insert(domain.to_string(), ip);
    }

    fn domain_for_ip(&self, ip: IpAddr) -> Option<String> {
        self.ip_to_domain.lock().expect("udp fakedns table poisoned").get(&ip).cloned()
    }

    fn ip_for_domain(&self, domain: &str) -> Option<IpAddr> {
        self.domain_to_ip.lock().expect("udp fakedns table poisoned").get(domain).copied()
    }
}

fn ip_to_address(ip: IpAddr) -> Address {
    match ip {
        IpAddr::V4(v4) => Address::V4(v4),
        IpAddr::V6(v6) => Address::V6(v6),
    }
}

/// Install the egress/ingress `on_transmission` hooks on a flow's uplink
/// and downlink pipe writer handles (§4.E). Call before handing either
/// `Link` off: a pipe's hook applies to every `write`, regardless of which
/// handle installed it. `dns.fakedns()` is consulted on every invocation
/// rather than captured once, since the hook closure must be `'static`
/// while the borrow it returns is not.
pub fn install_udp_fakedns_hooks(uplink_writer: &PipeWriter, downlink_writer: &PipeWriter, dns: Arc<dyn DnsClient>) {
    let table = Arc::new(UdpFakeDnsTable::new());

    let egress_dns = dns.clone();
    let egress_table = table.clone();
    uplink_writer.set_on_transmission(Arc::new(move |mut mb| {
        let Some(fakedns) = egress_dns.fakedns() else { return mb };
        for buf in mb.iter_mut() {
            let Some(dest) = buf.udp_addr.as_mut() else { continue };
            match &dest.address {
                Address::V4(_) | Address::V6(_) => {
                    if let Some(ip) = address_to_ip(&dest.address) {
                        if fakedns.is_ip_in_pool(ip) {
                            if let Some(domain) = fakedns.get_domain_from_ip(ip) {
                                dest.address = Address::Domain(domain);
                            }
                        }
                    }
                },
                Address::Domain(domain) => {
                    let ip = egress_table.ip_for_domain(domain).unwrap_or_else(|| fakedns.get_fake_ip_for_domain(domain));
                    egress_table.remember(ip, domain);
                    dest.address = ip_to_address(ip);
                },
            }
        }
        mb
    }));

    let ingress_dns = dns;
    let ingress_table = table;
    downlink_writer.set_on_transmission(Arc::new(move |mut mb| {
        let Some(fakedns) = ingress_dns.fakedns() else { return mb };
        for buf in mb.iter_mut() {
            let Some(dest) = buf.udp_addr.as_mut() else { continue };
            if let Address::Domain(domain) = &dest.address {
                let ip = ingress_table.ip_for_domain(domain).unwrap_or_else(|| fakedns.get_fake_ip_for_domain(domain));
                ingress_table.remember(ip, domain);
                dest.address = ip_to_address(ip);
            } else if let Some(ip) = address_to_ip(&dest.address) {
                if let Some(domain) = ingress_table.domain_for_ip(ip) {
                    dest.address = Address::Domain(domain);
                }
            }
        }
        mb
    }));
}

fn address_to_ip(addr: &Address) -> Option<IpAddr> {
    match addr {
        Address::V4(v4) => Some(IpAddr::V4(*v4)),
        Address::V6(v6) => Some(IpAddr::V6(*v6)),
        Address::Domain(_) => None,
    }
}
