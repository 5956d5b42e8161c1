// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Destination tuple (§3): `(Network, Address, Port)`, carried both as the
//! dispatch target and as the per-packet UDP sideband tag on a [`Buffer`]
//! (see `crate::buffer`).

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

/// Transport-layer network of a [`Destination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
    Unknown,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unknown => "unknown",
        })
    }
}

/// Address part of a [`Destination`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Address {
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Address::Domain(d) => Some(d.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(a) => write!(f, "{a}"),
            Address::V6(a) => write!(f, "{a}"),
            Address::Domain(d) => write!(f, "{d}"),
        }
    }
}

/// `(Network, Address, Port)`, the unit the dispatcher routes and the unit
/// a Mux `New`/`Keep` frame's `target` field carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn tcp(address: Address, port: u16) -> Self {
        Self { network: Network::Tcp, address, port }
    }

    pub fn udp(address: Address, port: u16) -> Self {
        Self { network: Network::Udp, address, port }
    }

    /// The well-known Mux dispatch address (§6): an outbound handler that
    /// sees this destination routes the link to the Mux client instead of
    /// opening a fresh transport connection.
    pub fn is_mux_cool(&self) -> bool {
        self.address.as_domain() == Some("v1.mux.cool") && self.port == 9527
    }

    pub fn mux_cool() -> Self {
        Self::tcp(Address::Domain("v1.mux.cool".to_string()), 9527)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_cool_recognised() {
        let d = Destination::mux_cool();
        assert!(d.is_mux_cool());
        let other = Destination::tcp(Address::Domain("example.com".into()), 443);
        assert!(!other.is_mux_cool());
    }
}
