// src/pac/capabilities.rs
//! Host services the PAC helpers may call: name resolution and the wall clock.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};

use chrono::{Local, NaiveDateTime, Utc};

/// DNS lookups available to `isInNet`, `isResolvable`, `dnsResolve` and `myIpAddress`.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Option<Ipv4Addr>;

    fn local_address(&self) -> Option<Ipv4Addr> {
        None
    }
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Some(ip);
        }
        if host.is_empty() {
            return None;
        }
        (host, 0)
            .to_socket_addrs()
            .ok()?
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        // No packet is sent; connecting only selects the outbound interface.
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:53").ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        }
    }
}

/// Fixed host table, for tests and offline evaluation.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
    local: Option<Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, ip: Ipv4Addr) -> Self {
        self.hosts.insert(host.into(), ip);
        self
    }

    pub fn with_local_address(mut self, ip: Ipv4Addr) -> Self {
        self.local = Some(ip);
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        host.parse::<Ipv4Addr>()
            .ok()
            .or_else(|| self.hosts.get(host).copied())
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.local
    }
}

/// A point in time seen both as local wall-clock time and as UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub local: NaiveDateTime,
    pub utc: NaiveDateTime,
}

impl Moment {
    pub fn pick(&self, gmt: bool) -> NaiveDateTime {
        if gmt {
            self.utc
        } else {
            self.local
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Moment;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Moment {
        Moment {
            local: Local::now().naive_local(),
            utc: Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Moment);

impl FixedClock {
    /// Uses the same timestamp for local time and UTC.
    pub fn at(instant: NaiveDateTime) -> Self {
        Self(Moment {
            local: instant,
            utc: instant,
        })
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Moment {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_answers_literals_and_table() {
        let resolver = StaticResolver::new().with_host("intranet", Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(resolver.resolve("intranet"), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(resolver.resolve("192.168.1.1"), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(resolver.resolve("elsewhere"), None);
        assert_eq!(resolver.local_address(), None);
    }

    #[test]
    fn system_resolver_short_circuits_ip_literals() {
        assert_eq!(SystemResolver.resolve("127.0.0.1"), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(SystemResolver.resolve(""), None);
    }
}
