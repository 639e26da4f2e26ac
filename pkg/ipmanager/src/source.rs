use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// Where the manager learns the host's addresses from.
#[async_trait]
pub trait HostIpSource: Send + Sync {
    async fn host_ips(&self) -> anyhow::Result<BTreeSet<String>>;
}

/// Addresses of the host's up interfaces, minus loopback, link-local and
/// ignored interfaces.
pub struct InterfaceIpSource {
    ignored: Vec<String>,
}

impl InterfaceIpSource {
    pub fn new(ignored: Vec<String>) -> Self {
        Self { ignored }
    }

    fn is_ignored(&self, interface: &str) -> bool {
        self.ignored.iter().any(|i| i == interface)
    }
}

fn usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        // fe80::/10
        IpAddr::V6(v6) => {
            !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

#[async_trait]
impl HostIpSource for InterfaceIpSource {
    async fn host_ips(&self) -> anyhow::Result<BTreeSet<String>> {
        let mut ips = BTreeSet::new();
        for ifaddr in getifaddrs()? {
            if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
                || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                || self.is_ignored(&ifaddr.interface_name)
            {
                continue;
            }
            let Some(addr) = ifaddr.address else {
                continue;
            };
            let ip = if let Some(v4) = addr.as_sockaddr_in() {
                IpAddr::V4(v4.ip())
            } else if let Some(v6) = addr.as_sockaddr_in6() {
                IpAddr::V6(v6.ip())
            } else {
                continue;
            };
            if usable(&ip) {
                ips.insert(ip.to_string());
            }
        }
        Ok(ips)
    }
}

/// Fixed address set, swapped at will. Used by tests and dry runs.
#[derive(Default)]
pub struct StaticIpSource {
    ips: Mutex<BTreeSet<String>>,
}

impl StaticIpSource {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(ips: I) -> Self {
        Self {
            ips: Mutex::new(ips.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<I: IntoIterator<Item = S>, S: Into<String>>(&self, ips: I) {
        *self.ips.lock().unwrap_or_else(|e| e.into_inner()) = ips.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl HostIpSource for StaticIpSource {
    async fn host_ips(&self) -> anyhow::Result<BTreeSet<String>> {
        Ok(self.ips.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_unusable_addresses() {
        assert!(!usable(&"127.0.0.1".parse().unwrap()));
        assert!(!usable(&"169.254.1.1".parse().unwrap()));
        assert!(!usable(&"fe80::1".parse().unwrap()));
        assert!(!usable(&"::1".parse().unwrap()));
        assert!(usable(&"10.0.0.1".parse().unwrap()));
        assert!(usable(&"2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn interface_source_skips_loopback() {
        let ips = InterfaceIpSource::new(Vec::new()).host_ips().await.unwrap();
        assert!(!ips.contains("127.0.0.1"));
    }
}
