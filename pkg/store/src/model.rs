//! Derived gateway state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use pkg_annotations::{LoadBalancing, ProxyConfig, RewriteConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn is_l4(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// TLS material attached to an HTTPS virtual service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SslCert {
    pub namespace: String,
    pub name: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    /// Subject common names followed by DNS subject alternative names.
    pub common_names: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl SslCert {
    /// File name of the combined PEM inside the certificate directory.
    pub fn file_name(&self) -> String {
        format!("{}-{}.pem", self.namespace, self.name)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ConditionKind {
    Header,
    Cookie,
    Default,
}

/// Routing condition selecting one pool of a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub values: BTreeMap<String, String>,
}

impl Condition {
    pub fn default_route() -> Self {
        Self {
            kind: ConditionKind::Default,
            values: BTreeMap::new(),
        }
    }

    pub fn header(values: BTreeMap<String, String>) -> Self {
        Self {
            kind: ConditionKind::Header,
            values,
        }
    }

    pub fn cookie(values: BTreeMap<String, String>) -> Self {
        Self {
            kind: ConditionKind::Cookie,
            values,
        }
    }
}

/// One HTTP path match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub path: String,
    pub exact: bool,
    /// Pool name → condition routing traffic to it.
    pub name_condition: BTreeMap<String, Condition>,
    pub rewrite: Option<RewriteConfig>,
    pub proxy: ProxyConfig,
}

impl Location {
    /// Pool receiving traffic no header or cookie condition matched.
    pub fn default_pool(&self) -> Option<&str> {
        self.name_condition
            .iter()
            .find(|(_, c)| c.kind == ConditionKind::Default)
            .map(|(pool, _)| pool.as_str())
    }
}

/// One listener identity exposed by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualService {
    /// `<server name>` for HTTP(S), `<host>:<port>` for L4.
    pub name: String,
    pub namespace: String,
    pub protocol: Protocol,
    pub listening: BTreeSet<String>,
    pub server_name: String,
    pub ssl: Option<SslCert>,
    pub locations: Vec<Location>,
    pub default_pool: Option<String>,
}

/// One backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub ready: bool,
    pub max_fails: Option<u32>,
    pub fail_timeout: Option<u32>,
}

/// A named upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pool {
    pub name: String,
    pub namespace: String,
    pub service: String,
    pub port: u16,
    pub lb: LoadBalancing,
    pub hash_by: Option<String>,
    pub nodes: Vec<Node>,
}

impl Pool {
    /// Pools compare equal except for their node lists.
    pub fn same_shape(&self, other: &Pool) -> bool {
        self.name == other.name
            && self.namespace == other.namespace
            && self.service == other.service
            && self.port == other.port
            && self.lb == other.lb
            && self.hash_by == other.hash_by
    }
}

// Object names never contain `_`, so the separator keeps names unique.
pub fn http_pool_name(namespace: &str, service: &str, port: u16) -> String {
    format!("{}_{}_{}", namespace, service, port)
}

pub fn l4_pool_name(namespace: &str, service: &str, port: u16, protocol: Protocol) -> String {
    format!("{}_{}_{}_{}", namespace, service, port, protocol.suffix())
}

/// Projection of one ingress rule plus its annotations.
#[derive(Debug, Clone)]
pub struct HttpRule {
    pub ingress: String,
    pub namespace: String,
    pub host: String,
    pub path: String,
    pub exact: bool,
    pub service: String,
    pub service_port: u16,
    pub pool: String,
    pub condition: Condition,
    pub tls_secret: Option<String>,
}

/// Projection of one L4-enabled ingress.
#[derive(Debug, Clone)]
pub struct TcpRule {
    pub ingress: String,
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub service: String,
    pub service_port: u16,
    pub pool: String,
}

/// Immutable derivation of the cluster state consumed by one reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub http_pools: Vec<Pool>,
    pub tcp_pools: Vec<Pool>,
    pub l7_services: Vec<VirtualService>,
    pub l4_services: Vec<VirtualService>,
}

impl Snapshot {
    /// Structural equality over the canonical (sorted) sequences.
    pub fn equals(&self, other: &Snapshot) -> bool {
        self == other
    }

    /// True when the services are identical and the pools only differ in
    /// their node lists.
    pub fn only_pool_nodes_changed(&self, other: &Snapshot) -> bool {
        if self.equals(other) {
            return false;
        }
        self.l7_services == other.l7_services
            && self.l4_services == other.l4_services
            && pools_same_shape(&self.http_pools, &other.http_pools)
            && pools_same_shape(&self.tcp_pools, &other.tcp_pools)
    }

    /// Server names of every L7 service.
    pub fn server_names(&self) -> BTreeSet<String> {
        self.l7_services
            .iter()
            .map(|s| s.server_name.clone())
            .collect()
    }

    /// Canonical serialization; equal snapshots serialize to identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn pools_same_shape(a: &[Pool], b: &[Pool]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_shape(y))
}
