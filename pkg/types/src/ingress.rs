use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Path matching type for Ingress rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    #[default]
    Prefix,
    Exact,
}

/// Backend service target for an Ingress path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: u16,
}

/// A single path rule within an Ingress HTTP rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    #[serde(default)]
    pub path_type: PathType,
    pub backend: IngressBackend,
}

/// HTTP rules for a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressHTTP {
    pub paths: Vec<IngressPath>,
}

/// A single host-based Ingress rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub http: IngressHTTP,
}

/// TLS configuration for an Ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressTLS {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub secret_name: String,
}

/// Ingress specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub tls: Option<Vec<IngressTLS>>,
    /// Backend used by L4 exposure and by requests no rule matches.
    #[serde(default)]
    pub default_backend: Option<IngressBackend>,
}

/// Ingress resource for external traffic routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingress {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: IngressSpec,
    pub created_at: DateTime<Utc>,
}

impl Ingress {
    pub fn key(&self) -> String {
        crate::object_key(&self.namespace, &self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Names of all secrets referenced by the TLS section.
    pub fn secret_names(&self) -> Vec<&str> {
        self.spec
            .tls
            .iter()
            .flatten()
            .map(|t| t.secret_name.as_str())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
