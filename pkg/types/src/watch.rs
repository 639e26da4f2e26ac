use serde::{Deserialize, Serialize};

/// Type of event in the watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a cluster state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// Response of the cluster API list call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    /// Sequence number the subsequent watch resumes from.
    pub seq: u64,
    #[serde(default)]
    pub items: Vec<WatchEvent>,
}

/// Object kinds the gateway watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Ingress,
    Service,
    Endpoints,
    Secret,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Ingress,
        ResourceKind::Service,
        ResourceKind::Endpoints,
        ResourceKind::Secret,
    ];

    /// Registry segment used in keys (`/registry/<segment>/<ns>/<name>`).
    pub fn segment(&self) -> &'static str {
        match self {
            ResourceKind::Ingress => "ingresses",
            ResourceKind::Service => "services",
            ResourceKind::Endpoints => "endpoints",
            ResourceKind::Secret => "secrets",
        }
    }

    pub fn prefix(&self) -> String {
        format!("/registry/{}/", self.segment())
    }

    fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.segment() == segment)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.segment())
    }
}

/// A parsed `/registry/<kind>/<namespace>/<name>` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl RegistryKey {
    /// Parse a registry key. Keys of kinds the gateway does not watch yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("/registry/")?;
        let mut parts = rest.splitn(3, '/');
        let kind = ResourceKind::from_segment(parts.next()?)?;
        let namespace = parts.next().filter(|s| !s.is_empty())?;
        let name = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn object_key(&self) -> String {
        crate::object_key(&self.namespace, &self.name)
    }
}
