use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use pkg_constants::state::{PORT_BY_PORT_PREFIX, PORT_BY_SERVICE_PREFIX};
use pkg_state::StateStore;

/// `(service, container port) → external port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub service_id: String,
    pub container_port: u16,
    pub port: u16,
}

/// Persistence of the allocation table.
#[async_trait]
pub trait PortAllocationStore: Send + Sync {
    async fn get(&self, service_id: &str, container_port: u16) -> anyhow::Result<Option<PortAllocation>>;

    /// Every allocation, ascending by port.
    async fn list(&self) -> anyhow::Result<Vec<PortAllocation>>;

    /// Persist `allocation` unless its port or its service pair is taken.
    /// Returns `false` on such a conflict.
    async fn insert(&self, allocation: &PortAllocation) -> anyhow::Result<bool>;

    async fn remove(&self, service_id: &str, container_port: u16) -> anyhow::Result<Option<PortAllocation>>;
}

/// Allocation table in the coordination store, indexed both by port and by
/// service so that either side of a conflict is detected.
pub struct StatePortStore {
    store: StateStore,
    lock: Mutex<()>,
}

impl StatePortStore {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    // Zero padded so that key order is port order.
    fn port_key(port: u16) -> String {
        format!("{}{:05}", PORT_BY_PORT_PREFIX, port)
    }

    fn service_key(service_id: &str, container_port: u16) -> String {
        format!("{}{}/{}", PORT_BY_SERVICE_PREFIX, service_id, container_port)
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<PortAllocation>> {
        match self.store.get(key).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PortAllocationStore for StatePortStore {
    async fn get(&self, service_id: &str, container_port: u16) -> anyhow::Result<Option<PortAllocation>> {
        self.read(&Self::service_key(service_id, container_port)).await
    }

    async fn list(&self) -> anyhow::Result<Vec<PortAllocation>> {
        let mut out = Vec::new();
        for (key, data) in self.store.list_prefix(PORT_BY_PORT_PREFIX).await? {
            match serde_json::from_slice::<PortAllocation>(&data) {
                Ok(a) => out.push(a),
                Err(e) => tracing::warn!(key = %key, "Skipping corrupt port allocation: {}", e),
            }
        }
        out.sort_by_key(|a| a.port);
        Ok(out)
    }

    async fn insert(&self, allocation: &PortAllocation) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let port_key = Self::port_key(allocation.port);
        let service_key = Self::service_key(&allocation.service_id, allocation.container_port);
        if self.store.get(&port_key).await?.is_some() || self.store.get(&service_key).await?.is_some() {
            return Ok(false);
        }
        let data = serde_json::to_vec(allocation)?;
        self.store.put(&port_key, &data).await?;
        self.store.put(&service_key, &data).await?;
        Ok(true)
    }

    async fn remove(&self, service_id: &str, container_port: u16) -> anyhow::Result<Option<PortAllocation>> {
        let _guard = self.lock.lock().await;
        let service_key = Self::service_key(service_id, container_port);
        let Some(existing) = self.read(&service_key).await? else {
            return Ok(None);
        };
        self.store.delete(&Self::port_key(existing.port)).await?;
        self.store.delete(&service_key).await?;
        Ok(Some(existing))
    }
}
