use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use pkg_constants::state::PORT_ALLOCATION_ATTEMPTS;
use pkg_types::error::GatewayError;

use crate::store::{PortAllocation, PortAllocationStore};

/// Hands out external L4 ports from `[min, max]`.
pub struct PortAllocator {
    store: Arc<dyn PortAllocationStore>,
    min: u16,
    max: u16,
    lock: Mutex<()>,
}

/// Next port to try: one past the highest allocation if that fits,
/// otherwise the lowest free port in range.
pub fn next_candidate(used: &[u16], min: u16, max: u16) -> Option<u16> {
    let in_range: BTreeSet<u16> = used.iter().copied().filter(|p| (min..=max).contains(p)).collect();
    match in_range.last() {
        None => Some(min),
        Some(&highest) if highest < max => Some(highest + 1),
        Some(_) => (min..=max).find(|p| !in_range.contains(p)),
    }
}

impl PortAllocator {
    pub fn new(store: Arc<dyn PortAllocationStore>, min: u16, max: u16) -> Self {
        Self {
            store,
            min,
            max,
            lock: Mutex::new(()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Allocate (or return the existing) port of a service's container port.
    pub async fn allocate(&self, service_id: &str, container_port: u16) -> anyhow::Result<PortAllocation> {
        let _guard = self.lock.lock().await;
        for attempt in 1..=PORT_ALLOCATION_ATTEMPTS {
            if let Some(existing) = self.store.get(service_id, container_port).await? {
                return Ok(existing);
            }
            let used: Vec<u16> = self.store.list().await?.into_iter().map(|a| a.port).collect();
            let Some(port) = next_candidate(&used, self.min, self.max) else {
                return Err(GatewayError::PortExhausted {
                    min: self.min,
                    max: self.max,
                }
                .into());
            };
            let allocation = PortAllocation {
                service_id: service_id.to_string(),
                container_port,
                port,
            };
            if self.store.insert(&allocation).await? {
                info!(
                    "Allocated port {} for {}:{}",
                    port, service_id, container_port
                );
                return Ok(allocation);
            }
            debug!(attempt, port, "Port allocation conflict, retrying");
        }
        Err(GatewayError::Transient(format!(
            "port allocation for {}:{} lost {} races",
            service_id, container_port, PORT_ALLOCATION_ATTEMPTS
        ))
        .into())
    }

    /// Free a service's port. Returns whether anything was allocated.
    pub async fn release(&self, service_id: &str, container_port: u16) -> anyhow::Result<bool> {
        let _guard = self.lock.lock().await;
        let removed = self.store.remove(service_id, container_port).await?;
        if let Some(a) = &removed {
            info!("Released port {} of {}:{}", a.port, service_id, container_port);
        }
        Ok(removed.is_some())
    }

    pub async fn list(&self) -> anyhow::Result<Vec<PortAllocation>> {
        self.store.list().await
    }
}
