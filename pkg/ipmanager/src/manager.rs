use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pkg_constants::state::{
    GATEWAY_IP_PREFIX, IP_LEASE_TTL_SECS, IP_POLL_INTERVAL_SECS, IP_RENEW_INTERVAL_DIVISOR,
};
use pkg_state::CoordinationStore;

use crate::source::HostIpSource;

/// Membership change of a host IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpEvent {
    Added(String),
    /// The lease of the IP was lost and re-acquired.
    Updated(String),
    Removed(String),
}

impl IpEvent {
    pub fn ip(&self) -> &str {
        match self {
            IpEvent::Added(ip) | IpEvent::Updated(ip) | IpEvent::Removed(ip) => ip,
        }
    }
}

/// A leased host IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLease {
    pub ip: String,
    pub lease_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Value published under `/kato/gateway/ips/<ip>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRecord {
    pub ip: String,
    pub node: String,
    pub lease_id: String,
}

#[derive(Debug, Clone)]
pub struct IpManagerConfig {
    pub node_name: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
    pub poll_interval: Duration,
}

impl IpManagerConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ttl: Duration::from_secs(IP_LEASE_TTL_SECS),
            renew_interval: Duration::from_secs(IP_LEASE_TTL_SECS / IP_RENEW_INTERVAL_DIVISOR),
            poll_interval: Duration::from_secs(IP_POLL_INTERVAL_SECS),
        }
    }
}

/// Publishes every host IP under its own lease and reports membership
/// changes. The poll and keep-alive loops share one lock over the lease map.
pub struct IpManager {
    store: Arc<dyn CoordinationStore>,
    source: Arc<dyn HostIpSource>,
    config: IpManagerConfig,
    leases: Mutex<BTreeMap<String, IpLease>>,
    events: broadcast::Sender<IpEvent>,
}

pub fn ip_key(ip: &str) -> String {
    format!("{}{}", GATEWAY_IP_PREFIX, ip)
}

impl IpManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn HostIpSource>,
        config: IpManagerConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            source,
            config,
            leases: Mutex::new(BTreeMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpEvent> {
        self.events.subscribe()
    }

    /// IPs currently held under a lease.
    pub async fn current_ips(&self) -> BTreeSet<String> {
        self.leases.lock().await.keys().cloned().collect()
    }

    pub async fn leases(&self) -> Vec<IpLease> {
        self.leases.lock().await.values().cloned().collect()
    }

    fn emit(&self, event: IpEvent) {
        let _ = self.events.send(event);
    }

    async fn acquire(&self, ip: &str) -> anyhow::Result<IpLease> {
        let lease = self.store.grant(self.config.ttl).await?;
        let record = IpRecord {
            ip: ip.to_string(),
            node: self.config.node_name.clone(),
            lease_id: lease.id.clone(),
        };
        let value = serde_json::to_vec(&record)?;
        if let Err(e) = self.store.put_with_lease(&ip_key(ip), &value, &lease.id).await {
            let _ = self.store.revoke(&lease.id).await;
            return Err(e);
        }
        Ok(IpLease {
            ip: ip.to_string(),
            lease_id: lease.id.clone(),
            expires_at: lease.expires_at(),
        })
    }

    async fn release(&self, lease: &IpLease) -> anyhow::Result<()> {
        self.store.delete(&ip_key(&lease.ip)).await?;
        self.store.revoke(&lease.lease_id).await
    }

    /// Compare host IPs with the leased set: lease new ones, release gone ones.
    /// Failures are logged and retried on the next tick.
    pub async fn sync_once(&self) -> anyhow::Result<()> {
        let host = self.source.host_ips().await?;
        let mut leases = self.leases.lock().await;

        let gone: Vec<String> = leases.keys().filter(|ip| !host.contains(*ip)).cloned().collect();
        for ip in gone {
            if let Some(lease) = leases.remove(&ip) {
                if let Err(e) = self.release(&lease).await {
                    warn!(ip = %ip, "Failed to release IP lease, it will expire: {:#}", e);
                }
                info!(ip = %ip, "Host IP removed");
                self.emit(IpEvent::Removed(ip));
            }
        }

        let new: Vec<&String> = host.iter().filter(|ip| !leases.contains_key(*ip)).collect();
        for ip in new {
            match self.acquire(ip).await {
                Ok(lease) => {
                    info!(ip = %ip, lease = %lease.lease_id, "Host IP leased");
                    leases.insert(ip.clone(), lease);
                    self.emit(IpEvent::Added(ip.clone()));
                }
                Err(e) => warn!(ip = %ip, "Failed to lease host IP: {:#}", e),
            }
        }
        Ok(())
    }

    /// Renew every lease; re-acquire the ones the store no longer knows.
    pub async fn keepalive_once(&self) {
        let mut leases = self.leases.lock().await;
        for (ip, held) in leases.iter_mut() {
            match self.store.keep_alive(&held.lease_id).await {
                Ok(lease) => {
                    held.expires_at = lease.expires_at();
                    debug!(ip = %ip, "IP lease renewed");
                }
                Err(e) => {
                    warn!(ip = %ip, "IP lease keep-alive failed, re-acquiring: {:#}", e);
                    match self.acquire(ip).await {
                        Ok(fresh) => {
                            let stale = std::mem::replace(held, fresh);
                            // The key now belongs to the fresh lease.
                            if let Err(e) = self.store.revoke(&stale.lease_id).await {
                                debug!(ip = %ip, "Revoking superseded lease failed: {:#}", e);
                            }
                            self.emit(IpEvent::Updated(ip.clone()));
                        }
                        Err(e) => warn!(ip = %ip, "IP lease re-acquire failed: {:#}", e),
                    }
                }
            }
        }
    }

    /// Drop lease records that nobody renewed, ours or a departed gateway's.
    pub async fn sweep_once(&self) -> usize {
        match self.store.sweep_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    debug!(removed, "Swept expired leases");
                }
                removed
            }
            Err(e) => {
                warn!("Lease sweep failed: {:#}", e);
                0
            }
        }
    }

    /// Delete every published key and revoke every lease.
    pub async fn release_all(&self) {
        let mut leases = self.leases.lock().await;
        for (ip, lease) in std::mem::take(&mut *leases) {
            match self.release(&lease).await {
                Ok(()) => debug!(ip = %ip, "IP lease released"),
                Err(e) => warn!(ip = %ip, "Failed to release IP lease: {:#}", e),
            }
        }
        info!("All IP leases released");
    }

    /// Run the poll and keep-alive loops until cancelled.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "IpManager started (node={}, ttl={}s, renew={}s)",
                self.config.node_name,
                self.config.ttl.as_secs(),
                self.config.renew_interval.as_secs()
            );
            let mut poll = tokio::time::interval(self.config.poll_interval);
            let mut renew = tokio::time::interval(self.config.renew_interval);
            renew.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = poll.tick() => {
                        if let Err(e) = self.sync_once().await {
                            warn!("Host IP poll failed: {:#}", e);
                        }
                    }
                    _ = renew.tick() => {
                        self.keepalive_once().await;
                        self.sweep_once().await;
                    }
                }
            }
            info!("IpManager stopped");
        })
    }
}
