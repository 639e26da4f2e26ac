use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::StateStore;
use pkg_constants::state::LEASE_PREFIX;
use pkg_types::error::GatewayError;
use pkg_types::lease::Lease;

/// Key-value store with TTL-bound leases, etcd style.
///
/// Keys written with a lease vanish once the lease is revoked or stops being
/// renewed within its TTL.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a fresh lease.
    async fn grant(&self, ttl: Duration) -> anyhow::Result<Lease>;

    /// Renew a lease. Fails with [`GatewayError::LeaseExpired`] when it is gone.
    async fn keep_alive(&self, lease_id: &str) -> anyhow::Result<Lease>;

    /// Revoke a lease and delete every key attached to it.
    async fn revoke(&self, lease_id: &str) -> anyhow::Result<()>;

    /// Write `key` and attach it to a live lease.
    async fn put_with_lease(&self, key: &str, value: &[u8], lease_id: &str) -> anyhow::Result<()>;

    /// Delete a key, detaching it from its lease.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// List the live keys under `prefix`.
    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    /// Remove every expired lease together with the keys it still owns.
    /// Returns the number of leases removed.
    async fn sweep_expired(&self) -> anyhow::Result<usize>;
}

/// Value envelope of a leased key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeasedValue {
    lease_id: String,
    value: Vec<u8>,
}

/// Lease engine on top of [`StateStore`].
///
/// Lease records live at `/registry/leases/<id>`. Expired leases are swept
/// lazily on every listing and eagerly through
/// [`CoordinationStore::sweep_expired`].
pub struct LeaseStore {
    store: StateStore,
    holder_id: String,
    call_timeout: Duration,
    // Serializes read-modify-write cycles on lease records.
    lock: Mutex<()>,
}

impl LeaseStore {
    pub fn new(store: StateStore, holder_id: String, call_timeout: Duration) -> Self {
        Self {
            store,
            holder_id,
            call_timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn lease_key(id: &str) -> String {
        format!("{}{}", LEASE_PREFIX, id)
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Transient(format!(
                "coordination store {} timed out after {}s",
                op,
                self.call_timeout.as_secs()
            ))
            .into()),
        }
    }

    async fn load_lease(&self, id: &str) -> anyhow::Result<Option<Lease>> {
        match self.store.get(&Self::lease_key(id)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_lease(&self, lease: &Lease) -> anyhow::Result<()> {
        let data = serde_json::to_vec(lease)?;
        self.store.put(&Self::lease_key(&lease.id), &data).await
    }

    async fn load_envelope(&self, key: &str) -> anyhow::Result<Option<LeasedValue>> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|data| serde_json::from_slice(&data).ok()))
    }

    /// Delete a lease record and the keys still attached to it. A key that was
    /// re-put under another lease belongs to that lease and is kept.
    async fn drop_lease(&self, lease: &Lease) -> anyhow::Result<()> {
        for key in &lease.keys {
            match self.load_envelope(key).await? {
                Some(envelope) if envelope.lease_id != lease.id => {
                    debug!(key = %key, owner = %envelope.lease_id, "Key moved to another lease, keeping");
                }
                _ => self.store.delete(key).await?,
            }
        }
        self.store.delete(&Self::lease_key(&lease.id)).await
    }
}

#[async_trait]
impl CoordinationStore for LeaseStore {
    async fn grant(&self, ttl: Duration) -> anyhow::Result<Lease> {
        self.timed("grant", async {
            let now = Utc::now();
            let lease = Lease {
                id: Uuid::new_v4().to_string(),
                holder_id: self.holder_id.clone(),
                acquired_at: now,
                renew_at: now,
                ttl_seconds: ttl.as_secs(),
                keys: Vec::new(),
            };
            let _guard = self.lock.lock().await;
            self.save_lease(&lease).await?;
            debug!(lease_id = %lease.id, ttl = lease.ttl_seconds, "Granted lease");
            Ok(lease)
        })
        .await
    }

    async fn keep_alive(&self, lease_id: &str) -> anyhow::Result<Lease> {
        self.timed("keep_alive", async {
            let _guard = self.lock.lock().await;
            let now = Utc::now();
            match self.load_lease(lease_id).await? {
                Some(lease) if !lease.is_expired_at(now) => {
                    let renewed = Lease {
                        renew_at: now,
                        ..lease
                    };
                    self.save_lease(&renewed).await?;
                    Ok(renewed)
                }
                Some(lease) => {
                    info!(lease_id, holder = %lease.holder_id, "Lease expired before renewal");
                    self.drop_lease(&lease).await?;
                    Err(GatewayError::LeaseExpired(lease_id.to_string()).into())
                }
                None => Err(GatewayError::LeaseExpired(lease_id.to_string()).into()),
            }
        })
        .await
    }

    async fn revoke(&self, lease_id: &str) -> anyhow::Result<()> {
        self.timed("revoke", async {
            let _guard = self.lock.lock().await;
            if let Some(lease) = self.load_lease(lease_id).await? {
                self.drop_lease(&lease).await?;
                debug!(lease_id, keys = lease.keys.len(), "Revoked lease");
            }
            Ok(())
        })
        .await
    }

    async fn put_with_lease(&self, key: &str, value: &[u8], lease_id: &str) -> anyhow::Result<()> {
        self.timed("put", async {
            let _guard = self.lock.lock().await;
            let mut lease = match self.load_lease(lease_id).await? {
                Some(l) if !l.is_expired() => l,
                _ => return Err(GatewayError::LeaseExpired(lease_id.to_string()).into()),
            };
            if let Some(previous) = self.load_envelope(key).await? {
                if previous.lease_id != lease_id {
                    if let Some(mut old) = self.load_lease(&previous.lease_id).await? {
                        old.keys.retain(|k| k != key);
                        self.save_lease(&old).await?;
                    }
                }
            }
            let envelope = LeasedValue {
                lease_id: lease_id.to_string(),
                value: value.to_vec(),
            };
            self.store.put(key, &serde_json::to_vec(&envelope)?).await?;
            if !lease.keys.iter().any(|k| k == key) {
                lease.keys.push(key.to_string());
                self.save_lease(&lease).await?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.timed("delete", async {
            let _guard = self.lock.lock().await;
            if let Some(data) = self.store.get(key).await? {
                if let Ok(envelope) = serde_json::from_slice::<LeasedValue>(&data) {
                    if let Some(mut lease) = self.load_lease(&envelope.lease_id).await? {
                        lease.keys.retain(|k| k != key);
                        self.save_lease(&lease).await?;
                    }
                }
            }
            self.store.delete(key).await
        })
        .await
    }

    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        self.timed("list", async {
            let _guard = self.lock.lock().await;
            let now = Utc::now();
            let mut leases: HashMap<String, Option<Lease>> = HashMap::new();
            let mut live = Vec::new();

            for (key, data) in self.store.list_prefix(prefix).await? {
                let envelope: LeasedValue = match serde_json::from_slice(&data) {
                    Ok(e) => e,
                    // Not a leased key: visible as-is.
                    Err(_) => {
                        live.push((key, data));
                        continue;
                    }
                };
                if !leases.contains_key(&envelope.lease_id) {
                    let lease = self.load_lease(&envelope.lease_id).await?;
                    leases.insert(envelope.lease_id.clone(), lease);
                }
                match leases.get(&envelope.lease_id).and_then(Option::as_ref) {
                    Some(lease) if !lease.is_expired_at(now) => live.push((key, envelope.value)),
                    _ => {
                        debug!(key = %key, lease_id = %envelope.lease_id, "Dropping key of dead lease");
                        self.store.delete(&key).await?;
                    }
                }
            }
            Ok(live)
        })
        .await
    }

    async fn sweep_expired(&self) -> anyhow::Result<usize> {
        self.timed("sweep", async {
            let _guard = self.lock.lock().await;
            let now = Utc::now();
            let mut removed = 0;
            for (_, data) in self.store.list_prefix(LEASE_PREFIX).await? {
                let lease: Lease = match serde_json::from_slice(&data) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                if lease.is_expired_at(now) {
                    debug!(lease_id = %lease.id, holder = %lease.holder_id, "Sweeping expired lease");
                    self.drop_lease(&lease).await?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::error::{ErrorKind, kind_of};

    async fn lease_store() -> LeaseStore {
        let store = StateStore::in_memory().await.unwrap();
        LeaseStore::new(store, "gw-test".to_string(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn leased_keys_are_listed_until_revoked() {
        let leases = lease_store().await;
        let lease = leases.grant(Duration::from_secs(10)).await.unwrap();
        assert_eq!(lease.holder_id, "gw-test");

        leases
            .put_with_lease("/kato/gateway/ips/10.0.0.1", b"10.0.0.1", &lease.id)
            .await
            .unwrap();
        leases
            .put_with_lease("/kato/gateway/ips/10.0.0.2", b"10.0.0.2", &lease.id)
            .await
            .unwrap();

        let listed = leases.list_prefix("/kato/gateway/ips/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].1, b"10.0.0.1".to_vec());

        leases.revoke(&lease.id).await.unwrap();
        assert!(leases.list_prefix("/kato/gateway/ips/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_renews_live_lease() {
        let leases = lease_store().await;
        let lease = leases.grant(Duration::from_secs(10)).await.unwrap();
        let renewed = leases.keep_alive(&lease.id).await.unwrap();
        assert!(renewed.renew_at >= lease.renew_at);
        assert_eq!(renewed.acquired_at, lease.acquired_at);
    }

    #[tokio::test]
    async fn expired_lease_hides_keys_and_rejects_renewal() {
        let leases = lease_store().await;
        let lease = leases.grant(Duration::from_secs(0)).await.unwrap();
        // A zero TTL is still live at the instant of the grant.
        let _ = leases
            .put_with_lease("/kato/gateway/ips/10.0.0.9", b"10.0.0.9", &lease.id)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(leases.list_prefix("/kato/gateway/ips/").await.unwrap().is_empty());

        let err = leases.keep_alive(&lease.id).await.unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::TransientUpstream);
        assert!(err.to_string().contains(&lease.id));
    }

    #[tokio::test]
    async fn sweep_removes_expired_leases_only() {
        let leases = lease_store().await;
        let short = leases.grant(Duration::from_secs(0)).await.unwrap();
        let long = leases.grant(Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(leases.sweep_expired().await.unwrap(), 1);
        assert!(leases.keep_alive(&long.id).await.is_ok());
        assert!(leases.keep_alive(&short.id).await.is_err());
    }

    #[tokio::test]
    async fn delete_detaches_key() {
        let leases = lease_store().await;
        let lease = leases.grant(Duration::from_secs(10)).await.unwrap();
        leases
            .put_with_lease("/kato/gateway/ips/10.0.0.3", b"x", &lease.id)
            .await
            .unwrap();
        leases.delete("/kato/gateway/ips/10.0.0.3").await.unwrap();

        let record = leases.load_lease(&lease.id).await.unwrap().unwrap();
        assert!(record.keys.is_empty());
        assert!(leases.list_prefix("/kato/gateway/ips/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reput_key_survives_revoke_of_previous_lease() {
        let leases = lease_store().await;
        let key = "/kato/gateway/ips/10.0.0.5";
        let old = leases.grant(Duration::from_secs(10)).await.unwrap();
        leases.put_with_lease(key, b"old", &old.id).await.unwrap();
        let new = leases.grant(Duration::from_secs(10)).await.unwrap();
        leases.put_with_lease(key, b"new", &new.id).await.unwrap();

        let record = leases.load_lease(&old.id).await.unwrap().unwrap();
        assert!(record.keys.is_empty());

        leases.revoke(&old.id).await.unwrap();
        let listed = leases.list_prefix("/kato/gateway/ips/").await.unwrap();
        assert_eq!(listed, vec![(key.to_string(), b"new".to_vec())]);

        leases.revoke(&new.id).await.unwrap();
        assert!(leases.list_prefix("/kato/gateway/ips/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_keeps_key_moved_to_live_lease() {
        let leases = lease_store().await;
        let key = "/kato/gateway/ips/10.0.0.6";
        let short = leases.grant(Duration::from_secs(0)).await.unwrap();
        // A zero TTL is still live at the instant of the grant.
        let _ = leases.put_with_lease(key, b"old", &short.id).await;
        let long = leases.grant(Duration::from_secs(60)).await.unwrap();
        leases.put_with_lease(key, b"new", &long.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(leases.sweep_expired().await.unwrap(), 1);
        let listed = leases.list_prefix("/kato/gateway/ips/").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn put_requires_live_lease() {
        let leases = lease_store().await;
        let err = leases
            .put_with_lease("/kato/gateway/ips/10.0.0.4", b"x", "missing")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::LeaseExpired(_))
        ));
    }
}
