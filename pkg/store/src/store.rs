use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use pkg_annotations::{IngressAnnotations, extract};
use pkg_constants::state::EVENT_CHANNEL_CAPACITY;
use pkg_types::endpoint::Endpoint;
use pkg_types::error::GatewayError;
use pkg_types::ingress::Ingress;
use pkg_types::object_key;
use pkg_types::secret::Secret;
use pkg_types::service::Service;
use pkg_types::watch::{EventType, RegistryKey, ResourceKind, WatchEvent};

use crate::derive::{DeriveInput, DeriveOptions, derive};
use crate::events::StoreEvent;
use crate::model::{Pool, Snapshot, SslCert, VirtualService};
use crate::tls::parse_certificate;

struct CachedIngress {
    ingress: Ingress,
    annotations: IngressAnnotations,
}

struct CachedSecret {
    secret: Secret,
    cert: Option<SslCert>,
}

/// Single source of truth for the derived gateway state.
///
/// Caches are per-kind concurrent maps; every mutation emits a
/// [`StoreEvent`] on a bounded broadcast ring. A receiver that falls behind
/// sees `RecvError::Lagged` and must treat it as a full resync.
pub struct Store {
    ingresses: DashMap<String, CachedIngress>,
    services: DashMap<String, Service>,
    endpoints: DashMap<String, Endpoint>,
    secrets: DashMap<String, CachedSecret>,
    /// Secret key → keys of the ingresses referencing it.
    secret_index: DashMap<String, BTreeSet<String>>,
    events: broadcast::Sender<StoreEvent>,
    synced: watch::Sender<bool>,
    options: DeriveOptions,
}

impl Store {
    pub fn new(options: DeriveOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (synced, _) = watch::channel(false);
        Arc::new(Self {
            ingresses: DashMap::new(),
            services: DashMap::new(),
            endpoints: DashMap::new(),
            secrets: DashMap::new(),
            secret_index: DashMap::new(),
            events,
            synced,
            options,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receiver is fine: the controller takes a full snapshot on start.
        let _ = self.events.send(event);
    }

    /// Flag the initial list as complete.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until [`Store::mark_synced`] was called.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as the store.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    // --- Ingresses ---

    pub fn upsert_ingress(&self, ingress: Ingress) {
        let key = ingress.key();
        let annotations = extract(&ingress);
        if let Some(reason) = &annotations.denied {
            warn!(ingress = %key, "Ingress locations denied: {}", reason);
        }
        let secrets: BTreeSet<String> = ingress
            .secret_names()
            .into_iter()
            .map(|s| object_key(&ingress.namespace, s))
            .collect();

        let previous = self.ingresses.insert(
            key.clone(),
            CachedIngress {
                ingress,
                annotations,
            },
        );
        if let Some(previous) = previous {
            self.unindex_secrets(&key, &previous.ingress);
        }
        for secret in secrets {
            self.secret_index.entry(secret).or_default().insert(key.clone());
        }
        debug!(ingress = %key, "Ingress cached");
        self.emit(StoreEvent::upsert(ResourceKind::Ingress, key));
    }

    pub fn delete_ingress(&self, key: &str) {
        if let Some((_, previous)) = self.ingresses.remove(key) {
            self.unindex_secrets(key, &previous.ingress);
            debug!(ingress = %key, "Ingress removed");
            self.emit(StoreEvent::delete(ResourceKind::Ingress, key));
        }
    }

    fn unindex_secrets(&self, ingress_key: &str, ingress: &Ingress) {
        for name in ingress.secret_names() {
            let secret_key = object_key(&ingress.namespace, name);
            let now_empty = match self.secret_index.get_mut(&secret_key) {
                Some(mut refs) => {
                    refs.remove(ingress_key);
                    refs.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.secret_index.remove_if(&secret_key, |_, refs| refs.is_empty());
            }
        }
    }

    /// Keys of the ingresses referencing a secret.
    pub fn ingresses_for_secret(&self, secret_key: &str) -> Vec<String> {
        self.secret_index
            .get(secret_key)
            .map(|refs| refs.iter().cloned().collect())
            .unwrap_or_default()
    }

    // --- Services / endpoints ---

    pub fn upsert_service(&self, service: Service) {
        let key = service.key();
        self.services.insert(key.clone(), service);
        self.emit(StoreEvent::upsert(ResourceKind::Service, key));
    }

    pub fn delete_service(&self, key: &str) {
        if self.services.remove(key).is_some() {
            self.emit(StoreEvent::delete(ResourceKind::Service, key));
        }
    }

    pub fn upsert_endpoints(&self, endpoint: Endpoint) {
        let key = endpoint.key();
        self.endpoints.insert(key.clone(), endpoint);
        self.emit(StoreEvent::upsert(ResourceKind::Endpoints, key));
    }

    pub fn delete_endpoints(&self, key: &str) {
        if self.endpoints.remove(key).is_some() {
            self.emit(StoreEvent::delete(ResourceKind::Endpoints, key));
        }
    }

    // --- Secrets ---

    pub fn upsert_secret(&self, secret: Secret) {
        let key = secret.key();
        let cert = match parse_certificate(&secret) {
            Ok(cert) => {
                if cert.is_expired() {
                    warn!(secret = %key, "Certificate expired at {}", cert.expires_at);
                }
                Some(cert)
            }
            Err(e) => {
                debug!(secret = %key, "Secret carries no usable certificate: {:#}", e);
                None
            }
        };
        self.secrets.insert(key.clone(), CachedSecret { secret, cert });
        self.fan_out_secret(&key);
    }

    pub fn delete_secret(&self, key: &str) {
        if self.secrets.remove(key).is_some() {
            self.fan_out_secret(key);
        }
    }

    // A secret change re-renders every ingress that references it.
    fn fan_out_secret(&self, secret_key: &str) {
        for ingress in self.ingresses_for_secret(secret_key) {
            self.emit(StoreEvent::upsert(ResourceKind::Ingress, ingress));
        }
    }

    /// Parsed certificate of a TLS secret, if it is cached and valid.
    pub fn get_certificate(&self, namespace: &str, name: &str) -> Option<SslCert> {
        self.secrets
            .get(&object_key(namespace, name))
            .and_then(|s| s.cert.clone())
    }

    // --- Watch plumbing ---

    /// Apply one cluster watch event.
    pub fn apply(&self, event: &WatchEvent) -> anyhow::Result<()> {
        let Some(key) = RegistryKey::parse(&event.key) else {
            debug!(key = %event.key, "Ignoring event for unwatched key");
            return Ok(());
        };
        let object_key = key.object_key();
        match event.event_type {
            EventType::Delete => match key.kind {
                ResourceKind::Ingress => self.delete_ingress(&object_key),
                ResourceKind::Service => self.delete_service(&object_key),
                ResourceKind::Endpoints => self.delete_endpoints(&object_key),
                ResourceKind::Secret => self.delete_secret(&object_key),
            },
            EventType::Put => {
                let value = event.value.as_deref().ok_or_else(|| {
                    GatewayError::Validation(format!("put event for {} carries no value", event.key))
                })?;
                match key.kind {
                    ResourceKind::Ingress => self.upsert_ingress(decode(value, &event.key)?),
                    ResourceKind::Service => self.upsert_service(decode(value, &event.key)?),
                    ResourceKind::Endpoints => self.upsert_endpoints(decode(value, &event.key)?),
                    ResourceKind::Secret => self.upsert_secret(decode(value, &event.key)?),
                }
            }
        }
        Ok(())
    }

    /// Drop every cached object of `kind` whose key is not in `keep`.
    /// Used after a relist so that deletions missed while disconnected apply.
    pub fn retain(&self, kind: ResourceKind, keep: &BTreeSet<String>) {
        let stale: Vec<String> = match kind {
            ResourceKind::Ingress => stale_keys(&self.ingresses, keep),
            ResourceKind::Service => stale_keys(&self.services, keep),
            ResourceKind::Endpoints => stale_keys(&self.endpoints, keep),
            ResourceKind::Secret => stale_keys(&self.secrets, keep),
        };
        for key in stale {
            info!(kind = %kind, key = %key, "Removing object missing from relist");
            match kind {
                ResourceKind::Ingress => self.delete_ingress(&key),
                ResourceKind::Service => self.delete_service(&key),
                ResourceKind::Endpoints => self.delete_endpoints(&key),
                ResourceKind::Secret => self.delete_secret(&key),
            }
        }
    }

    // --- Queries ---

    /// Derive a consistent snapshot from one read of every cache.
    pub fn snapshot(&self, local_ips: &BTreeSet<String>) -> Snapshot {
        let mut ingresses: Vec<(Ingress, IngressAnnotations)> = self
            .ingresses
            .iter()
            .map(|e| (e.ingress.clone(), e.annotations.clone()))
            .collect();
        ingresses.sort_by(|a, b| {
            (&a.0.namespace, &a.0.name).cmp(&(&b.0.namespace, &b.0.name))
        });
        let services: HashMap<String, Service> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let endpoints: HashMap<String, Endpoint> = self
            .endpoints
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let certs: HashMap<String, SslCert> = self
            .secrets
            .iter()
            .filter_map(|e| e.cert.clone().map(|c| (e.key().clone(), c)))
            .collect();

        derive(&DeriveInput {
            ingresses: &ingresses,
            services: &services,
            endpoints: &endpoints,
            certs: &certs,
            local_ips,
            options: self.options,
        })
    }

    /// `(L7, L4)` virtual services.
    pub fn list_virtual_services(
        &self,
        local_ips: &BTreeSet<String>,
    ) -> (Vec<VirtualService>, Vec<VirtualService>) {
        let snapshot = self.snapshot(local_ips);
        (snapshot.l7_services, snapshot.l4_services)
    }

    /// `(HTTP, TCP/UDP)` pools.
    pub fn list_pools(&self, local_ips: &BTreeSet<String>) -> (Vec<Pool>, Vec<Pool>) {
        let snapshot = self.snapshot(local_ips);
        (snapshot.http_pools, snapshot.tcp_pools)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &[u8], key: &str) -> anyhow::Result<T> {
    serde_json::from_slice(value)
        .map_err(|e| GatewayError::Validation(format!("{}: {}", key, e)))
        .with_context(|| format!("decoding {}", key))
}

fn stale_keys<V>(map: &DashMap<String, V>, keep: &BTreeSet<String>) -> Vec<String> {
    map.iter()
        .map(|e| e.key().clone())
        .filter(|k| !keep.contains(k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use crate::model::{ConditionKind, Protocol};
    use crate::tls::tests::{self_signed, tls_secret};
    use tokio::sync::broadcast::error::TryRecvError;

    fn no_ips() -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn foo_store() -> Arc<Store> {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("svc-a", 8080, "TCP"));
        store.upsert_endpoints(endpoints("svc-a", 8080, &["10.0.0.1"], &[]));
        store.upsert_ingress(ingress("web", "foo.example.com", "/", "svc-a", 8080));
        store
    }

    #[test]
    fn single_http_ingress() {
        let snapshot = foo_store().snapshot(&no_ips());

        assert_eq!(snapshot.l7_services.len(), 1);
        let vs = &snapshot.l7_services[0];
        assert_eq!(vs.protocol, Protocol::Http);
        assert_eq!(vs.server_name, "foo.example.com");
        assert_eq!(vs.listening, BTreeSet::from([":80".to_string()]));
        assert_eq!(vs.locations.len(), 1);
        assert_eq!(vs.locations[0].path, "/");
        assert_eq!(vs.default_pool.as_deref(), Some("default_svc-a_8080"));

        assert_eq!(snapshot.http_pools.len(), 1);
        let pool = &snapshot.http_pools[0];
        assert_eq!(pool.name, "default_svc-a_8080");
        assert_eq!(pool.nodes.len(), 1);
        assert_eq!(pool.nodes[0].host, "10.0.0.1");
        assert_eq!(pool.nodes[0].port, 8080);
        assert_eq!(pool.nodes[0].weight, 1);
        assert!(pool.nodes[0].ready);
    }

    #[test]
    fn pools_of_dashed_namespaces_stay_apart() {
        let store = Store::new(OPTIONS);
        for (ns, svc, host, ip) in [
            ("a", "b-c", "one.example.com", "10.1.1.1"),
            ("a-b", "c", "two.example.com", "10.2.2.2"),
        ] {
            let mut s = service(svc, 80, "TCP");
            s.namespace = ns.to_string();
            let mut ep = endpoints(svc, 80, &[ip], &[]);
            ep.namespace = ns.to_string();
            let mut ing = ingress(svc, host, "/", svc, 80);
            ing.namespace = ns.to_string();
            store.upsert_service(s);
            store.upsert_endpoints(ep);
            store.upsert_ingress(ing);
        }

        let snapshot = store.snapshot(&no_ips());
        assert_eq!(snapshot.http_pools.len(), 2);
        let pool_of = |host: &str| {
            let vs = snapshot
                .l7_services
                .iter()
                .find(|vs| vs.server_name == host)
                .unwrap();
            let name = vs.default_pool.clone().unwrap();
            snapshot.http_pools.iter().find(|p| p.name == name).unwrap().clone()
        };
        let one = pool_of("one.example.com");
        let two = pool_of("two.example.com");
        assert_ne!(one.name, two.name);
        assert_eq!(one.nodes[0].host, "10.1.1.1");
        assert_eq!(two.namespace, "a-b");
        assert_eq!(two.nodes[0].host, "10.2.2.2");
    }

    #[test]
    fn endpoint_churn_changes_only_nodes() {
        let store = foo_store();
        let before = store.snapshot(&no_ips());
        store.upsert_endpoints(endpoints("svc-a", 8080, &["10.0.0.2", "10.0.0.1"], &[]));
        let after = store.snapshot(&no_ips());

        assert!(before.only_pool_nodes_changed(&after));
        let hosts: Vec<&str> = after.http_pools[0].nodes.iter().map(|n| n.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn snapshot_is_deterministic() {
        let store = foo_store();
        store.upsert_service(service("svc-b", 9090, "TCP"));
        store.upsert_ingress(ingress("api", "api.example.com", "/v1", "svc-b", 9090));
        let a = store.snapshot(&no_ips());
        let b = store.snapshot(&no_ips());
        assert!(a.equals(&b));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn cookie_routing_shares_location() {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("svc-a", 8080, "TCP"));
        store.upsert_service(service("svc-b", 8080, "TCP"));
        store.upsert_ingress(ingress("a", "foo.example.com", "/", "svc-a", 8080));
        store.upsert_ingress(with_annotation(
            ingress("b", "foo.example.com", "/", "svc-b", 8080),
            "cookie",
            "version=beta",
        ));

        let snapshot = store.snapshot(&no_ips());
        assert_eq!(snapshot.l7_services.len(), 1);
        let location = &snapshot.l7_services[0].locations[0];
        assert_eq!(location.name_condition.len(), 2);
        let a = &location.name_condition["default_svc-a_8080"];
        assert_eq!(a.kind, ConditionKind::Default);
        let b = &location.name_condition["default_svc-b_8080"];
        assert_eq!(b.kind, ConditionKind::Cookie);
        assert_eq!(b.values["version"], "beta");
        assert_eq!(location.default_pool(), Some("default_svc-a_8080"));
    }

    #[test]
    fn second_default_on_location_is_dropped() {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("svc-a", 8080, "TCP"));
        store.upsert_service(service("svc-b", 8080, "TCP"));
        store.upsert_ingress(ingress("a", "foo.example.com", "/", "svc-a", 8080));
        store.upsert_ingress(ingress("b", "foo.example.com", "/", "svc-b", 8080));

        let snapshot = store.snapshot(&no_ips());
        let location = &snapshot.l7_services[0].locations[0];
        assert_eq!(location.name_condition.len(), 1);
        assert_eq!(location.default_pool(), Some("default_svc-a_8080"));
        assert_eq!(snapshot.http_pools.len(), 1);
    }

    #[test]
    fn unknown_backend_is_skipped() {
        let store = Store::new(OPTIONS);
        store.upsert_ingress(ingress("web", "foo.example.com", "/", "missing", 80));
        let snapshot = store.snapshot(&no_ips());
        assert!(snapshot.l7_services.is_empty());
        assert!(snapshot.http_pools.is_empty());
    }

    #[test]
    fn l4_exposure() {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("svc-t", 30000, "TCP"));
        store.upsert_endpoints(endpoints("svc-t", 30000, &["10.0.1.1"], &["10.0.1.2"]));
        store.upsert_ingress(l4_ingress("tcp", "0.0.0.0", "32145", "svc-t", 30000));

        let snapshot = store.snapshot(&no_ips());
        assert!(snapshot.l7_services.is_empty());
        assert_eq!(snapshot.l4_services.len(), 1);
        let vs = &snapshot.l4_services[0];
        assert_eq!(vs.protocol, Protocol::Tcp);
        assert_eq!(vs.listening, BTreeSet::from(["0.0.0.0:32145".to_string()]));
        assert_eq!(vs.default_pool.as_deref(), Some("default_svc-t_30000_tcp"));

        let pool = &snapshot.tcp_pools[0];
        assert_eq!(pool.nodes.len(), 2);
        assert!(pool.nodes[0].ready);
        assert!(!pool.nodes[1].ready);
    }

    #[test]
    fn l4_udp_and_local_host_filter() {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("dns", 53, "UDP"));
        store.upsert_ingress(l4_ingress("dns", "10.0.0.5", "20053", "dns", 53));

        assert!(store.snapshot(&no_ips()).l4_services.is_empty());

        let ips = BTreeSet::from(["10.0.0.5".to_string()]);
        let snapshot = store.snapshot(&ips);
        assert_eq!(snapshot.l4_services[0].protocol, Protocol::Udp);
        assert_eq!(snapshot.tcp_pools[0].name, "default_dns_53_udp");
    }

    #[test]
    fn conflicting_l4_port_is_dropped() {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("svc-t", 30000, "TCP"));
        store.upsert_service(service("svc-u", 30001, "TCP"));
        store.upsert_ingress(l4_ingress("a", "0.0.0.0", "32145", "svc-t", 30000));
        store.upsert_ingress(l4_ingress("b", "0.0.0.0", "32145", "svc-u", 30001));

        let snapshot = store.snapshot(&no_ips());
        assert_eq!(snapshot.l4_services.len(), 1);
        assert_eq!(
            snapshot.l4_services[0].default_pool.as_deref(),
            Some("default_svc-t_30000_tcp")
        );
        assert_eq!(snapshot.tcp_pools.len(), 1);
    }

    #[test]
    fn invalid_l4_port_drops_rule() {
        let store = Store::new(OPTIONS);
        store.upsert_service(service("svc-t", 30000, "TCP"));
        store.upsert_ingress(l4_ingress("a", "0.0.0.0", "70000", "svc-t", 30000));
        let snapshot = store.snapshot(&no_ips());
        assert!(snapshot.l4_services.is_empty());
        assert!(snapshot.tcp_pools.is_empty());
    }

    #[test]
    fn tls_secret_makes_host_https() {
        let store = foo_store();
        store.upsert_ingress(with_tls(
            ingress("web", "foo.example.com", "/", "svc-a", 8080),
            "foo.example.com",
            "foo-tls",
        ));
        assert_eq!(store.snapshot(&no_ips()).l7_services[0].protocol, Protocol::Http);

        let mut events = store.subscribe();
        let (cert, key) = self_signed("foo.example.com");
        store.upsert_secret(tls_secret("default", "foo-tls", &cert, &key));

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, ResourceKind::Ingress);
        assert_eq!(event.key, "default/web");

        let snapshot = store.snapshot(&no_ips());
        let vs = &snapshot.l7_services[0];
        assert_eq!(vs.protocol, Protocol::Https);
        assert_eq!(vs.listening, BTreeSet::from([":443 ssl".to_string()]));
        assert!(vs.ssl.is_some());
        assert!(store.get_certificate("default", "foo-tls").is_some());
    }

    #[test]
    fn secret_index_follows_ingress_updates() {
        let store = foo_store();
        store.upsert_ingress(with_tls(
            ingress("web", "foo.example.com", "/", "svc-a", 8080),
            "foo.example.com",
            "foo-tls",
        ));
        assert_eq!(store.ingresses_for_secret("default/foo-tls"), vec!["default/web"]);

        store.upsert_ingress(ingress("web", "foo.example.com", "/", "svc-a", 8080));
        assert!(store.ingresses_for_secret("default/foo-tls").is_empty());
    }

    #[test]
    fn apply_watch_events() {
        let store = Store::new(OPTIONS);
        let svc = service("svc-a", 8080, "TCP");
        store
            .apply(&WatchEvent {
                seq: 1,
                event_type: EventType::Put,
                key: "/registry/services/default/svc-a".to_string(),
                value: Some(serde_json::to_vec(&svc).unwrap()),
            })
            .unwrap();
        let ing = ingress("web", "foo.example.com", "/", "svc-a", 8080);
        store
            .apply(&WatchEvent {
                seq: 2,
                event_type: EventType::Put,
                key: "/registry/ingresses/default/web".to_string(),
                value: Some(serde_json::to_vec(&ing).unwrap()),
            })
            .unwrap();
        assert_eq!(store.snapshot(&no_ips()).l7_services.len(), 1);

        store
            .apply(&WatchEvent {
                seq: 3,
                event_type: EventType::Delete,
                key: "/registry/ingresses/default/web".to_string(),
                value: None,
            })
            .unwrap();
        assert!(store.snapshot(&no_ips()).l7_services.is_empty());

        let bad = store.apply(&WatchEvent {
            seq: 4,
            event_type: EventType::Put,
            key: "/registry/services/default/broken".to_string(),
            value: Some(b"{".to_vec()),
        });
        assert!(bad.is_err());
        assert!(
            store
                .apply(&WatchEvent {
                    seq: 5,
                    event_type: EventType::Put,
                    key: "/registry/pods/default/p".to_string(),
                    value: Some(b"{}".to_vec()),
                })
                .is_ok()
        );
    }

    #[test]
    fn retain_drops_objects_missing_from_relist() {
        let store = foo_store();
        store.retain(ResourceKind::Ingress, &BTreeSet::new());
        assert!(store.snapshot(&no_ips()).l7_services.is_empty());
    }

    #[test]
    fn lagging_subscriber_sees_lag() {
        let store = Store::new(OPTIONS);
        let mut events = store.subscribe();
        for i in 0..(EVENT_CHANNEL_CAPACITY + 10) {
            store.upsert_service(service(&format!("svc-{}", i), 80, "TCP"));
        }
        assert!(matches!(events.try_recv(), Err(TryRecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn wait_synced_returns_after_mark() {
        let store = Store::new(OPTIONS);
        assert!(!store.is_synced());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_synced().await })
        };
        store.mark_synced();
        waiter.await.unwrap();
        assert!(store.is_synced());
    }
}
