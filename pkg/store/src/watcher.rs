use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pkg_types::error::GatewayError;
use pkg_types::watch::{ListResponse, ResourceKind, WatchEvent};

use crate::store::Store;

const WATCH_PREFIX: &str = "/registry/";

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Base URL of the cluster API, e.g. `http://127.0.0.1:6443`.
    pub api_server: String,
    pub token: Option<String>,
    pub call_timeout: Duration,
    /// Delay before reconnecting a dropped watch or retrying a failed list.
    pub backoff: Duration,
}

/// Why a watch stream ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WatchEnd {
    /// The server closed the stream; resume from this sequence.
    Closed(u64),
    /// The server no longer holds events after our sequence; relist.
    Expired,
    Cancelled,
}

/// Feeds the store from the cluster API: one list per kind, then a
/// server-sent-events watch resumed from the last sequence seen.
pub struct ClusterWatcher {
    client: reqwest::Client,
    config: WatcherConfig,
    store: Arc<Store>,
}

impl ClusterWatcher {
    pub fn new(store: Arc<Store>, config: WatcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.call_timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            store,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_server.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(self.url(path));
        match &self.config.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn list_kind(&self, kind: ResourceKind) -> anyhow::Result<ListResponse> {
        let resp = self
            .get(&format!("/api/v1/list?prefix={}", kind.prefix()))
            .timeout(self.config.call_timeout)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("listing {}: {}", kind, e)))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Transient(format!(
                "listing {}: server returned {}",
                kind,
                resp.status()
            ))
            .into());
        }
        Ok(resp.json().await?)
    }

    /// List every watched kind into the store and drop objects the server no
    /// longer has. Returns the sequence the watch resumes from.
    pub async fn list_all(&self) -> anyhow::Result<u64> {
        let mut seq = 0;
        for kind in ResourceKind::ALL {
            let listed = self.list_kind(kind).await?;
            let mut keep = BTreeSet::new();
            for item in &listed.items {
                if let Err(e) = self.store.apply(item) {
                    warn!(key = %item.key, "Skipping undecodable object: {:#}", e);
                    continue;
                }
                if let Some(key) = pkg_types::watch::RegistryKey::parse(&item.key) {
                    keep.insert(key.object_key());
                }
            }
            self.store.retain(kind, &keep);
            debug!(kind = %kind, count = listed.items.len(), "Listed objects");
            seq = seq.max(listed.seq);
        }
        Ok(seq)
    }

    /// Apply one decoded event unless it was already seen.
    fn handle_event(&self, event: &WatchEvent, seq: &mut u64) {
        if event.seq <= *seq {
            return;
        }
        if let Err(e) = self.store.apply(event) {
            warn!(key = %event.key, seq = event.seq, "Dropping watch event: {:#}", e);
        }
        *seq = event.seq;
    }

    /// Consume the watch stream from `seq` until it ends.
    pub async fn watch_once(&self, mut seq: u64, cancel: &CancellationToken) -> anyhow::Result<WatchEnd> {
        let resp = self
            .get(&format!("/api/v1/watch?prefix={}&seq={}", WATCH_PREFIX, seq))
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("opening watch: {}", e)))?;
        if resp.status() == StatusCode::GONE {
            return Ok(WatchEnd::Expired);
        }
        if !resp.status().is_success() {
            return Err(GatewayError::Transient(format!("watch returned {}", resp.status())).into());
        }

        info!(seq, "Watching cluster state");
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchEnd::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(WatchEnd::Closed(seq));
            };
            let chunk = chunk.map_err(|e| GatewayError::Transient(format!("watch stream: {}", e)))?;
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(data) = line.trim_end().strip_prefix("data:") else {
                    continue;
                };
                match serde_json::from_str::<WatchEvent>(data.trim_start()) {
                    Ok(event) => self.handle_event(&event, &mut seq),
                    Err(e) => warn!("Undecodable watch frame: {}", e),
                }
            }
        }
    }

    /// Run list + watch until cancelled. The store is marked synced after the
    /// first successful list.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut seq: Option<u64> = None;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let from = match seq {
                    Some(s) => s,
                    None => match self.list_all().await {
                        Ok(s) => {
                            if !self.store.is_synced() {
                                info!(seq = s, "Initial cluster state synced");
                                self.store.mark_synced();
                            }
                            s
                        }
                        Err(e) => {
                            warn!("Cluster list failed, keeping last-known state: {:#}", e);
                            if sleep_or_cancel(self.config.backoff, &cancel).await {
                                break;
                            }
                            continue;
                        }
                    },
                };

                match self.watch_once(from, &cancel).await {
                    Ok(WatchEnd::Cancelled) => break,
                    Ok(WatchEnd::Closed(last)) => {
                        debug!(seq = last, "Watch stream closed, reconnecting");
                        seq = Some(last);
                    }
                    Ok(WatchEnd::Expired) => {
                        info!(seq = from, "Watch window expired, relisting");
                        seq = None;
                    }
                    Err(e) => {
                        warn!("Watch failed: {:#}", e);
                        seq = Some(from);
                    }
                }
                if sleep_or_cancel(self.config.backoff, &cancel).await {
                    break;
                }
            }
            info!("Cluster watcher stopped");
        })
    }
}

/// Returns true when cancelled during the sleep.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{OPTIONS, ingress, service};
    use pkg_types::watch::EventType;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn put(seq: u64, key: &str, value: &impl serde::Serialize) -> WatchEvent {
        WatchEvent {
            seq,
            event_type: EventType::Put,
            key: key.to_string(),
            value: Some(serde_json::to_vec(value).unwrap()),
        }
    }

    fn config(server: &MockServer) -> WatcherConfig {
        WatcherConfig {
            api_server: server.uri(),
            token: Some("secret-token".to_string()),
            call_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(10),
        }
    }

    async fn mount_list(server: &MockServer, kind: ResourceKind, resp: ListResponse) {
        Mock::given(method("GET"))
            .and(path("/api/v1/list"))
            .and(query_param("prefix", kind.prefix()))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&resp))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn list_populates_store() {
        let server = MockServer::start().await;
        mount_list(
            &server,
            ResourceKind::Service,
            ListResponse {
                seq: 7,
                items: vec![put(3, "/registry/services/default/svc-a", &service("svc-a", 8080, "TCP"))],
            },
        )
        .await;
        mount_list(
            &server,
            ResourceKind::Ingress,
            ListResponse {
                seq: 9,
                items: vec![put(
                    5,
                    "/registry/ingresses/default/web",
                    &ingress("web", "foo.example.com", "/", "svc-a", 8080),
                )],
            },
        )
        .await;
        mount_list(&server, ResourceKind::Endpoints, ListResponse::default()).await;
        mount_list(&server, ResourceKind::Secret, ListResponse::default()).await;

        let store = Store::new(OPTIONS);
        let watcher = ClusterWatcher::new(store.clone(), config(&server)).unwrap();
        let seq = watcher.list_all().await.unwrap();

        assert_eq!(seq, 9);
        assert_eq!(store.snapshot(&BTreeSet::new()).l7_services.len(), 1);
    }

    #[tokio::test]
    async fn list_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/list"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let watcher = ClusterWatcher::new(Store::new(OPTIONS), config(&server)).unwrap();
        let err = watcher.list_all().await.unwrap_err();
        assert_eq!(
            pkg_types::error::kind_of(&err),
            pkg_types::error::ErrorKind::TransientUpstream
        );
    }

    #[tokio::test]
    async fn watch_applies_new_events_and_reports_last_seq() {
        let server = MockServer::start().await;
        let stale = put(4, "/registry/services/default/old", &service("old", 80, "TCP"));
        let fresh = put(11, "/registry/services/default/svc-a", &service("svc-a", 8080, "TCP"));
        let body = format!(
            ": keep-alive\n\ndata: {}\n\ndata: not-json\n\ndata: {}\n\n",
            serde_json::to_string(&stale).unwrap(),
            serde_json::to_string(&fresh).unwrap()
        );
        Mock::given(method("GET"))
            .and(path("/api/v1/watch"))
            .and(query_param("seq", "10"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let store = Store::new(OPTIONS);
        let mut events = store.subscribe();
        let watcher = ClusterWatcher::new(store.clone(), config(&server)).unwrap();
        let end = watcher.watch_once(10, &CancellationToken::new()).await.unwrap();

        assert_eq!(end, WatchEnd::Closed(11));
        let event = events.try_recv().unwrap();
        assert_eq!(event.key, "default/svc-a");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn gone_requests_relist() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/watch"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        let watcher = ClusterWatcher::new(Store::new(OPTIONS), config(&server)).unwrap();
        let end = watcher.watch_once(1, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, WatchEnd::Expired);
    }

    #[tokio::test]
    async fn start_marks_store_synced() {
        let server = MockServer::start().await;
        for kind in ResourceKind::ALL {
            mount_list(&server, kind, ListResponse::default()).await;
        }
        Mock::given(method("GET"))
            .and(path("/api/v1/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let store = Store::new(OPTIONS);
        let cancel = CancellationToken::new();
        let handle = ClusterWatcher::new(store.clone(), config(&server))
            .unwrap()
            .start(cancel.clone());
        tokio::time::timeout(Duration::from_secs(5), store.wait_synced())
            .await
            .unwrap();
        cancel.cancel();
        handle.await.unwrap();
    }
}
