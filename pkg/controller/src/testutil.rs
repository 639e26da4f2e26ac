//! Fakes and object builders for the controller tests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use pkg_metrics::{GatewayMetrics, MetricsRegistry};
use pkg_nginx::{ConfigDir, ProxyRuntime, RenderOptions, Renderer, UpstreamSync};
use pkg_store::{DeriveOptions, Pool, Store};
use pkg_types::endpoint::{Endpoint, EndpointAddress, EndpointPort};
use pkg_types::error::GatewayError;
use pkg_types::ingress::{
    Ingress, IngressBackend, IngressHTTP, IngressPath, IngressRule, IngressSpec, PathType,
};
use pkg_types::service::{Service, ServicePort, ServiceSpec, ServiceType};

use crate::queue::TaskQueue;
use crate::reconcile::{GatewayController, LocalIps};

#[derive(Default)]
pub struct FakeRuntime {
    pub reject: AtomicBool,
    pub tests: AtomicUsize,
    pub reloads: AtomicUsize,
}

#[async_trait]
impl ProxyRuntime for FakeRuntime {
    async fn test(&self, main_conf: &Path) -> anyhow::Result<()> {
        self.tests.fetch_add(1, Ordering::SeqCst);
        assert!(main_conf.exists(), "staged config must exist before testing");
        if self.reject.load(Ordering::SeqCst) {
            return Err(GatewayError::ConfigRejected("unexpected directive".to_string()).into());
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

impl FakeRuntime {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeUpstreams {
    pub fail: AtomicBool,
    pub http: Mutex<Vec<Vec<Pool>>>,
    pub stream: Mutex<Vec<Vec<Pool>>>,
}

#[async_trait]
impl UpstreamSync for FakeUpstreams {
    async fn push_http(&self, pools: &[Pool]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("backend push answered 500".to_string()).into());
        }
        self.http.lock().unwrap().push(pools.to_vec());
        Ok(())
    }

    async fn push_stream(&self, pools: &[Pool]) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("connection refused".to_string()).into());
        }
        self.stream.lock().unwrap().push(pools.to_vec());
        Ok(())
    }
}

impl FakeUpstreams {
    pub fn http_pushes(&self) -> usize {
        self.http.lock().unwrap().len()
    }

    pub fn last_http(&self) -> Vec<Pool> {
        self.http.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

pub struct FixedIps(pub BTreeSet<String>);

#[async_trait]
impl LocalIps for FixedIps {
    async fn local_ips(&self) -> BTreeSet<String> {
        self.0.clone()
    }
}

pub struct Harness {
    pub controller: Arc<GatewayController>,
    pub store: Arc<Store>,
    pub runtime: Arc<FakeRuntime>,
    pub upstreams: Arc<FakeUpstreams>,
    pub metrics: Arc<GatewayMetrics>,
    pub queue: Arc<TaskQueue>,
    pub conf: ConfigDir,
    _tmp: tempfile::TempDir,
}

pub fn render_options() -> RenderOptions {
    RenderOptions {
        status_port: 18080,
        stream_port: 18081,
        monitor_port: 18082,
        pid_file: "/tmp/kato-test-nginx.pid".into(),
        access_log: String::new(),
        enable_metrics: true,
        enable_ssl_stapling: false,
        retry_non_idempotent: false,
    }
}

pub fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let conf = ConfigDir::new(tmp.path().join("nginx"));
    conf.reset().unwrap();

    let store = Store::new(DeriveOptions {
        http_port: 80,
        https_port: 443,
    });
    let runtime = Arc::new(FakeRuntime::default());
    let upstreams = Arc::new(FakeUpstreams::default());
    let metrics = Arc::new(GatewayMetrics::new(Arc::new(MetricsRegistry::new())));
    let queue = Arc::new(TaskQueue::new(0.0, 1));
    let controller = GatewayController::new(
        store.clone(),
        Arc::new(FixedIps(BTreeSet::from(["10.0.0.100".to_string()]))),
        Renderer::new(render_options()).unwrap(),
        conf.clone(),
        runtime.clone(),
        upstreams.clone(),
        metrics.clone(),
        queue.clone(),
    );
    Harness {
        controller,
        store,
        runtime,
        upstreams,
        metrics,
        queue,
        conf,
        _tmp: tmp,
    }
}

pub fn ingress(name: &str, host: &str, service: &str, port: u16) -> Ingress {
    Ingress {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        annotations: Default::default(),
        spec: IngressSpec {
            rules: vec![IngressRule {
                host: host.to_string(),
                http: IngressHTTP {
                    paths: vec![IngressPath {
                        path: "/".to_string(),
                        path_type: PathType::Prefix,
                        backend: IngressBackend {
                            service_name: service.to_string(),
                            service_port: port,
                        },
                    }],
                },
            }],
            tls: None,
            default_backend: None,
        },
        created_at: Utc::now(),
    }
}

pub fn service(name: &str, port: u16) -> Service {
    Service {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: "default".to_string(),
        spec: ServiceSpec {
            selector: HashMap::new(),
            ports: vec![ServicePort {
                name: String::new(),
                port,
                target_port: port,
                node_port: None,
                protocol: "TCP".to_string(),
            }],
            service_type: ServiceType::ClusterIP,
        },
        cluster_ip: None,
        created_at: Utc::now(),
    }
}

pub fn endpoints(service: &str, port: u16, ips: &[&str]) -> Endpoint {
    Endpoint {
        id: format!("{}-ep", service),
        service_id: format!("{}-id", service),
        service_name: service.to_string(),
        namespace: "default".to_string(),
        addresses: ips
            .iter()
            .map(|ip| EndpointAddress {
                ip: ip.to_string(),
                node_id: None,
                pod_id: None,
            })
            .collect(),
        not_ready_addresses: Vec::new(),
        ports: vec![EndpointPort {
            name: String::new(),
            port,
            protocol: "TCP".to_string(),
        }],
        created_at: Utc::now(),
    }
}

/// `foo.example.com/` → `svc-a:8080` with one endpoint.
pub fn seed_foo(store: &Store) {
    store.upsert_service(service("svc-a", 8080));
    store.upsert_endpoints(endpoints("svc-a", 8080, &["10.0.0.1"]));
    store.upsert_ingress(ingress("foo", "foo.example.com", "svc-a", 8080));
}
