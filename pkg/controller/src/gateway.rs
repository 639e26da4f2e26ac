use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pkg_ipmanager::{HostIpSource, InterfaceIpSource, IpManager, IpManagerConfig};
use pkg_metrics::{GatewayMetrics, MetricsRegistry, ProcessCollector};
use pkg_nginx::{
    ConfigDir, DynamicPusher, MonitorServer, NginxConfig, NginxRuntime, ProxyRuntime, RenderOptions,
    Renderer,
};
use pkg_portalloc::{PortAllocator, StatePortStore};
use pkg_state::{LeaseStore, StateStore};
use pkg_store::{ClusterWatcher, DeriveOptions, Snapshot, Store, WatcherConfig};
use pkg_types::error::GatewayError;

use crate::http::{self, HttpState};
use crate::lifecycle::{GatewayState, Lifecycle};
use crate::queue::{Task, TaskQueue};
use crate::reconcile::{GatewayController, pump_ip_events, pump_store_events};

/// Fully resolved gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub node_name: String,
    pub api_server: String,
    pub api_token: Option<String>,
    pub http_port: u16,
    pub https_port: u16,
    pub stream_port: u16,
    pub status_port: u16,
    pub health_port: u16,
    pub monitor_port: u16,
    pub state_dir: String,
    pub call_timeout: Duration,
    pub ignore_interfaces: Vec<String>,
    pub sync_rate: f64,
    pub sync_burst: u32,
    pub min_lb_port: u16,
    pub max_lb_port: u16,
    pub access_log: String,
    pub enable_metrics: bool,
    pub enable_ssl_stapling: bool,
    pub retry_non_idempotent: bool,
    pub nginx_binary: PathBuf,
    pub conf_dir: PathBuf,
}

/// Fails with a fatal error if any of `ports` is already bound.
pub fn check_ports_free(ports: &[u16]) -> anyhow::Result<()> {
    for &port in ports {
        if let Err(e) = StdTcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))) {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                return Err(GatewayError::Fatal(format!("port {} is already in use", port)).into());
            }
            warn!("Could not check port {}: {}", port, e);
        }
    }
    Ok(())
}

fn supervisor_exit(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match res {
        Ok(Ok(())) => GatewayError::Fatal("proxy supervisor exited".to_string()).into(),
        Ok(Err(e)) => e,
        Err(e) => e.into(),
    }
}

async fn join_quietly<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("{} task ended abnormally: {}", name, e);
            None
        }
    }
}

/// Run the gateway until `shutdown` fires or a fatal error occurs.
pub async fn run(options: GatewayOptions, shutdown: CancellationToken) -> anyhow::Result<()> {
    let ips = Arc::new(InterfaceIpSource::new(options.ignore_interfaces.clone()));
    run_with(options, ips, shutdown).await
}

async fn run_with(
    options: GatewayOptions,
    ips: Arc<dyn HostIpSource>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let lifecycle = Arc::new(Lifecycle::default());
    info!(
        "Gateway starting (node={}, http={}, https={}, conf_dir={})",
        options.node_name,
        options.http_port,
        options.https_port,
        options.conf_dir.display()
    );

    let mut ports = vec![
        options.http_port,
        options.https_port,
        options.status_port,
        options.stream_port,
        options.health_port,
    ];
    if options.enable_metrics {
        ports.push(options.monitor_port);
    }
    check_ports_free(&ports)?;

    let runtime = Arc::new(NginxRuntime::new(NginxConfig {
        binary: options.nginx_binary.clone(),
        main_conf: options.conf_dir.join(pkg_constants::paths::MAIN_CONF_FILE),
        status_port: options.status_port,
        call_timeout: options.call_timeout,
    })?);
    runtime.check_binary()?;

    let conf = ConfigDir::new(&options.conf_dir);
    conf.reset()?;
    let renderer = Renderer::new(RenderOptions {
        status_port: options.status_port,
        stream_port: options.stream_port,
        monitor_port: options.monitor_port,
        pid_file: options.conf_dir.join("nginx.pid"),
        access_log: options.access_log.clone(),
        enable_metrics: options.enable_metrics,
        enable_ssl_stapling: options.enable_ssl_stapling,
        retry_non_idempotent: options.retry_non_idempotent,
    })?;

    // The proxy needs a valid tree before it can start.
    let bootstrap = renderer.render(&Snapshot::default())?;
    let staged = conf.stage(&bootstrap)?;
    runtime
        .test(&staged)
        .await
        .map_err(|e| GatewayError::Fatal(format!("bootstrap configuration rejected: {:#}", e)))?;
    conf.promote(&bootstrap)?;

    let proxy_cancel = CancellationToken::new();
    let mut supervisor = runtime.clone().supervise(proxy_cancel.clone());

    let state_store = StateStore::new(&options.state_dir)
        .await
        .map_err(|e| GatewayError::Fatal(format!("coordination store unavailable: {:#}", e)))?;

    let store = Store::new(DeriveOptions {
        http_port: options.http_port,
        https_port: options.https_port,
    });
    let workers = shutdown.child_token();
    let watcher = ClusterWatcher::new(
        store.clone(),
        WatcherConfig {
            api_server: options.api_server.clone(),
            token: options.api_token.clone(),
            call_timeout: options.call_timeout,
            backoff: Duration::from_secs(2),
        },
    )?;
    let watcher_handle = watcher.start(workers.clone());

    tokio::select! {
        _ = store.wait_synced() => {}
        res = &mut supervisor => {
            workers.cancel();
            proxy_cancel.cancel();
            join_quietly("watcher", watcher_handle).await;
            if let Err(e) = state_store.close().await {
                warn!("Closing coordination store failed: {:#}", e);
            }
            return Err(supervisor_exit(res));
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before initial sync");
            workers.cancel();
            proxy_cancel.cancel();
            join_quietly("proxy supervisor", supervisor).await;
            join_quietly("watcher", watcher_handle).await;
            state_store.close().await?;
            return Ok(());
        }
    }

    let leases = Arc::new(LeaseStore::new(
        state_store.clone(),
        options.node_name.clone(),
        options.call_timeout,
    ));
    let ip_manager = IpManager::new(
        leases,
        ips,
        IpManagerConfig::new(options.node_name.clone()),
    );
    // Subscribe before the first poll so no membership change is missed.
    let ip_events = ip_manager.subscribe();
    let ip_handle = ip_manager.clone().start(workers.clone());

    let registry = Arc::new(MetricsRegistry::new());
    let metrics = Arc::new(GatewayMetrics::new(registry.clone()));
    let process = Arc::new(ProcessCollector::new(registry.clone()));
    let monitor_handle = if options.enable_metrics {
        let server = MonitorServer::bind(
            SocketAddr::from(([127, 0, 0, 1], options.monitor_port)),
            metrics.clone(),
        )
        .await?;
        Some(server.start(workers.clone()))
    } else {
        None
    };

    let queue = Arc::new(TaskQueue::new(options.sync_rate, options.sync_burst));
    let controller = GatewayController::new(
        store.clone(),
        ip_manager.clone(),
        renderer,
        conf,
        runtime.clone(),
        Arc::new(DynamicPusher::new(
            options.status_port,
            options.stream_port,
            options.call_timeout,
        )?),
        metrics,
        queue.clone(),
    );
    let pumps_cancel = CancellationToken::new();
    let store_pump = pump_store_events(store.subscribe(), queue.clone(), pumps_cancel.clone());
    let ip_pump = pump_ip_events(ip_events, queue.clone(), pumps_cancel.clone());
    let mut worker = controller.clone().start_worker();
    queue.add(Task::initial_sync());

    let allocator = Arc::new(PortAllocator::new(
        Arc::new(StatePortStore::new(state_store.clone())),
        options.min_lb_port,
        options.max_lb_port,
    ));
    let http_handle = http::serve(
        SocketAddr::from(([0, 0, 0, 0], options.health_port)),
        HttpState {
            lifecycle: lifecycle.clone(),
            runtime: runtime.clone() as Arc<dyn ProxyRuntime>,
            registry,
            process,
            allocator,
            queue: queue.clone(),
        },
        workers.clone(),
    )
    .await?;

    lifecycle.advance(GatewayState::Running);
    info!("Gateway running");

    let mut worker_done = false;
    let mut supervisor_done = false;
    let outcome: anyhow::Result<()> = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        res = &mut supervisor => {
            supervisor_done = true;
            Err(supervisor_exit(res))
        }
        res = &mut worker => {
            worker_done = true;
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            }
        }
    };
    if let Err(e) = &outcome {
        error!("Gateway failing: {:#}", e);
    }

    lifecycle.advance(GatewayState::ShuttingDown);
    info!("Gateway shutting down");

    // Stop producing, then let the worker finish what is queued.
    pumps_cancel.cancel();
    join_quietly("store event pump", store_pump).await;
    join_quietly("ip event pump", ip_pump).await;
    queue.close();
    if !worker_done {
        if let Some(Err(e)) = join_quietly("reconcile worker", worker).await {
            warn!("Reconcile worker stopped with error: {:#}", e);
        }
    }

    proxy_cancel.cancel();
    if !supervisor_done {
        join_quietly("proxy supervisor", supervisor).await;
    }

    workers.cancel();
    join_quietly("watcher", watcher_handle).await;
    join_quietly("ip manager", ip_handle).await;
    ip_manager.release_all().await;
    if let Some(handle) = monitor_handle {
        join_quietly("monitor", handle).await;
    }
    join_quietly("health server", http_handle).await;

    if let Err(e) = state_store.close().await {
        warn!("Closing coordination store failed: {:#}", e);
    }
    info!("Gateway stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::state::{GATEWAY_IP_PREFIX, LEASE_PREFIX};
    use pkg_ipmanager::StaticIpSource;
    use pkg_types::error::{ErrorKind, kind_of};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn occupied_port_is_fatal() {
        let listener = StdTcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = check_ports_free(&[port]).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::Fatal);
    }

    #[test]
    fn free_ports_pass() {
        let port = {
            let l = StdTcpListener::bind("0.0.0.0:0").unwrap();
            l.local_addr().unwrap().port()
        };
        check_ports_free(&[port]).unwrap();
    }

    // Validates and reloads successfully; the foreground run waits for TERM.
    fn fake_nginx(dir: &Path) -> PathBuf {
        let path = dir.join("nginx-bin");
        let body = format!(
            "#!/bin/sh\n\
             if [ \"$1\" = \"-t\" ] || [ \"$3\" = \"-s\" ]; then exit 0; fi\n\
             touch {dir}/started\n\
             trap 'touch {dir}/stopped; exit 0' TERM\n\
             while :; do sleep 0.05; done\n",
            dir = dir.display()
        );
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn free_ports(n: usize) -> Vec<u16> {
        let listeners: Vec<StdTcpListener> = (0..n)
            .map(|_| StdTcpListener::bind("0.0.0.0:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    async fn cluster_api() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/list"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"seq": 0, "items": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn run_starts_and_stops_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let api = cluster_api().await;
        let ports = free_ports(5);
        let state_dir = tmp.path().join("state").to_str().unwrap().to_string();
        let options = GatewayOptions {
            node_name: "gw-1".to_string(),
            api_server: api.uri(),
            api_token: None,
            http_port: ports[0],
            https_port: ports[1],
            stream_port: ports[2],
            status_port: ports[3],
            health_port: ports[4],
            monitor_port: 0,
            state_dir: state_dir.clone(),
            call_timeout: Duration::from_secs(5),
            ignore_interfaces: Vec::new(),
            sync_rate: 0.0,
            sync_burst: 1,
            min_lb_port: 30000,
            max_lb_port: 30010,
            access_log: String::new(),
            enable_metrics: false,
            enable_ssl_stapling: false,
            retry_non_idempotent: false,
            nginx_binary: fake_nginx(tmp.path()),
            conf_dir: tmp.path().join("conf"),
        };

        let shutdown = CancellationToken::new();
        let ips = Arc::new(StaticIpSource::new(["10.0.0.100"]));
        let handle = tokio::spawn(run_with(options, ips, shutdown.clone()));

        // Running with no status endpoint behind it reports the proxy, not the phase.
        let url = format!("http://127.0.0.1:{}/healthz", ports[4]);
        let mut running = false;
        for _ in 0..100 {
            if let Ok(resp) = reqwest::get(&url).await {
                if resp.text().await.unwrap_or_default() == "proxy not answering" {
                    running = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(running);
        assert!(tmp.path().join("started").exists());
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(tmp.path().join("stopped").exists());
        assert!(tmp.path().join("conf").join(pkg_constants::paths::MAIN_CONF_FILE).exists());

        let state = StateStore::new(&state_dir).await.unwrap();
        assert!(state.list_prefix(GATEWAY_IP_PREFIX).await.unwrap().is_empty());
        assert!(state.list_prefix(LEASE_PREFIX).await.unwrap().is_empty());
        state.close().await.unwrap();
    }
}
