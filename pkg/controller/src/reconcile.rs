use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pkg_ipmanager::{IpEvent, IpManager};
use pkg_metrics::GatewayMetrics;
use pkg_nginx::{ConfigDir, ProxyRuntime, Renderer, UpstreamSync};
use pkg_store::{Snapshot, Store, StoreEvent};
use pkg_types::error::{ErrorKind, GatewayError, kind_of};

use crate::queue::{Task, TaskQueue, TaskReason};

/// Addresses the gateway currently holds, used to filter L4 listeners.
#[async_trait]
pub trait LocalIps: Send + Sync {
    async fn local_ips(&self) -> BTreeSet<String>;
}

#[async_trait]
impl LocalIps for IpManager {
    async fn local_ips(&self) -> BTreeSet<String> {
        self.current_ips().await
    }
}

/// What a reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    /// Only pool members changed and the backend tables were pushed.
    Pushed,
    /// A pool-only change could not be pushed; a full reload is scheduled.
    PushFailed,
    Reloaded,
}

pub struct GatewayController {
    store: Arc<Store>,
    local_ips: Arc<dyn LocalIps>,
    renderer: Renderer,
    conf: ConfigDir,
    runtime: Arc<dyn ProxyRuntime>,
    upstreams: Arc<dyn UpstreamSync>,
    metrics: Arc<GatewayMetrics>,
    queue: Arc<TaskQueue>,
    running: Mutex<Option<Arc<Snapshot>>>,
    needs_reload: AtomicBool,
}

impl GatewayController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        local_ips: Arc<dyn LocalIps>,
        renderer: Renderer,
        conf: ConfigDir,
        runtime: Arc<dyn ProxyRuntime>,
        upstreams: Arc<dyn UpstreamSync>,
        metrics: Arc<GatewayMetrics>,
        queue: Arc<TaskQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            local_ips,
            renderer,
            conf,
            runtime,
            upstreams,
            metrics,
            queue,
            running: Mutex::new(None),
            needs_reload: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn runtime(&self) -> &Arc<dyn ProxyRuntime> {
        &self.runtime
    }

    /// The snapshot the proxy is currently serving.
    pub fn running(&self) -> Option<Arc<Snapshot>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn swap_running(&self, next: Arc<Snapshot>) {
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(next);
    }

    pub fn needs_reload(&self) -> bool {
        self.needs_reload.load(Ordering::Acquire)
    }

    /// Bring the proxy in line with the store.
    pub async fn reconcile(&self, task: &Task) -> anyhow::Result<Outcome> {
        let ips = self.local_ips.local_ips().await;
        let next = Arc::new(self.store.snapshot(&ips));
        let forced = self.needs_reload();

        if let Some(current) = self.running() {
            if !forced && current.equals(&next) {
                debug!(task = %task.key, "Snapshot unchanged");
                return Ok(Outcome::Unchanged);
            }
            if !forced && task.reason != TaskReason::IpChange && current.only_pool_nodes_changed(&next) {
                return Ok(self.push_pools(next).await);
            }
        }
        self.reload(next).await?;
        Ok(Outcome::Reloaded)
    }

    async fn push_pools(&self, next: Arc<Snapshot>) -> Outcome {
        match self.push_all(&next).await {
            Ok(()) => {
                self.metrics.inc_dynamic_push(true);
                self.record_applied(&next);
                self.swap_running(next);
                Outcome::Pushed
            }
            Err(e) => {
                self.metrics.inc_dynamic_push(false);
                warn!("Dynamic backend push failed, scheduling reload: {}", e);
                self.schedule_reload();
                Outcome::PushFailed
            }
        }
    }

    async fn push_all(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.upstreams.push_http(&snapshot.http_pools).await?;
        self.upstreams.push_stream(&snapshot.tcp_pools).await
    }

    fn schedule_reload(&self) {
        self.needs_reload.store(true, Ordering::Release);
        self.queue.add(Task::resync());
    }

    /// Render, stage, validate, promote, reload, then hand the backend
    /// tables to the freshly loaded workers.
    async fn reload(&self, next: Arc<Snapshot>) -> anyhow::Result<()> {
        let rendered = match self.renderer.render(&next) {
            Ok(r) => r,
            Err(e) => {
                self.metrics.inc_update_err();
                return Err(GatewayError::ConfigRejected(format!("render: {}", e)).into());
            }
        };
        let staged = self.conf.stage(&rendered)?;
        if let Err(e) = self.runtime.test(&staged).await {
            self.metrics.inc_update_err();
            if let Err(discard) = self.conf.discard_staging() {
                warn!("Failed to discard staging tree: {}", discard);
            }
            return Err(e);
        }
        self.conf.promote(&rendered)?;
        if let Err(e) = self.runtime.reload().await {
            self.metrics.inc_update_err();
            self.needs_reload.store(true, Ordering::Release);
            return Err(e);
        }
        self.metrics.inc_update();
        info!(
            "Proxy reloaded (http_servers={}, l4_servers={}, pools={})",
            next.l7_services.len(),
            next.l4_services.len(),
            next.http_pools.len() + next.tcp_pools.len()
        );

        match self.push_all(&next).await {
            Ok(()) => {
                self.metrics.inc_dynamic_push(true);
                self.needs_reload.store(false, Ordering::Release);
            }
            Err(e) => {
                self.metrics.inc_dynamic_push(false);
                warn!("Backend push after reload failed: {}", e);
                self.schedule_reload();
            }
        }
        self.record_applied(&next);
        self.swap_running(next);
        Ok(())
    }

    fn record_applied(&self, snapshot: &Snapshot) {
        self.metrics
            .set_active_servers(snapshot.l7_services.len(), snapshot.l4_services.len());
        self.metrics.observe_snapshot_hosts(&snapshot.server_names());
    }

    /// Drain the queue serially until it is closed. Returns an error only
    /// for fatal failures.
    pub fn start_worker(self: Arc<Self>) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            info!("Reconcile worker started");
            while let Some(task) = self.queue.get().await {
                let result = AssertUnwindSafe(self.reconcile(&task)).catch_unwind().await;
                match result {
                    Ok(Ok(outcome)) => {
                        debug!(task = %task.key, reason = %task.reason, ?outcome, "Reconciled")
                    }
                    Ok(Err(e)) => match kind_of(&e) {
                        ErrorKind::Fatal => {
                            error!(task = %task.key, "Fatal reconcile error: {:#}", e);
                            return Err(e);
                        }
                        ErrorKind::ConfigGeneration => {
                            warn!(task = %task.key, "Proxy rejected configuration, keeping previous: {:#}", e)
                        }
                        kind => warn!(task = %task.key, %kind, "Reconcile error: {:#}", e),
                    },
                    Err(_) => error!(task = %task.key, "Reconcile panicked"),
                }
            }
            info!("Reconcile worker stopped");
            Ok(())
        })
    }
}

/// Turn store events into tasks. A lagged receiver lost events, which a
/// full resync makes up for.
pub fn pump_store_events(
    mut rx: broadcast::Receiver<StoreEvent>,
    queue: Arc<TaskQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                ev = rx.recv() => ev,
                _ = cancel.cancelled() => break,
            };
            match event {
                Ok(ev) => {
                    queue.add(Task::store_change(&ev));
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Store event channel lagged by {} events, resyncing", n);
                    queue.add(Task::resync());
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn pump_ip_events(
    mut rx: broadcast::Receiver<IpEvent>,
    queue: Arc<TaskQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                ev = rx.recv() => ev,
                _ = cancel.cancelled() => break,
            };
            match event {
                Ok(ev) => {
                    info!("Host IP event: {:?}", ev);
                    queue.add(Task::ip_change(&ev));
                }
                Err(RecvError::Lagged(_)) => {
                    queue.add(Task::resync());
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
