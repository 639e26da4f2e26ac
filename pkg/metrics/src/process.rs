use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

use crate::MetricsRegistry;

pub const PROCESS_RESIDENT_MEMORY: &str = "process_resident_memory_bytes";
pub const PROCESS_VIRTUAL_MEMORY: &str = "process_virtual_memory_bytes";
pub const PROCESS_CPU_PERCENT: &str = "process_cpu_usage_percent";
pub const PROCESS_START_TIME: &str = "process_start_time_seconds";
pub const RUNTIME_WORKERS: &str = "tokio_runtime_workers";
pub const RUNTIME_ALIVE_TASKS: &str = "tokio_runtime_alive_tasks";

/// Samples the controller's own process and async runtime on every scrape.
pub struct ProcessCollector {
    registry: Arc<MetricsRegistry>,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessCollector {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        registry.register_gauge(PROCESS_RESIDENT_MEMORY, "Resident memory size in bytes");
        registry.register_gauge(PROCESS_VIRTUAL_MEMORY, "Virtual memory size in bytes");
        registry.register_gauge(PROCESS_CPU_PERCENT, "CPU usage of the process in percent");
        registry.register_gauge(PROCESS_START_TIME, "Start time of the process since unix epoch in seconds");
        registry.register_gauge(RUNTIME_WORKERS, "Worker threads of the async runtime");
        registry.register_gauge(RUNTIME_ALIVE_TASKS, "Tasks alive in the async runtime");

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Process metrics unavailable: {}", e);
                None
            }
        };
        Self {
            registry,
            pid,
            system: Mutex::new(System::new()),
        }
    }

    /// Refresh every process gauge.
    pub fn collect(&self) {
        if let Some(pid) = self.pid {
            let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = sys.process(pid) {
                self.registry
                    .gauge_set(PROCESS_RESIDENT_MEMORY, process.memory() as i64);
                self.registry
                    .gauge_set(PROCESS_VIRTUAL_MEMORY, process.virtual_memory() as i64);
                self.registry
                    .gauge_set(PROCESS_CPU_PERCENT, process.cpu_usage().round() as i64);
                self.registry
                    .gauge_set(PROCESS_START_TIME, process.start_time() as i64);
            }
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let metrics = handle.metrics();
            self.registry
                .gauge_set(RUNTIME_WORKERS, metrics.num_workers() as i64);
            self.registry
                .gauge_set(RUNTIME_ALIVE_TASKS, metrics.num_alive_tasks() as i64);
        }
    }
}
