use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::MetricsRegistry;

pub const NGINX_UPDATE_TOTAL: &str = "nginx_update_total";
pub const NGINX_UPDATE_ERR_TOTAL: &str = "nginx_update_err_total";
pub const NGINX_ACTIVE_SERVER: &str = "nginx_active_server";
pub const NGINX_REQUEST_DURATION: &str = "nginx_request_duration_seconds";
pub const NGINX_REQUESTS_TOTAL: &str = "nginx_requests_total";
pub const DYNAMIC_PUSH_TOTAL: &str = "dynamic_push_total";

/// Label for requests whose host is not served by any virtual service.
pub const UNMATCHED_HOST: &str = "_";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Fixed metric set of the gateway controller.
///
/// Per-host series are retired once a host has been absent from two
/// consecutive snapshots, so a host that blinks out for a single reconcile
/// keeps its history. Samples for hosts no snapshot knows are counted under
/// [`UNMATCHED_HOST`].
pub struct GatewayMetrics {
    registry: Arc<MetricsRegistry>,
    hosts: Mutex<HostTracker>,
}

#[derive(Default)]
struct HostTracker {
    previous: BTreeSet<String>,
    // Hosts missing from the last snapshot, removed if still missing from the next.
    pending: BTreeSet<String>,
}

impl GatewayMetrics {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        registry.register_counter(NGINX_UPDATE_TOTAL, "Successful proxy configuration reloads");
        registry.register_counter(NGINX_UPDATE_ERR_TOTAL, "Rejected or failed proxy configuration reloads");
        registry.register_gauge_vec(NGINX_ACTIVE_SERVER, "Active virtual servers by type");
        registry.register_histogram(
            NGINX_REQUEST_DURATION,
            "Request duration observed by the proxy, per host",
            DURATION_BUCKETS,
        );
        registry.register_counter_vec(NGINX_REQUESTS_TOTAL, "Requests by host and status class");
        registry.register_counter_vec(DYNAMIC_PUSH_TOTAL, "Dynamic upstream pushes by result");
        registry.gauge_set_with(NGINX_ACTIVE_SERVER, &[("type", "http")], 0);
        registry.gauge_set_with(NGINX_ACTIVE_SERVER, &[("type", "tcp")], 0);
        Self {
            registry,
            hosts: Mutex::new(HostTracker::default()),
        }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn inc_update(&self) {
        self.registry.counter_inc(NGINX_UPDATE_TOTAL);
    }

    pub fn inc_update_err(&self) {
        self.registry.counter_inc(NGINX_UPDATE_ERR_TOTAL);
    }

    pub fn update_total(&self) -> u64 {
        self.registry.counter_value(NGINX_UPDATE_TOTAL, &[]).unwrap_or(0)
    }

    pub fn update_err_total(&self) -> u64 {
        self.registry
            .counter_value(NGINX_UPDATE_ERR_TOTAL, &[])
            .unwrap_or(0)
    }

    pub fn set_active_servers(&self, http: usize, tcp: usize) {
        self.registry
            .gauge_set_with(NGINX_ACTIVE_SERVER, &[("type", "http")], http as i64);
        self.registry
            .gauge_set_with(NGINX_ACTIVE_SERVER, &[("type", "tcp")], tcp as i64);
    }

    pub fn inc_dynamic_push(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.registry
            .counter_inc_with(DYNAMIC_PUSH_TOTAL, &[("result", result)]);
    }

    pub fn dynamic_push_total(&self, success: bool) -> u64 {
        let result = if success { "success" } else { "failure" };
        self.registry
            .counter_value(DYNAMIC_PUSH_TOTAL, &[("result", result)])
            .unwrap_or(0)
    }

    fn host_label<'a>(&self, host: &'a str) -> &'a str {
        let tracker = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        if tracker.previous.contains(host) || tracker.pending.contains(host) {
            host
        } else {
            UNMATCHED_HOST
        }
    }

    /// Record one request sample reported by the proxy.
    pub fn observe_request(&self, host: &str, status: u16, seconds: f64) {
        let host = self.host_label(host);
        let class = status_class(status);
        self.registry
            .histogram_observe(NGINX_REQUEST_DURATION, &[("host", host)], seconds);
        self.registry
            .counter_inc_with(NGINX_REQUESTS_TOTAL, &[("host", host), ("status", class)]);
    }

    /// Drop every per-host series of the given hosts.
    pub fn remove_host_metrics<'a>(&self, hosts: impl IntoIterator<Item = &'a String>) {
        for host in hosts {
            let removed = self.registry.remove_series_with_label("host", host);
            debug!(host = %host, removed, "Retired host metrics");
        }
    }

    /// Feed the server names of a freshly applied snapshot.
    pub fn observe_snapshot_hosts(&self, current: &BTreeSet<String>) {
        let retire: Vec<String> = {
            let mut tracker = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            let retire: Vec<String> = tracker
                .pending
                .iter()
                .filter(|h| !current.contains(*h) && h.as_str() != UNMATCHED_HOST)
                .cloned()
                .collect();
            let newly_missing: BTreeSet<String> =
                tracker.previous.difference(current).cloned().collect();
            tracker.pending = newly_missing;
            tracker.previous = current.clone();
            retire
        };
        self.remove_host_metrics(retire.iter());
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn update_counters_and_active_servers() {
        let metrics = GatewayMetrics::new(Arc::new(MetricsRegistry::new()));
        metrics.inc_update();
        metrics.inc_update();
        metrics.inc_update_err();
        metrics.set_active_servers(3, 1);

        assert_eq!(metrics.update_total(), 2);
        assert_eq!(metrics.update_err_total(), 1);
        let text = metrics.registry().render();
        assert!(text.contains("nginx_active_server{type=\"http\"} 3"));
        assert!(text.contains("nginx_active_server{type=\"tcp\"} 1"));
    }

    #[test]
    fn requests_are_bucketed_by_status_class() {
        let metrics = GatewayMetrics::new(Arc::new(MetricsRegistry::new()));
        metrics.observe_snapshot_hosts(&hosts(&["foo.example.com"]));
        metrics.observe_request("foo.example.com", 200, 0.02);
        metrics.observe_request("foo.example.com", 204, 0.03);
        metrics.observe_request("foo.example.com", 502, 1.5);

        let registry = metrics.registry();
        assert_eq!(
            registry.counter_value(NGINX_REQUESTS_TOTAL, &[("host", "foo.example.com"), ("status", "2xx")]),
            Some(2)
        );
        assert_eq!(
            registry.histogram_count(NGINX_REQUEST_DURATION, &[("host", "foo.example.com")]),
            Some(3)
        );
    }

    #[test]
    fn host_retired_after_two_missing_snapshots() {
        let metrics = GatewayMetrics::new(Arc::new(MetricsRegistry::new()));
        metrics.observe_snapshot_hosts(&hosts(&["a.example.com", "b.example.com"]));
        metrics.observe_request("a.example.com", 200, 0.1);
        metrics.observe_request("b.example.com", 200, 0.1);

        metrics.observe_snapshot_hosts(&hosts(&["b.example.com"]));
        assert!(metrics.registry().render().contains("a.example.com"));

        metrics.observe_snapshot_hosts(&hosts(&["b.example.com"]));
        let text = metrics.registry().render();
        assert!(!text.contains("a.example.com"));
        assert!(text.contains("b.example.com"));
    }

    #[test]
    fn unknown_hosts_share_one_series() {
        let metrics = GatewayMetrics::new(Arc::new(MetricsRegistry::new()));
        metrics.observe_snapshot_hosts(&hosts(&["a.example.com"]));
        for i in 0..100 {
            metrics.observe_request(&format!("scan-{i}.invalid"), 404, 0.001);
        }
        metrics.observe_request("a.example.com", 200, 0.1);

        let registry = metrics.registry();
        assert_eq!(
            registry.counter_value(NGINX_REQUESTS_TOTAL, &[("host", UNMATCHED_HOST), ("status", "4xx")]),
            Some(100)
        );
        let text = registry.render();
        assert!(!text.contains("scan-"));
        assert!(text.contains("a.example.com"));
    }

    #[test]
    fn host_that_returns_is_kept() {
        let metrics = GatewayMetrics::new(Arc::new(MetricsRegistry::new()));
        metrics.observe_snapshot_hosts(&hosts(&["a.example.com"]));
        metrics.observe_request("a.example.com", 200, 0.1);

        metrics.observe_snapshot_hosts(&hosts(&[]));
        metrics.observe_snapshot_hosts(&hosts(&["a.example.com"]));
        metrics.observe_snapshot_hosts(&hosts(&["a.example.com"]));
        assert!(metrics.registry().render().contains("a.example.com"));
    }

    #[test]
    fn dynamic_push_results() {
        let metrics = GatewayMetrics::new(Arc::new(MetricsRegistry::new()));
        metrics.inc_dynamic_push(true);
        metrics.inc_dynamic_push(false);
        metrics.inc_dynamic_push(false);
        assert_eq!(metrics.dynamic_push_total(true), 1);
        assert_eq!(metrics.dynamic_push_total(false), 2);
    }
}
