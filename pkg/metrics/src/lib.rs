//! Metrics for the gateway controller.
//!
//! [`MetricsRegistry`] is a small thread-safe registry that renders the
//! Prometheus text exposition format. [`gateway::GatewayMetrics`] is the fixed
//! metric set of the controller and [`process::ProcessCollector`] samples the
//! controller process itself.

pub mod gateway;
pub mod process;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

pub use gateway::GatewayMetrics;
pub use process::ProcessCollector;

/// Sorted label pairs identifying one series of a metric family.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
struct LabelSet(Vec<(String, String)>);

impl LabelSet {
    fn new(labels: &[(&str, &str)]) -> Self {
        let mut pairs: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.sort();
        Self(pairs)
    }

    fn contains(&self, key: &str, value: &str) -> bool {
        self.0.iter().any(|(k, v)| k == key && v == value)
    }

    fn render(&self, extra: Option<(&str, &str)>) -> String {
        let mut pairs: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
            .collect();
        if let Some((k, v)) = extra {
            pairs.push(format!("{}=\"{}\"", k, escape(v)));
        }
        if pairs.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", pairs.join(","))
        }
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// A metric family: help text plus one value per label set.
struct Family<M> {
    help: String,
    series: BTreeMap<LabelSet, M>,
}

impl<M> Family<M> {
    fn new(help: &str) -> Self {
        Self {
            help: help.to_string(),
            series: BTreeMap::new(),
        }
    }
}

/// Monotonically increasing counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

/// Value that can go up or down.
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

/// Cumulative histogram with fixed upper bounds.
pub struct Histogram {
    bounds: Vec<f64>,
    data: Mutex<HistogramData>,
}

#[derive(Default, Clone)]
struct HistogramData {
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            data: Mutex::new(HistogramData {
                counts: vec![0; bounds.len()],
                sum: 0.0,
                count: 0,
            }),
        }
    }

    fn observe(&self, value: f64) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                data.counts[i] += 1;
            }
        }
        data.sum += value;
        data.count += 1;
    }

    fn snapshot(&self) -> HistogramData {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Family<Counter>>>,
    gauges: RwLock<BTreeMap<String, Family<Gauge>>>,
    histograms: RwLock<BTreeMap<String, (Vec<f64>, Family<Histogram>)>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a counter. If it already exists, this is a no-op.
    /// The unlabeled series starts at zero so it is rendered immediately.
    pub fn register_counter(&self, name: &str, help: &str) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters.entry(name.to_string()).or_insert_with(|| {
            let mut family = Family::new(help);
            family.series.insert(LabelSet::default(), Counter::default());
            family
        });
    }

    /// Register a counter family whose series all carry labels.
    pub fn register_counter_vec(&self, name: &str, help: &str) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(name.to_string())
            .or_insert_with(|| Family::new(help));
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        gauges.entry(name.to_string()).or_insert_with(|| {
            let mut family = Family::new(help);
            family.series.insert(LabelSet::default(), Gauge::default());
            family
        });
    }

    /// Register a gauge family whose series all carry labels.
    pub fn register_gauge_vec(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Family::new(help));
    }

    /// Register a histogram family with the given bucket upper bounds.
    pub fn register_histogram(&self, name: &str, help: &str, bounds: &[f64]) {
        let mut histograms = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        histograms
            .entry(name.to_string())
            .or_insert_with(|| (bounds.to_vec(), Family::new(help)));
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add_with(name, &[], 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        self.counter_add_with(name, &[], val);
    }

    /// Increment one labeled series of a counter family by 1.
    pub fn counter_inc_with(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add_with(name, labels, 1);
    }

    fn counter_add_with(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        let set = LabelSet::new(labels);
        {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            match counters.get(name) {
                None => return,
                Some(family) => {
                    if let Some(c) = family.series.get(&set) {
                        c.value.fetch_add(val, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        if let Some(family) = counters.get_mut(name) {
            family
                .series
                .entry(set)
                .or_default()
                .value
                .fetch_add(val, Ordering::Relaxed);
        }
    }

    /// Current value of a counter series, if registered.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        counters
            .get(name)?
            .series
            .get(&LabelSet::new(labels))
            .map(|c| c.value.load(Ordering::Relaxed))
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        self.gauge_set_with(name, &[], val);
    }

    /// Set one labeled series of a gauge family.
    pub fn gauge_set_with(&self, name: &str, labels: &[(&str, &str)], val: i64) {
        let set = LabelSet::new(labels);
        {
            let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
            match gauges.get(name) {
                None => return,
                Some(family) => {
                    if let Some(g) = family.series.get(&set) {
                        g.value.store(val, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        if let Some(family) = gauges.get_mut(name) {
            family
                .series
                .entry(set)
                .or_default()
                .value
                .store(val, Ordering::Relaxed);
        }
    }

    /// Increment a gauge by 1.
    pub fn gauge_inc(&self, name: &str) {
        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = gauges
            .get(name)
            .and_then(|f| f.series.get(&LabelSet::default()))
        {
            g.value.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrement a gauge by 1.
    pub fn gauge_dec(&self, name: &str) {
        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = gauges
            .get(name)
            .and_then(|f| f.series.get(&LabelSet::default()))
        {
            g.value.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Current value of a gauge series, if registered.
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        gauges
            .get(name)?
            .series
            .get(&LabelSet::new(labels))
            .map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Record one observation in a labeled histogram series.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let set = LabelSet::new(labels);
        {
            let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
            match histograms.get(name) {
                None => return,
                Some((_, family)) => {
                    if let Some(h) = family.series.get(&set) {
                        h.observe(value);
                        return;
                    }
                }
            }
        }
        let mut histograms = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        if let Some((bounds, family)) = histograms.get_mut(name) {
            family
                .series
                .entry(set)
                .or_insert_with(|| Histogram::new(bounds))
                .observe(value);
        }
    }

    /// Number of observations of a histogram series, if present.
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        histograms
            .get(name)?
            .1
            .series
            .get(&LabelSet::new(labels))
            .map(|h| h.snapshot().count)
    }

    /// Drop every series, in every family, that carries `key="value"`.
    /// Returns the number of series removed.
    pub fn remove_series_with_label(&self, key: &str, value: &str) -> usize {
        let mut removed = 0;
        {
            let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
            for family in counters.values_mut() {
                let before = family.series.len();
                family.series.retain(|labels, _| !labels.contains(key, value));
                removed += before - family.series.len();
            }
        }
        {
            let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
            for family in gauges.values_mut() {
                let before = family.series.len();
                family.series.retain(|labels, _| !labels.contains(key, value));
                removed += before - family.series.len();
            }
        }
        let mut histograms = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        for (_, family) in histograms.values_mut() {
            let before = family.series.len();
            family.series.retain(|labels, _| !labels.contains(key, value));
            removed += before - family.series.len();
        }
        removed
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        // Counters
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        for (name, family) in counters.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, family.help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            for (labels, counter) in &family.series {
                let _ = writeln!(
                    output,
                    "{}{} {}",
                    name,
                    labels.render(None),
                    counter.value.load(Ordering::Relaxed)
                );
            }
        }

        // Gauges
        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        for (name, family) in gauges.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, family.help);
            let _ = writeln!(output, "# TYPE {} gauge", name);
            for (labels, gauge) in &family.series {
                let _ = writeln!(
                    output,
                    "{}{} {}",
                    name,
                    labels.render(None),
                    gauge.value.load(Ordering::Relaxed)
                );
            }
        }

        // Histograms
        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        for (name, (bounds, family)) in histograms.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, family.help);
            let _ = writeln!(output, "# TYPE {} histogram", name);
            for (labels, histogram) in &family.series {
                let data = histogram.snapshot();
                for (bound, count) in bounds.iter().zip(&data.counts) {
                    let le = bound.to_string();
                    let _ = writeln!(
                        output,
                        "{}_bucket{} {}",
                        name,
                        labels.render(Some(("le", &le))),
                        count
                    );
                }
                let _ = writeln!(
                    output,
                    "{}_bucket{} {}",
                    name,
                    labels.render(Some(("le", "+Inf"))),
                    data.count
                );
                let _ = writeln!(output, "{}_sum{} {}", name, labels.render(None), data.sum);
                let _ = writeln!(output, "{}_count{} {}", name, labels.render(None), data.count);
            }
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
