use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default buckets (seconds) for sync and programming latency histograms.
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096,
    8.192, 16.384,
];

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
    histograms: RwLock<BTreeMap<String, Histogram>>,
}

/// Monotonically increasing counter.
pub struct Counter {
    value: AtomicU64,
    help: String,
}

/// Value that can go up or down.
pub struct Gauge {
    value: AtomicI64,
    help: String,
}

/// Cumulative histogram over fixed upper bounds.
pub struct Histogram {
    help: String,
    bounds: Vec<f64>,
    state: Mutex<HistogramState>,
}

#[derive(Default)]
struct HistogramState {
    buckets: Vec<u64>,
    sum: f64,
    count: u64,
}

// A panicking writer leaves plain numbers behind, so poisoned locks are still usable.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
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
    pub fn register_counter(&self, name: &str, help: &str) {
        write(&self.counters)
            .entry(name.to_string())
            .or_insert_with(|| Counter {
                value: AtomicU64::new(0),
                help: help.to_string(),
            });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| Gauge {
                value: AtomicI64::new(0),
                help: help.to_string(),
            });
    }

    /// Register a histogram with the given bucket upper bounds.
    pub fn register_histogram(&self, name: &str, help: &str, buckets: &[f64]) {
        let mut bounds = buckets.to_vec();
        bounds.sort_by(|a, b| a.total_cmp(b));
        bounds.dedup();
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram {
                help: help.to_string(),
                state: Mutex::new(HistogramState {
                    buckets: vec![0; bounds.len()],
                    ..Default::default()
                }),
                bounds,
            });
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        if let Some(c) = read(&self.counters).get(name) {
            c.value.fetch_add(val, Ordering::Relaxed);
        }
    }

    pub fn counter_get(&self, name: &str) -> Option<u64> {
        read(&self.counters)
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    /// Increment a gauge by 1.
    pub fn gauge_inc(&self, name: &str) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.value.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decrement a gauge by 1.
    pub fn gauge_dec(&self, name: &str) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.value.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn gauge_get(&self, name: &str) -> Option<i64> {
        read(&self.gauges)
            .get(name)
            .map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Record one observation in a histogram.
    pub fn histogram_observe(&self, name: &str, val: f64) {
        let histograms = read(&self.histograms);
        let Some(h) = histograms.get(name) else {
            return;
        };
        let mut state = h.state.lock().unwrap_or_else(|e| e.into_inner());
        for (i, bound) in h.bounds.iter().enumerate() {
            if val <= *bound {
                state.buckets[i] += 1;
            }
        }
        state.sum += val;
        state.count += 1;
    }

    /// Number of observations recorded in a histogram.
    pub fn histogram_count(&self, name: &str) -> Option<u64> {
        read(&self.histograms)
            .get(name)
            .map(|h| h.state.lock().unwrap_or_else(|e| e.into_inner()).count)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        for (name, counter) in read(&self.counters).iter() {
            output.push_str(&format!("# HELP {} {}\n", name, counter.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                counter.value.load(Ordering::Relaxed)
            ));
        }

        for (name, gauge) in read(&self.gauges).iter() {
            output.push_str(&format!("# HELP {} {}\n", name, gauge.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                gauge.value.load(Ordering::Relaxed)
            ));
        }

        for (name, hist) in read(&self.histograms).iter() {
            let state = hist.state.lock().unwrap_or_else(|e| e.into_inner());
            output.push_str(&format!("# HELP {} {}\n", name, hist.help));
            output.push_str(&format!("# TYPE {} histogram\n", name));
            for (bound, count) in hist.bounds.iter().zip(state.buckets.iter()) {
                output.push_str(&format!(
                    "{}_bucket{{le=\"{}\"}} {}\n",
                    name, bound, count
                ));
            }
            output.push_str(&format!(
                "{}_bucket{{le=\"+Inf\"}} {}\n",
                name, state.count
            ));
            output.push_str(&format!("{}_sum {}\n", name, state.sum));
            output.push_str(&format!("{}_count {}\n", name, state.count));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_names_are_ignored() {
        let reg = MetricsRegistry::new();
        reg.counter_inc("missing_total");
        reg.gauge_set("missing", 3);
        reg.histogram_observe("missing_seconds", 0.5);
        assert_eq!(reg.counter_get("missing_total"), None);
        assert!(reg.render().is_empty());
    }

    #[test]
    fn counters_and_gauges_render() {
        let reg = MetricsRegistry::new();
        reg.register_counter("sync_total", "Syncs");
        reg.register_gauge("pending", "Pending changes");
        reg.counter_inc("sync_total");
        reg.counter_add("sync_total", 2);
        reg.gauge_set("pending", 5);
        reg.gauge_dec("pending");

        assert_eq!(reg.counter_get("sync_total"), Some(3));
        assert_eq!(reg.gauge_get("pending"), Some(4));
        let out = reg.render();
        assert!(out.contains("# TYPE sync_total counter\nsync_total 3\n"));
        assert!(out.contains("# TYPE pending gauge\npending 4\n"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let reg = MetricsRegistry::new();
        reg.register_histogram("sync_seconds", "Sync latency", &[0.1, 1.0]);
        reg.histogram_observe("sync_seconds", 0.05);
        reg.histogram_observe("sync_seconds", 0.5);
        reg.histogram_observe("sync_seconds", 5.0);

        assert_eq!(reg.histogram_count("sync_seconds"), Some(3));
        let out = reg.render();
        assert!(out.contains("sync_seconds_bucket{le=\"0.1\"} 1\n"));
        assert!(out.contains("sync_seconds_bucket{le=\"1\"} 2\n"));
        assert!(out.contains("sync_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(out.contains("sync_seconds_count 3\n"));
    }
}
