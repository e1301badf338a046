//! Prometheus-compatible metrics for the proxy
//!
//! - Call counters and latency histograms per RPC method
//! - Shard call counters per pnode
//! - Read-only rejections, connected shards, uptime

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Latency bucket boundaries (milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, millis: f64) {
        let idx = LATENCY_BUCKETS
            .iter()
            .position(|&le| millis <= le)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        LATENCY_BUCKETS
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(&self.buckets)
            .map(|(le, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                (le, running)
            })
            .collect()
    }

    pub fn sum_millis(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-method call metrics
#[derive(Debug, Default)]
pub struct MethodMetrics {
    pub calls: Counter,
    pub errors: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    methods: Mutex<BTreeMap<String, Arc<MethodMetrics>>>,
    shard_calls: Mutex<BTreeMap<String, Arc<Counter>>>,

    pub read_only_rejections: Counter,
    pub shards_connected: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            methods: Mutex::new(BTreeMap::new()),
            shard_calls: Mutex::new(BTreeMap::new()),
            read_only_rejections: Counter::default(),
            shards_connected: Gauge::default(),
            start_time: Instant::now(),
        }
    }

    pub fn method(&self, method: &str) -> Arc<MethodMetrics> {
        let mut methods = self.methods.lock().unwrap_or_else(|e| e.into_inner());
        methods.entry(method.to_string()).or_default().clone()
    }

    /// Record a finished RPC call
    pub fn record_call(&self, method: &str, duration: Duration, success: bool) {
        let metrics = self.method(method);
        metrics.calls.inc();
        metrics.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            metrics.errors.inc();
        }
    }

    /// Record one request sent to a shard
    pub fn record_shard_call(&self, pnode: &str) {
        let mut shards = self.shard_calls.lock().unwrap_or_else(|e| e.into_inner());
        shards.entry(pnode.to_string()).or_default().inc();
    }

    pub fn shard_calls(&self, pnode: &str) -> u64 {
        let shards = self.shard_calls.lock().unwrap_or_else(|e| e.into_inner());
        shards.get(pnode).map(|c| c.get()).unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP ringproxy_uptime_seconds Process uptime in seconds");
        let _ = writeln!(out, "# TYPE ringproxy_uptime_seconds gauge");
        let _ = writeln!(out, "ringproxy_uptime_seconds {}", self.uptime_seconds());

        let _ = writeln!(out, "# HELP ringproxy_shards_connected Shard clients in the pool");
        let _ = writeln!(out, "# TYPE ringproxy_shards_connected gauge");
        let _ = writeln!(out, "ringproxy_shards_connected {}", self.shards_connected.get());

        let _ = writeln!(
            out,
            "# HELP ringproxy_read_only_rejections_total Writes refused by the read-only gate"
        );
        let _ = writeln!(out, "# TYPE ringproxy_read_only_rejections_total counter");
        let _ = writeln!(
            out,
            "ringproxy_read_only_rejections_total {}",
            self.read_only_rejections.get()
        );

        let methods = self.methods.lock().unwrap_or_else(|e| e.into_inner());

        let _ = writeln!(out, "# HELP ringproxy_rpc_calls_total RPC calls per method");
        let _ = writeln!(out, "# TYPE ringproxy_rpc_calls_total counter");
        for (method, m) in methods.iter() {
            let _ = writeln!(
                out,
                "ringproxy_rpc_calls_total{{method=\"{}\"}} {}",
                method,
                m.calls.get()
            );
        }

        let _ = writeln!(out, "# HELP ringproxy_rpc_errors_total Failed RPC calls per method");
        let _ = writeln!(out, "# TYPE ringproxy_rpc_errors_total counter");
        for (method, m) in methods.iter() {
            let _ = writeln!(
                out,
                "ringproxy_rpc_errors_total{{method=\"{}\"}} {}",
                method,
                m.errors.get()
            );
        }

        let _ = writeln!(out, "# HELP ringproxy_rpc_duration_ms RPC latency in milliseconds");
        let _ = writeln!(out, "# TYPE ringproxy_rpc_duration_ms histogram");
        for (method, m) in methods.iter() {
            for (le, count) in m.latency.cumulative() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "ringproxy_rpc_duration_ms_bucket{{method=\"{}\",le=\"{}\"}} {}",
                    method, le, count
                );
            }
            let _ = writeln!(
                out,
                "ringproxy_rpc_duration_ms_sum{{method=\"{}\"}} {}",
                method,
                m.latency.sum_millis()
            );
            let _ = writeln!(
                out,
                "ringproxy_rpc_duration_ms_count{{method=\"{}\"}} {}",
                method,
                m.latency.count()
            );
        }
        drop(methods);

        let shards = self.shard_calls.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "# HELP ringproxy_shard_calls_total Requests sent to each shard");
        let _ = writeln!(out, "# TYPE ringproxy_shard_calls_total counter");
        for (pnode, count) in shards.iter() {
            let _ = writeln!(
                out,
                "ringproxy_shard_calls_total{{pnode=\"{}\"}} {}",
                pnode,
                count.get()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_cumulative() {
        let hist = Histogram::new();
        hist.observe(0.5);
        hist.observe(30.0);
        hist.observe(9000.0);

        let buckets = hist.cumulative();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets[0], (1.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
        assert_eq!(hist.count(), 3);
    }

    #[test]
    fn test_record_call() {
        let registry = MetricsRegistry::new();
        registry.record_call("getObject", Duration::from_millis(3), true);
        registry.record_call("getObject", Duration::from_millis(7), false);

        let m = registry.method("getObject");
        assert_eq!(m.calls.get(), 2);
        assert_eq!(m.errors.get(), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.record_call("putObject", Duration::from_millis(12), true);
        registry.record_shard_call("tcp://1.moray:2020");
        registry.shards_connected.set(2);

        let text = registry.to_prometheus();
        assert!(text.contains("ringproxy_rpc_calls_total{method=\"putObject\"} 1"));
        assert!(text.contains("ringproxy_shard_calls_total{pnode=\"tcp://1.moray:2020\"} 1"));
        assert!(text.contains("ringproxy_shards_connected 2"));
        assert!(text.contains("le=\"+Inf\""));
    }
}
