use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ring::RingBuffer;

pub const DEFAULT_SAMPLES: usize = 100;

#[derive(Default)]
struct Samples {
    node_durations: HashMap<String, RingBuffer<u64>>,
    node_failures: HashMap<String, u64>,
    flow_completions: HashMap<String, RingBuffer<u64>>,
    active_runs: i64,
}

/// Aggregate view over retained samples
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleSummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl SampleSummary {
    fn of(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let total: u64 = samples.iter().sum();
        Self {
            count: samples.len(),
            avg_ms: total as f64 / samples.len() as f64,
            min_ms: samples.iter().copied().min().unwrap_or_default(),
            max_ms: samples.iter().copied().max().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Node id to retained execution durations, oldest first
    pub node_durations_ms: BTreeMap<String, Vec<u64>>,
    pub node_failures: BTreeMap<String, u64>,
    /// Flow id to retained completion durations, oldest first
    pub flow_completions_ms: BTreeMap<String, Vec<u64>>,
    pub active_flow_runs: i64,
    pub node_summary: BTreeMap<String, SampleSummary>,
    pub flow_summary: BTreeMap<String, SampleSummary>,
}

/// Process-local execution metrics.
///
/// Constructed once and shared behind an `Arc`; nothing here is persisted.
pub struct MetricsCollector {
    capacity: usize,
    samples: Mutex<Samples>,

    nodes_executed: IntCounter,
    nodes_failed: IntCounter,
    node_duration: Histogram,
    flows_started: IntCounter,
    flows_completed: IntCounter,
    flows_failed: IntCounter,
    flow_duration: Histogram,
    active_flow_runs: IntGauge,

    registry: Registry,
}

impl MetricsCollector {
    /// Create a collector retaining `capacity` samples per key
    pub fn new(capacity: usize) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let nodes_executed = IntCounter::new(
            "flowrun_node_executions_total",
            "Total number of node executions",
        )?;
        registry.register(Box::new(nodes_executed.clone()))?;

        let nodes_failed = IntCounter::new(
            "flowrun_node_failures_total",
            "Total number of failed node executions",
        )?;
        registry.register(Box::new(nodes_failed.clone()))?;

        let node_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flowrun_node_duration_seconds",
                "Node execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(node_duration.clone()))?;

        let flows_started = IntCounter::new(
            "flowrun_flow_runs_started_total",
            "Total number of flow runs started",
        )?;
        registry.register(Box::new(flows_started.clone()))?;

        let flows_completed = IntCounter::new(
            "flowrun_flow_runs_completed_total",
            "Total number of flow runs completed successfully",
        )?;
        registry.register(Box::new(flows_completed.clone()))?;

        let flows_failed = IntCounter::new(
            "flowrun_flow_runs_failed_total",
            "Total number of flow runs ending in error",
        )?;
        registry.register(Box::new(flows_failed.clone()))?;

        let flow_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flowrun_flow_duration_seconds",
                "Flow run duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0]),
        )?;
        registry.register(Box::new(flow_duration.clone()))?;

        let active_flow_runs = IntGauge::new(
            "flowrun_active_flow_runs",
            "Number of flow runs started and not yet finished",
        )?;
        registry.register(Box::new(active_flow_runs.clone()))?;

        Ok(Self {
            capacity,
            samples: Mutex::new(Samples::default()),
            nodes_executed,
            nodes_failed,
            node_duration,
            flows_started,
            flows_completed,
            flows_failed,
            flow_duration,
            active_flow_runs,
            registry,
        })
    }

    fn with_samples<T>(&self, f: impl FnOnce(&mut Samples) -> T) -> T {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut samples)
    }

    pub fn record_node_execution(&self, node_id: &str, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let capacity = self.capacity;
        self.with_samples(|s| {
            s.node_durations
                .entry(node_id.to_string())
                .or_insert_with(|| RingBuffer::new(capacity))
                .push(ms);
        });
        self.nodes_executed.inc();
        self.node_duration.observe(duration.as_secs_f64());
        debug!(node_id = %node_id, duration_ms = ms, "Recorded node execution");
    }

    pub fn record_node_failure(&self, node_id: &str) {
        self.with_samples(|s| *s.node_failures.entry(node_id.to_string()).or_default() += 1);
        self.nodes_failed.inc();
    }

    pub fn flow_started(&self, flow_id: &str) {
        self.with_samples(|s| s.active_runs += 1);
        self.flows_started.inc();
        self.active_flow_runs.inc();
        debug!(flow_id = %flow_id, "Flow run started");
    }

    /// Record a finished run. `duration` is `None` for runs whose start
    /// time is unknown.
    pub fn flow_finished(&self, flow_id: &str, duration: Option<Duration>, success: bool) {
        let capacity = self.capacity;
        let decremented = self.with_samples(|s| {
            if let Some(duration) = duration {
                s.flow_completions
                    .entry(flow_id.to_string())
                    .or_insert_with(|| RingBuffer::new(capacity))
                    .push(duration.as_millis() as u64);
            }
            if s.active_runs > 0 {
                s.active_runs -= 1;
                true
            } else {
                false
            }
        });
        if decremented {
            self.active_flow_runs.dec();
        } else {
            warn!(flow_id = %flow_id, "Flow run finished without a matching start");
        }
        if let Some(duration) = duration {
            self.flow_duration.observe(duration.as_secs_f64());
        }
        if success {
            self.flows_completed.inc();
        } else {
            self.flows_failed.inc();
        }
    }

    pub fn active_flow_runs(&self) -> i64 {
        self.with_samples(|s| s.active_runs)
    }

    pub fn node_failures(&self, node_id: &str) -> u64 {
        self.with_samples(|s| s.node_failures.get(node_id).copied().unwrap_or(0))
    }

    pub fn node_durations(&self, node_id: &str) -> Vec<u64> {
        self.with_samples(|s| {
            s.node_durations
                .get(node_id)
                .map(RingBuffer::to_vec)
                .unwrap_or_default()
        })
    }

    pub fn flow_completions(&self, flow_id: &str) -> Vec<u64> {
        self.with_samples(|s| {
            s.flow_completions
                .get(flow_id)
                .map(RingBuffer::to_vec)
                .unwrap_or_default()
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with_samples(|s| {
            let node_durations_ms: BTreeMap<String, Vec<u64>> = s
                .node_durations
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect();
            let flow_completions_ms: BTreeMap<String, Vec<u64>> = s
                .flow_completions
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect();
            MetricsSnapshot {
                node_summary: node_durations_ms
                    .iter()
                    .map(|(k, v)| (k.clone(), SampleSummary::of(v)))
                    .collect(),
                flow_summary: flow_completions_ms
                    .iter()
                    .map(|(k, v)| (k.clone(), SampleSummary::of(v)))
                    .collect(),
                node_durations_ms,
                flow_completions_ms,
                node_failures: s.node_failures.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                active_flow_runs: s.active_runs,
            }
        })
    }

    /// Registry for scraping
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES).expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retains_most_recent_hundred_samples() {
        let metrics = MetricsCollector::new(100).unwrap();
        for i in 0..150u64 {
            metrics.record_node_execution("n1", Duration::from_millis(i));
        }
        let kept = metrics.node_durations("n1");
        assert_eq!(kept.len(), 100);
        assert_eq!(kept, (50..150).collect::<Vec<u64>>());
    }

    #[test]
    fn test_active_gauge_tracks_runs() {
        let metrics = MetricsCollector::default();
        metrics.flow_started("f");
        metrics.flow_started("f");
        metrics.flow_finished("f", Some(Duration::from_millis(20)), true);
        assert_eq!(metrics.active_flow_runs(), 1);
        metrics.flow_finished("f", Some(Duration::from_millis(40)), false);
        metrics.flow_finished("f", None, false);
        assert_eq!(metrics.active_flow_runs(), 0);
        assert_eq!(metrics.flow_completions("f"), vec![20, 40]);
    }

    #[test]
    fn test_snapshot_and_exposition() {
        let metrics = MetricsCollector::default();
        metrics.record_node_execution("a", Duration::from_millis(10));
        metrics.record_node_execution("a", Duration::from_millis(30));
        metrics.record_node_failure("a");

        let snap = metrics.snapshot();
        assert_eq!(snap.node_failures["a"], 1);
        assert_eq!(snap.node_summary["a"].count, 2);
        assert_eq!(snap.node_summary["a"].avg_ms, 20.0);
        assert_eq!(snap.node_summary["a"].max_ms, 30);

        let text = metrics.gather_text();
        assert!(text.contains("flowrun_node_executions_total 2"));
        assert!(text.contains("flowrun_node_failures_total 1"));
    }
}
