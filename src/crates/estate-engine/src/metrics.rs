//! Per-node latency and success counters.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters for one node or worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_elapsed_ms: u64,
    pub last_elapsed_ms: u64,
}

impl NodeStats {
    pub fn mean_elapsed_ms(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.total_elapsed_ms as f64 / self.invocations as f64
        }
    }
}

/// Engine-scoped metrics. One instance per engine, injected at
/// construction; there are no global registries.
#[derive(Default)]
pub struct MetricsRegistry {
    nodes: DashMap<String, NodeStats>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: &str, elapsed: Duration, success: bool) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let mut stats = self.nodes.entry(node.to_string()).or_default();
        stats.invocations += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_elapsed_ms += elapsed_ms;
        stats.last_elapsed_ms = elapsed_ms;
    }

    pub fn stats(&self, node: &str) -> NodeStats {
        self.nodes.get(node).map(|s| *s).unwrap_or_default()
    }

    /// Stable snapshot of all counters, ordered by node name.
    pub fn snapshot(&self) -> BTreeMap<String, NodeStats> {
        self.nodes
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
