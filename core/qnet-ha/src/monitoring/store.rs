//! Per-node metrics store
//!
//! All fault-count and recovery-flag changes happen inside one lock so that
//! concurrent samples cannot both cross the threshold.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::traits::ProbeSample;

/// Performance and fault counters for one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMetrics {
    pub node_id: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_traffic: u64,
    pub latency_ms: u64,
    pub last_checked: Option<DateTime<Utc>>,
    /// Faulty samples since the last healthy one
    pub fault_count: u32,
    pub is_healthy: bool,
    /// Set only once `fault_count` reached the threshold
    pub is_faulty: bool,
    /// True between recovery start and completion
    pub in_recovery: bool,
}

impl NodeMetrics {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_traffic: 0,
            latency_ms: 0,
            last_checked: None,
            fault_count: 0,
            is_healthy: true,
            is_faulty: false,
            in_recovery: false,
        }
    }

    fn apply(&mut self, sample: &ProbeSample) {
        self.cpu_usage = sample.cpu_pct;
        self.memory_usage = sample.memory_pct;
        self.disk_usage = sample.disk_pct;
        self.network_traffic = sample.network_bytes;
        self.latency_ms = sample.latency_ms;
    }
}

/// Classified health sample
#[derive(Debug, Clone)]
pub enum SampleOutcome {
    Healthy(ProbeSample),
    /// Ceiling exceeded (sample present) or probe failed (no sample)
    Faulty(Option<ProbeSample>),
}

/// Transition caused by recording a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTransition {
    /// Node healthy; fault count is zero
    Healthy,
    /// Fault counted, threshold not reached
    FaultCounted(u32),
    /// Threshold crossed; the caller now owns the recovery (`in_recovery` set)
    Escalated,
    /// Node already faulty and a recovery is running
    RecoveryPending,
    /// Node is not registered
    Unknown,
}

/// Store of [`NodeMetrics`] behind one exclusive lock
#[derive(Debug, Clone, Default)]
pub struct MetricsStore {
    inner: Arc<Mutex<HashMap<String, NodeMetrics>>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; existing metrics are kept
    pub fn register(&self, node_id: &str) {
        self.inner
            .lock()
            .entry(node_id.to_string())
            .or_insert_with(|| NodeMetrics::new(node_id));
    }

    pub fn get(&self, node_id: &str) -> Option<NodeMetrics> {
        self.inner.lock().get(node_id).cloned()
    }

    /// Consistent copy of every node's metrics
    pub fn snapshot(&self) -> Vec<NodeMetrics> {
        let mut all: Vec<_> = self.inner.lock().values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn faulty_count(&self) -> usize {
        self.inner.lock().values().filter(|m| m.is_faulty).count()
    }

    /// Record one sample and apply the fault-threshold rule
    pub fn record_sample(&self, node_id: &str, outcome: &SampleOutcome, threshold: u32) -> SampleTransition {
        let mut nodes = self.inner.lock();
        let Some(metrics) = nodes.get_mut(node_id) else {
            return SampleTransition::Unknown;
        };
        metrics.last_checked = Some(Utc::now());

        match outcome {
            SampleOutcome::Healthy(sample) => {
                metrics.apply(sample);
                metrics.fault_count = 0;
                if !metrics.in_recovery {
                    metrics.is_faulty = false;
                    metrics.is_healthy = true;
                }
                SampleTransition::Healthy
            }
            SampleOutcome::Faulty(sample) => {
                if let Some(sample) = sample {
                    metrics.apply(sample);
                }
                metrics.fault_count = metrics.fault_count.saturating_add(1);
                if metrics.in_recovery {
                    SampleTransition::RecoveryPending
                } else if metrics.fault_count >= threshold {
                    metrics.is_faulty = true;
                    metrics.is_healthy = false;
                    metrics.in_recovery = true;
                    SampleTransition::Escalated
                } else {
                    SampleTransition::FaultCounted(metrics.fault_count)
                }
            }
        }
    }

    /// Claim a recovery; false if one is already running or the node is unknown
    pub fn begin_recovery(&self, node_id: &str) -> bool {
        match self.inner.lock().get_mut(node_id) {
            Some(metrics) if !metrics.in_recovery => {
                metrics.in_recovery = true;
                true
            }
            _ => false,
        }
    }

    /// Close a recovery. Success resets the node to healthy; failure leaves
    /// it faulty so the next faulty sample escalates again.
    pub fn finish_recovery(&self, node_id: &str, success: bool) {
        if let Some(metrics) = self.inner.lock().get_mut(node_id) {
            if success {
                metrics.fault_count = 0;
                metrics.is_faulty = false;
                metrics.is_healthy = true;
            }
            metrics.in_recovery = false;
        }
    }
}
