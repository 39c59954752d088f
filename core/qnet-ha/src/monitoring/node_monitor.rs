//! Deep node health monitoring with fault-threshold escalation

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qnet_ledger::LedgerAudit;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::store::{MetricsStore, NodeMetrics, SampleOutcome, SampleTransition};
use super::{EventSink, MonitorEvent, Supervisor};
use crate::config::MonitoringConfig;
use crate::errors::HaResult;
use crate::metrics;
use crate::traits::{HealthProbe, HealthView, NodeRecoveryHandler};
use crate::types::{AlertBus, AlertSeverity};

/// Completed recoveries kept for inspection, oldest dropped first
const RECOVERY_RECORD_CAPACITY: usize = 1000;

/// Result of a recovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    Recovered,
    Failed,
    /// Another recovery for the node is running
    AlreadyInProgress,
}

/// One completed recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RecoveryOutcome,
    pub detail: Option<String>,
}

/// Periodic deep health checks, one loop per node
pub struct NodeMonitoringService {
    config: MonitoringConfig,
    store: MetricsStore,
    probe: Arc<dyn HealthProbe>,
    recovery: Arc<dyn NodeRecoveryHandler>,
    audit: Arc<dyn LedgerAudit>,
    alerts: AlertBus,
    events: EventSink,
    records: Mutex<VecDeque<RecoveryRecord>>,
}

impl NodeMonitoringService {
    pub fn new(
        config: MonitoringConfig,
        probe: Arc<dyn HealthProbe>,
        recovery: Arc<dyn NodeRecoveryHandler>,
        audit: Arc<dyn LedgerAudit>,
        alerts: AlertBus,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            store: MetricsStore::new(),
            probe,
            recovery,
            audit,
            alerts,
            events,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a node for monitoring
    pub fn add_node(&self, node_id: &str) {
        self.store.register(node_id);
    }

    /// Shared metrics store
    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Launch one monitoring loop per registered node
    pub fn start_monitoring(self: &Arc<Self>, supervisor: &Supervisor) {
        let nodes: Vec<String> = self.store.snapshot().into_iter().map(|m| m.node_id).collect();
        info!(
            "Starting node monitoring for {} nodes (every {:?}, threshold {})",
            nodes.len(),
            self.config.check_interval(),
            self.config.fault_threshold
        );
        for node_id in nodes {
            self.spawn_loop(supervisor, node_id);
        }
    }

    /// Register a node and start its loop immediately
    pub fn monitor_node(self: &Arc<Self>, supervisor: &Supervisor, node_id: &str) {
        self.add_node(node_id);
        self.spawn_loop(supervisor, node_id.to_string());
    }

    fn spawn_loop(self: &Arc<Self>, supervisor: &Supervisor, node_id: String) {
        let service = self.clone();
        supervisor.spawn(format!("health-monitor-{}", node_id), move || {
            let service = service.clone();
            let node_id = node_id.clone();
            async move {
                let mut ticker = tokio::time::interval(service.config.check_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    service.sample_node(&node_id).await;
                }
            }
        });
    }

    /// Probe a node once, update its metrics and escalate if needed
    pub async fn sample_node(&self, node_id: &str) -> SampleTransition {
        let outcome = match self.probe.probe(node_id).await {
            Ok(sample) => {
                let over_latency = sample.latency_ms > self.config.max_latency_ms;
                let over_cpu = sample.cpu_pct > self.config.max_cpu_pct;
                if over_latency || over_cpu {
                    debug!(
                        "Node {} over ceiling: latency {} ms, cpu {:.1}%",
                        node_id, sample.latency_ms, sample.cpu_pct
                    );
                    SampleOutcome::Faulty(Some(sample))
                } else {
                    SampleOutcome::Healthy(sample)
                }
            }
            Err(e) => {
                warn!("Health probe of {} failed: {}", node_id, e);
                SampleOutcome::Faulty(None)
            }
        };

        let transition = self.store.record_sample(node_id, &outcome, self.config.fault_threshold);
        let healthy = matches!(outcome, SampleOutcome::Healthy(_));
        metrics::record_health_sample(healthy);

        if let SampleOutcome::Healthy(sample) | SampleOutcome::Faulty(Some(sample)) = &outcome {
            if let Err(e) = self
                .audit
                .log_node_metrics(node_id, sample.cpu_pct, sample.memory_pct, sample.latency_ms)
            {
                warn!("Failed to audit metrics for {}: {}", node_id, e);
            }
        }

        let fault_count = self.store.get(node_id).map(|m| m.fault_count).unwrap_or(0);
        self.events.emit(MonitorEvent::Sample {
            node_id: node_id.to_string(),
            healthy,
            fault_count,
        });

        if transition == SampleTransition::Escalated {
            metrics::set_faulty_nodes(self.store.faulty_count());
            self.alerts.raise(
                AlertSeverity::Critical,
                Some(node_id),
                format!("node faulty after {} consecutive faulty samples", fault_count),
            );
            self.events.emit(MonitorEvent::Escalated { node_id: node_id.to_string() });
            self.run_recovery(node_id).await;
        }
        transition
    }

    /// Recover a node unless a recovery for it is already running
    pub async fn trigger_recovery(&self, node_id: &str) -> RecoveryOutcome {
        if !self.store.begin_recovery(node_id) {
            debug!("Recovery for {} already in progress or node unknown", node_id);
            return RecoveryOutcome::AlreadyInProgress;
        }
        self.run_recovery(node_id).await
    }

    /// Body of a recovery; `in_recovery` must already be set
    async fn run_recovery(&self, node_id: &str) -> RecoveryOutcome {
        let started_at = Utc::now();
        info!("Recovering node {}", node_id);

        let result: HaResult<()> = self.recovery.recover_node(node_id).await;
        let success = result.is_ok();
        self.store.finish_recovery(node_id, success);
        metrics::record_node_recovery(success);
        metrics::set_faulty_nodes(self.store.faulty_count());

        let finished_at = Utc::now();
        let (outcome, detail) = match result {
            Ok(()) => {
                info!("Node {} recovered", node_id);
                if let Err(e) = self.audit.log_node_recovery(node_id, finished_at) {
                    warn!("Failed to audit recovery of {}: {}", node_id, e);
                }
                (RecoveryOutcome::Recovered, None)
            }
            Err(e) => {
                error!("Recovery of {} failed: {}", node_id, e);
                (RecoveryOutcome::Failed, Some(e.to_string()))
            }
        };

        {
            let mut records = self.records.lock();
            if records.len() >= RECOVERY_RECORD_CAPACITY {
                records.pop_front();
            }
            records.push_back(RecoveryRecord {
                node_id: node_id.to_string(),
                started_at,
                finished_at,
                outcome,
                detail,
            });
        }
        self.events.emit(MonitorEvent::Recovered {
            node_id: node_id.to_string(),
            success,
        });
        outcome
    }

    pub fn get_node_status(&self, node_id: &str) -> Option<NodeMetrics> {
        self.store.get(node_id)
    }

    pub fn all_node_status(&self) -> Vec<NodeMetrics> {
        self.store.snapshot()
    }

    /// Completed recoveries, oldest first
    pub fn recovery_records(&self) -> Vec<RecoveryRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

impl HealthView for NodeMonitoringService {
    fn is_healthy(&self, node_id: &str) -> bool {
        self.store
            .get(node_id)
            .map(|m| m.is_healthy && !m.is_faulty)
            .unwrap_or(false)
    }
}
