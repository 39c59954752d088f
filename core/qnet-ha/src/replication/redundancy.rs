//! Cluster membership and redundancy auditing

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::manager::DataReplicationManager;
use crate::errors::{HaError, HaResult};
use crate::monitoring::Supervisor;
use crate::traits::HealthView;
use crate::types::{NodeRecord, NodeRegistry, NodeRole};

/// Result of one redundancy audit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyReport {
    /// Units found below the replication factor
    pub under_replicated: usize,
    /// Units brought back to the factor
    pub repaired: usize,
    /// Units still below the factor
    pub still_under: usize,
}

/// Keeps every unit on `replication_factor` registered nodes
pub struct RedundancyManager {
    registry: NodeRegistry,
    replication: Arc<DataReplicationManager>,
    health: Option<Arc<dyn HealthView>>,
    audit_interval: std::time::Duration,
}

impl RedundancyManager {
    pub fn new(
        registry: NodeRegistry,
        replication: Arc<DataReplicationManager>,
        audit_interval: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            replication,
            health: None,
            audit_interval,
        }
    }

    /// Skip unhealthy nodes when choosing repair targets
    pub fn with_health(mut self, health: Arc<dyn HealthView>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn register_node(&self, record: NodeRecord) {
        info!("Registered node {} ({:?}) at {}", record.node_id, record.role, record.address);
        self.registry.upsert(record);
    }

    /// Registered nodes in registration order
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.registry.all()
    }

    pub fn promote(&self, node_id: &str, role: NodeRole) -> HaResult<()> {
        if self.registry.set_role(node_id, role) {
            info!("Node {} is now {:?}", node_id, role);
            Ok(())
        } else {
            Err(HaError::NodeNotFound(node_id.to_string()))
        }
    }

    /// Candidate targets in registration order: healthy, not local
    fn candidates(&self) -> Vec<String> {
        let local = self.replication.local_node();
        self.registry
            .all()
            .into_iter()
            .map(|n| n.node_id)
            .filter(|id| id != local)
            .filter(|id| self.health.as_ref().map(|h| h.is_healthy(id)).unwrap_or(true))
            .collect()
    }

    /// Re-replicate every unit below the factor to nodes lacking it
    pub async fn audit_redundancy(&self) -> RedundancyReport {
        let under = self.replication.under_replicated();
        let mut report = RedundancyReport {
            under_replicated: under.len(),
            ..RedundancyReport::default()
        };
        if under.is_empty() {
            debug!("Redundancy audit: all units at replication factor");
            return report;
        }

        let candidates = self.candidates();
        for id in under {
            let holders = self.replication.holders(&id);
            let targets: Vec<String> = candidates
                .iter()
                .filter(|c| !holders.contains(c))
                .cloned()
                .collect();
            match self.replication.replicate_known(&id, &targets).await {
                Ok(_) => report.repaired += 1,
                Err(e) => {
                    warn!("Redundancy repair of {} incomplete: {}", id, e);
                    report.still_under += 1;
                }
            }
        }
        info!(
            "Redundancy audit: {} under-replicated, {} repaired, {} still under",
            report.under_replicated, report.repaired, report.still_under
        );
        report
    }

    /// Run [`audit_redundancy`](Self::audit_redundancy) periodically
    pub fn start_auditing(self: &Arc<Self>, supervisor: &Supervisor) {
        let manager = self.clone();
        supervisor.spawn("redundancy-audit", move || {
            let manager = manager.clone();
            async move {
                let mut ticker = tokio::time::interval(manager.audit_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    manager.audit_redundancy().await;
                }
            }
        });
    }
}
