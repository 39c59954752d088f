//! Disaster recovery orchestration
//!
//! Recovery runs failover, ledger restore and data re-replication in that
//! order. A failing step is logged and the next step still runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::backup::DataBackupManager;
use crate::errors::HaResult;
use crate::failover::NodeFailoverManager;
use crate::replication::DataReplicationManager;
use crate::traits::HealthView;
use crate::types::{AlertBus, AlertSeverity};

/// Outcome of a single recovery step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    Skipped,
}

impl StepOutcome {
    fn from_result<T>(result: &HaResult<T>) -> Self {
        match result {
            Ok(_) => StepOutcome::Succeeded,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryEvent {
    Failover,
    LedgerRestore,
    DataRecovery,
    RecoveryCompleted,
}

/// Append-only recovery audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: RecoveryEvent,
    pub node_id: String,
    pub backup_id: Option<String>,
    pub outcome: StepOutcome,
}

/// Per-step result of [`DisasterRecoveryManager::recover_from_failure`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub node_id: String,
    pub failover: StepOutcome,
    pub new_primary: Option<String>,
    pub restore: StepOutcome,
    pub backup_id: Option<String>,
    pub data_recovery: StepOutcome,
}

impl RecoveryReport {
    /// No step failed
    pub fn is_complete(&self) -> bool {
        !(self.failover.is_failure() || self.restore.is_failure() || self.data_recovery.is_failure())
    }
}

/// Composes failover, backup restore and replication recovery
pub struct DisasterRecoveryManager {
    local_node: String,
    failover: Arc<NodeFailoverManager>,
    replication: Arc<DataReplicationManager>,
    backups: Arc<DataBackupManager>,
    health: Arc<dyn HealthView>,
    alerts: AlertBus,
    log: Mutex<Vec<RecoveryLogEntry>>,
}

impl DisasterRecoveryManager {
    pub fn new(
        local_node: impl Into<String>,
        failover: Arc<NodeFailoverManager>,
        replication: Arc<DataReplicationManager>,
        backups: Arc<DataBackupManager>,
        health: Arc<dyn HealthView>,
        alerts: AlertBus,
    ) -> Self {
        Self {
            local_node: local_node.into(),
            failover,
            replication,
            backups,
            health,
            alerts,
            log: Mutex::new(Vec::new()),
        }
    }

    fn append(&self, event: RecoveryEvent, node_id: &str, backup_id: Option<String>, outcome: StepOutcome) {
        self.log.lock().push(RecoveryLogEntry {
            timestamp: Utc::now(),
            event,
            node_id: node_id.to_string(),
            backup_id,
            outcome,
        });
    }

    /// Best-effort recovery of `failed_node`. Never aborts early; the report
    /// tells which steps failed.
    pub async fn recover_from_failure(&self, failed_node: &str) -> RecoveryReport {
        warn!("Starting disaster recovery for {}", failed_node);
        self.alerts.raise(
            AlertSeverity::Critical,
            Some(failed_node),
            "node failure; disaster recovery started",
        );

        // 1. Move the primary role away from the failed node
        let (failover, new_primary) = if self.failover.current_primary().as_deref() == Some(failed_node) {
            let result = self.failover.failover().await;
            if let Err(e) = &result {
                error!("Failover away from {} failed: {}", failed_node, e);
            }
            let outcome = StepOutcome::from_result(&result);
            (outcome, result.ok())
        } else {
            (StepOutcome::Skipped, None)
        };
        self.append(RecoveryEvent::Failover, failed_node, None, failover.clone());

        // 2. Restore the ledger from the newest backup of the failed node,
        //    falling back to the local node's backups
        let latest = match self.backups.retrieve_latest_backup(failed_node).await {
            Ok(record) => Ok(record),
            Err(_) => self.backups.retrieve_latest_backup(&self.local_node).await,
        };
        let (restore, backup_id) = match latest {
            Ok(record) => {
                let result = self.backups.restore_ledger(&record.backup_id).await;
                if let Err(e) = &result {
                    error!("Ledger restore from {} failed: {}", record.backup_id, e);
                }
                (StepOutcome::from_result(&result), Some(record.backup_id))
            }
            Err(e) => {
                error!("No backup available to restore {}: {}", failed_node, e);
                (StepOutcome::Failed(e.to_string()), None)
            }
        };
        self.append(RecoveryEvent::LedgerRestore, failed_node, backup_id.clone(), restore.clone());

        // 3. Re-populate the node's replicated data
        let result = self.replication.recover_node_data(failed_node).await;
        if let Err(e) = &result {
            error!("Data recovery for {} failed: {}", failed_node, e);
        }
        let data_recovery = StepOutcome::from_result(&result);
        self.append(RecoveryEvent::DataRecovery, failed_node, None, data_recovery.clone());

        let report = RecoveryReport {
            node_id: failed_node.to_string(),
            failover,
            new_primary,
            restore,
            backup_id: backup_id.clone(),
            data_recovery,
        };
        let overall = if report.is_complete() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed("one or more recovery steps failed".into())
        };
        self.append(RecoveryEvent::RecoveryCompleted, failed_node, backup_id, overall);

        if report.is_complete() {
            info!("Disaster recovery for {} complete", failed_node);
            self.alerts.raise(AlertSeverity::Info, Some(failed_node), "disaster recovery complete");
        } else {
            self.alerts.raise(
                AlertSeverity::Critical,
                Some(failed_node),
                "disaster recovery partially failed; operator action required",
            );
        }
        report
    }

    /// True when there is at least one backup node and all backups are healthy
    pub fn check_system_health(&self) -> bool {
        let backups = self.failover.status().backups;
        if backups.is_empty() {
            warn!("System health: no backup nodes configured");
            return false;
        }
        let unhealthy: Vec<&String> = backups.iter().filter(|b| !self.health.is_healthy(b)).collect();
        if unhealthy.is_empty() {
            true
        } else {
            warn!("System health: unhealthy backups {:?}", unhealthy);
            false
        }
    }

    /// Recovery log, oldest first
    pub fn recovery_log(&self) -> Vec<RecoveryLogEntry> {
        self.log.lock().clone()
    }
}
