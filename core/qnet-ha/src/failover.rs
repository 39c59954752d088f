//! Primary/backup failover
//!
//! Health decisions come from the monitoring service through [`HealthView`];
//! this module never probes nodes itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::FailoverConfig;
use crate::errors::{HaError, HaResult};
use crate::metrics;
use crate::monitoring::Supervisor;
use crate::traits::{HealthView, NodeRecoveryHandler};
use crate::types::{AlertBus, AlertSeverity, NodeRegistry, NodeRole};

/// Failover state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverState {
    /// Serving from the named primary
    Active(String),
    /// Backups are being evaluated
    FailingOver,
    /// No healthy backup was found; operator action required
    Degraded,
}

/// Snapshot returned by [`NodeFailoverManager::status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverStatus {
    pub state: FailoverState,
    pub current_primary: Option<String>,
    pub backups: Vec<String>,
    /// Last health verdict per node seen during failover
    pub health_status: HashMap<String, bool>,
    pub failovers: u64,
    pub last_failover: Option<DateTime<Utc>>,
}

struct FailoverInner {
    state: FailoverState,
    current_primary: Option<String>,
    backups: Vec<String>,
    health_status: HashMap<String, bool>,
    failovers: u64,
    last_failover: Option<DateTime<Utc>>,
}

/// Promotes the first healthy backup when the primary fails
pub struct NodeFailoverManager {
    config: FailoverConfig,
    inner: Mutex<FailoverInner>,
    health: Arc<dyn HealthView>,
    alerts: AlertBus,
    registry: Option<NodeRegistry>,
    resync: Option<Arc<dyn NodeRecoveryHandler>>,
}

impl NodeFailoverManager {
    pub fn new(config: FailoverConfig, health: Arc<dyn HealthView>, alerts: AlertBus) -> Self {
        let state = match &config.primary {
            Some(primary) => FailoverState::Active(primary.clone()),
            None => FailoverState::Degraded,
        };
        let inner = FailoverInner {
            state,
            current_primary: config.primary.clone(),
            backups: config.backups.clone(),
            health_status: HashMap::new(),
            failovers: 0,
            last_failover: None,
        };
        Self {
            config,
            inner: Mutex::new(inner),
            health,
            alerts,
            registry: None,
            resync: None,
        }
    }

    /// Keep node roles in `registry` in step with promotions
    pub fn with_registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Re-synchronise a newly promoted primary through `handler`
    pub fn with_resync(mut self, handler: Arc<dyn NodeRecoveryHandler>) -> Self {
        self.resync = Some(handler);
        self
    }

    /// Append a backup candidate; used from the next failover on
    pub fn add_backup_node(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        if inner.current_primary.as_deref() == Some(node_id) || inner.backups.iter().any(|b| b == node_id) {
            return;
        }
        inner.backups.push(node_id.to_string());
        info!("Added backup node {}", node_id);
    }

    /// Drop a node from the backup list. Removing the current primary leaves
    /// the cluster without one until the next failover.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.backups.len();
        inner.backups.retain(|b| b != node_id);
        let mut removed = inner.backups.len() != before;

        if inner.current_primary.as_deref() == Some(node_id) {
            warn!("Removed current primary {}", node_id);
            inner.current_primary = None;
            inner.state = FailoverState::Degraded;
            removed = true;
        }
        inner.health_status.remove(node_id);
        removed
    }

    pub fn current_primary(&self) -> Option<String> {
        self.inner.lock().current_primary.clone()
    }

    /// Fail over if the primary is unhealthy or missing.
    /// Returns the new primary when a switch happened.
    pub async fn check_primary(&self) -> HaResult<Option<String>> {
        let primary = {
            let inner = self.inner.lock();
            if inner.state == FailoverState::Degraded && inner.current_primary.is_some() {
                debug!("Cluster degraded; skipping automatic failover");
                return Ok(None);
            }
            inner.current_primary.clone()
        };

        match primary {
            Some(primary) if self.health.is_healthy(&primary) => Ok(None),
            Some(primary) => {
                warn!("Primary {} is unhealthy, failing over", primary);
                self.failover().await.map(Some)
            }
            None => {
                if self.inner.lock().backups.is_empty() {
                    return Err(HaError::NoPrimary);
                }
                self.failover().await.map(Some)
            }
        }
    }

    /// Promote the first healthy backup in list order
    pub async fn failover(&self) -> HaResult<String> {
        let promoted = {
            let mut inner = self.inner.lock();
            inner.state = FailoverState::FailingOver;

            let mut chosen = None;
            for (idx, candidate) in inner.backups.clone().into_iter().enumerate() {
                let healthy = self.health.is_healthy(&candidate);
                inner.health_status.insert(candidate.clone(), healthy);
                if healthy {
                    chosen = Some((idx, candidate));
                    break;
                }
                debug!("Backup {} unhealthy, skipping", candidate);
            }

            match chosen {
                Some((idx, new_primary)) => {
                    inner.backups.remove(idx);
                    let old_primary = inner.current_primary.replace(new_primary.clone());
                    if let Some(old) = &old_primary {
                        inner.health_status.insert(old.clone(), false);
                        inner.backups.push(old.clone());
                    }
                    inner.state = FailoverState::Active(new_primary.clone());
                    inner.failovers += 1;
                    inner.last_failover = Some(Utc::now());
                    Some((old_primary, new_primary))
                }
                None => {
                    inner.state = FailoverState::Degraded;
                    None
                }
            }
        };

        let Some((old_primary, new_primary)) = promoted else {
            metrics::record_failover(false);
            error!("Failover failed: no healthy backup node");
            self.alerts.raise(
                AlertSeverity::Critical,
                self.current_primary().as_deref(),
                "no healthy backup node; cluster degraded, operator action required",
            );
            return Err(HaError::NoHealthyBackup);
        };

        metrics::record_failover(true);
        info!(
            "Failover complete: {} -> {}",
            old_primary.as_deref().unwrap_or("<none>"),
            new_primary
        );
        self.alerts.raise(
            AlertSeverity::Warning,
            Some(&new_primary),
            format!("promoted to primary (was {})", old_primary.as_deref().unwrap_or("<none>")),
        );

        if let Some(registry) = &self.registry {
            registry.set_role(&new_primary, NodeRole::Primary);
            if let Some(old) = &old_primary {
                registry.set_role(old, NodeRole::Backup);
            }
        }
        if let Some(resync) = &self.resync {
            if let Err(e) = resync.recover_node(&new_primary).await {
                warn!("Re-sync of new primary {} failed: {}", new_primary, e);
            }
        }
        Ok(new_primary)
    }

    /// Periodically re-evaluate the primary
    pub fn start_monitoring(self: &Arc<Self>, supervisor: &Supervisor) {
        let manager = self.clone();
        info!("Starting failover monitor (every {:?})", self.config.check_interval());
        supervisor.spawn("failover-monitor", move || {
            let manager = manager.clone();
            async move {
                let mut ticker = tokio::time::interval(manager.config.check_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = manager.check_primary().await {
                        warn!("Primary check failed: {}", e);
                    }
                }
            }
        });
    }

    pub fn status(&self) -> FailoverStatus {
        let inner = self.inner.lock();
        FailoverStatus {
            state: inner.state.clone(),
            current_primary: inner.current_primary.clone(),
            backups: inner.backups.clone(),
            health_status: inner.health_status.clone(),
            failovers: inner.failovers,
            last_failover: inner.last_failover,
        }
    }
}
