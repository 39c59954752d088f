//! Ledger audit sinks
//!
//! Audit writes are fire-and-forget for callers: an `Err` is reported by the
//! caller and never aborts the operation being described.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

use crate::errors::{LedgerError, LedgerResult};

/// Audit sink exposed by the ledger layer
pub trait LedgerAudit: Send + Sync {
    /// Record a node metrics sample
    fn log_node_metrics(&self, node_id: &str, cpu: f64, memory: f64, latency_ms: u64) -> LedgerResult<()>;

    /// Record completion of a node recovery
    fn log_node_recovery(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()>;

    /// Record a successful replication to a node
    fn log_replication(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()>;

    /// Record restoration of a node's data
    fn log_data_recovery(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()>;
}

/// Audit sink that writes through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl LedgerAudit for TracingAudit {
    fn log_node_metrics(&self, node_id: &str, cpu: f64, memory: f64, latency_ms: u64) -> LedgerResult<()> {
        info!(target: "qnet_ledger::audit", node_id, cpu, memory, latency_ms, "node metrics");
        Ok(())
    }

    fn log_node_recovery(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        info!(target: "qnet_ledger::audit", node_id, at = %at, "node recovery");
        Ok(())
    }

    fn log_replication(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        info!(target: "qnet_ledger::audit", node_id, at = %at, "replication");
        Ok(())
    }

    fn log_data_recovery(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        info!(target: "qnet_ledger::audit", node_id, at = %at, "data recovery");
        Ok(())
    }
}

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    NodeMetrics,
    NodeRecovery,
    Replication,
    DataRecovery,
}

/// Entry captured by [`InMemoryAudit`]
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub node_id: String,
    pub at: DateTime<Utc>,
}

/// Audit sink that keeps entries in memory; can be switched to reject writes
#[derive(Debug, Default)]
pub struct InMemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
    failing: Mutex<bool>,
}

impl InMemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Entries recorded so far
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries of one kind for a node
    pub fn count(&self, kind: AuditKind, node_id: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind && e.node_id == node_id)
            .count()
    }

    fn push(&self, kind: AuditKind, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        if *self.failing.lock() {
            return Err(LedgerError::Audit(format!("audit sink unavailable for {}", node_id)));
        }
        self.entries.lock().push(AuditEntry {
            kind,
            node_id: node_id.to_string(),
            at,
        });
        Ok(())
    }
}

impl LedgerAudit for InMemoryAudit {
    fn log_node_metrics(&self, node_id: &str, _cpu: f64, _memory: f64, _latency_ms: u64) -> LedgerResult<()> {
        self.push(AuditKind::NodeMetrics, node_id, Utc::now())
    }

    fn log_node_recovery(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        self.push(AuditKind::NodeRecovery, node_id, at)
    }

    fn log_replication(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        self.push(AuditKind::Replication, node_id, at)
    }

    fn log_data_recovery(&self, node_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        self.push(AuditKind::DataRecovery, node_id, at)
    }
}
