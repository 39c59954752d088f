//! Node health monitoring: heartbeats, deep health checks and the loop supervisor

pub mod heartbeat;
pub mod http;
pub mod node_monitor;
pub mod store;
pub mod supervisor;

use std::time::Duration;

use tokio::sync::mpsc;

pub use heartbeat::HeartbeatService;
pub use http::{HttpHealthProbe, HttpHeartbeat};
pub use node_monitor::{NodeMonitoringService, RecoveryOutcome, RecoveryRecord};
pub use store::{MetricsStore, NodeMetrics, SampleOutcome, SampleTransition};
pub use supervisor::Supervisor;

/// Result reported by a monitoring loop
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Health sample recorded
    Sample { node_id: String, healthy: bool, fault_count: u32 },
    /// Fault threshold crossed
    Escalated { node_id: String },
    /// Recovery finished
    Recovered { node_id: String, success: bool },
    /// Heartbeat silence exceeded twice the interval
    Unresponsive { node_id: String, silent_for: Duration },
    /// Heartbeats resumed after an unresponsive period
    Responsive { node_id: String },
    /// Supervised task panicked and was restarted
    TaskRestarted { task: String, restarts: u32 },
    /// Supervised task exceeded its restart budget
    TaskAbandoned { task: String },
}

/// Shared sink for [`MonitorEvent`]s. Emitting never blocks or fails.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<MonitorEvent>>,
}

impl EventSink {
    /// Sink plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: MonitorEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
