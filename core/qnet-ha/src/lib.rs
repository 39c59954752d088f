//! QNet High-Availability Module
//!
//! Fault detection, replication, fork resolution and disaster recovery
//! for clusters of ledger-carrying QNet nodes.

pub mod backup;
pub mod config;
pub mod errors;
pub mod failover;
pub mod fork;
pub mod metrics;
pub mod monitoring;
pub mod recovery;
pub mod replication;
pub mod tls;
pub mod traits;
pub mod types;

// Re-export main types for public API
pub use backup::{BackupRecord, DataBackupManager};
pub use config::{
    BackupConfig, FailoverConfig, ForkConfig, HaConfig, HeartbeatConfig, MonitoringConfig, ReplicationConfig,
    TlsConfig,
};
pub use errors::{HaError, HaResult, ProbeError, TransferError};
pub use failover::{FailoverState, FailoverStatus, NodeFailoverManager};
pub use fork::{
    validate_branch, ChainForkManager, ForkBranch, ForkChoiceRule, ForkDetection, ForkEvent, ForkEventType,
    ForkMetrics, ForkResolution,
};
pub use monitoring::{
    EventSink, HeartbeatService, MetricsStore, MonitorEvent, NodeMetrics, NodeMonitoringService, RecoveryOutcome,
    RecoveryRecord, Supervisor,
};
pub use recovery::{DisasterRecoveryManager, RecoveryEvent, RecoveryLogEntry, RecoveryReport, StepOutcome};
pub use replication::{
    DataReplicationManager, DataUnit, DataUnitId, HttpsTransport, LoopbackTransport, PayloadCipher, PlainPayload,
    RedundancyManager, ReplicationState, ReplicationTransport, RsaOaepCipher,
};
pub use traits::{HealthProbe, HealthView, HeartbeatTransport, NodeRecoveryHandler, NoopRecovery, ProbeSample};
pub use types::{Alert, AlertBus, AlertSeverity, NodeRecord, NodeRegistry, NodeRole};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AlertBus, ChainForkManager, DataBackupManager, DataReplicationManager, DisasterRecoveryManager, HaConfig,
        HaError, HaResult, HeartbeatService, NodeFailoverManager, NodeMonitoringService, Supervisor,
    };
}
