//! Configuration for the high-availability layer

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{HaError, HaResult};
use crate::fork::ForkChoiceRule;

/// Fixed transfer chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Read a numeric override from the environment
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Top-level HA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Identifier of the local node
    pub node_id: String,

    /// Heartbeat liveness probing
    pub heartbeat: HeartbeatConfig,

    /// Deep health monitoring
    pub monitoring: MonitoringConfig,

    /// Primary/backup failover
    pub failover: FailoverConfig,

    /// Data replication
    pub replication: ReplicationConfig,

    /// Fork handling
    pub fork: ForkConfig,

    /// Ledger backups
    pub backup: BackupConfig,

    /// Mutual TLS material for replication and probes
    pub tls: TlsConfig,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            node_id: std::env::var("QNET_HA_NODE_ID").unwrap_or_else(|_| "node-0".to_string()),
            heartbeat: HeartbeatConfig::default(),
            monitoring: MonitoringConfig::default(),
            failover: FailoverConfig::default(),
            replication: ReplicationConfig::default(),
            fork: ForkConfig::default(),
            backup: BackupConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl HaConfig {
    /// Reject settings that would disable a safety property
    pub fn validate(&self) -> HaResult<()> {
        if self.node_id.is_empty() {
            return Err(HaError::Config("node_id must not be empty".into()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(HaError::Config("heartbeat.interval_ms must be positive".into()));
        }
        if self.monitoring.check_interval_ms == 0 {
            return Err(HaError::Config("monitoring.check_interval_ms must be positive".into()));
        }
        if self.monitoring.fault_threshold == 0 {
            return Err(HaError::Config("monitoring.fault_threshold must be at least 1".into()));
        }
        if self.replication.replication_factor == 0 {
            return Err(HaError::Config("replication.replication_factor must be at least 1".into()));
        }
        if self.replication.chunk_size == 0 {
            return Err(HaError::Config("replication.chunk_size must be positive".into()));
        }
        if self.replication.max_attempts == 0 {
            return Err(HaError::Config("replication.max_attempts must be at least 1".into()));
        }
        if self.backup.interval_secs == 0 {
            return Err(HaError::Config("backup.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Send/check interval in milliseconds; a node is unresponsive after 2x
    pub interval_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: env_or("QNET_HA_HEARTBEAT_MS", 1_000),
        }
    }
}

/// Node monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Interval between deep health checks (ms)
    pub check_interval_ms: u64,

    /// Faulty samples needed before a node is declared faulty
    pub fault_threshold: u32,

    /// Latency ceiling (ms)
    pub max_latency_ms: u64,

    /// CPU ceiling (percent)
    pub max_cpu_pct: f64,

    /// Restarts allowed per supervised loop before it is abandoned
    pub max_task_restarts: u32,
}

impl MonitoringConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: env_or("QNET_HA_CHECK_INTERVAL_MS", 5_000),
            fault_threshold: env_or("QNET_HA_FAULT_THRESHOLD", 3),
            max_latency_ms: env_or("QNET_HA_MAX_LATENCY_MS", 500),
            max_cpu_pct: env_or("QNET_HA_MAX_CPU_PCT", 90.0),
            max_task_restarts: 10,
        }
    }
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Primary node at startup
    pub primary: Option<String>,

    /// Ordered backup candidates
    pub backups: Vec<String>,

    /// How often the primary's health is re-evaluated (ms)
    pub check_interval_ms: u64,
}

impl FailoverConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary: None,
            backups: Vec::new(),
            check_interval_ms: env_or("QNET_HA_FAILOVER_CHECK_MS", 2_000),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Nodes (source included) that must hold each data unit
    pub replication_factor: usize,

    /// Transfer chunk size in bytes
    pub chunk_size: usize,

    /// Per-attempt transfer timeout (ms)
    pub transfer_timeout_ms: u64,

    /// Attempts per target before giving up
    pub max_attempts: u32,

    /// Interval of the redundancy audit loop (ms)
    pub audit_interval_ms: u64,
}

impl ReplicationConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.audit_interval_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: env_or("QNET_HA_REPLICATION_FACTOR", 3),
            chunk_size: DEFAULT_CHUNK_SIZE,
            transfer_timeout_ms: env_or("QNET_HA_TRANSFER_TIMEOUT_MS", 30_000),
            max_attempts: 3,
            audit_interval_ms: 60_000,
        }
    }
}

/// Fork handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Fork-choice rule
    pub rule: ForkChoiceRule,

    /// Fork events kept in history
    pub history_capacity: usize,

    /// Branches buffered at once; the oldest is evicted beyond this
    pub max_branches: usize,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            rule: ForkChoiceRule::LongestChain,
            history_capacity: 1000,
            max_branches: 64,
        }
    }
}

/// Backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory holding snapshot files and the manifest
    pub directory: PathBuf,

    /// Auto-backup interval (seconds)
    pub interval_secs: u64,

    /// Retention window (seconds)
    pub retention_secs: u64,

    /// LZ4-compress snapshots
    pub compress: bool,

    /// Per-operation disk I/O timeout (ms)
    pub io_timeout_ms: u64,
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: std::env::var("QNET_HA_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("backups")),
            interval_secs: env_or("QNET_HA_BACKUP_INTERVAL_SECS", 3_600),
            retention_secs: env_or("QNET_HA_BACKUP_RETENTION_SECS", 7 * 24 * 3_600),
            compress: true,
            io_timeout_ms: 30_000,
        }
    }
}

/// TLS material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Trusted CA bundle (PEM)
    pub ca_bundle: Option<PathBuf>,

    /// Client certificate (PEM)
    pub client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    pub client_key: Option<PathBuf>,
}
