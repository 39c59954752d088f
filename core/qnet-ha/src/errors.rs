//! Error types for the high-availability layer

use thiserror::Error;

/// Failure of a single transfer attempt to one target
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Target unreachable or connection dropped
    #[error("Transport error: {0}")]
    Transport(String),

    /// Target answered with a non-200 status
    #[error("Target rejected replication with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Attempt exceeded the operation timeout
    #[error("Transfer timed out after {0} ms")]
    Timeout(u64),

    /// Acknowledgement could not be parsed
    #[error("Malformed acknowledgement: {0}")]
    MalformedAck(String),
}

impl TransferError {
    /// Transient errors are retried; everything else fails the target at once
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transport(_) | TransferError::Timeout(_))
    }
}

/// Failure of a health probe
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid probe response: {0}")]
    InvalidResponse(String),
}

/// HA errors
#[derive(Error, Debug)]
pub enum HaError {
    /// Unknown node id
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Digest mismatch between source and target
    #[error("Integrity check failed for {node_id}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        node_id: String,
        expected: String,
        actual: String,
    },

    /// Fewer nodes than the replication factor hold the data
    #[error("Replication below factor: {achieved} of {required} nodes hold the data")]
    InsufficientReplication { achieved: usize, required: usize },

    /// No node holds a replicated copy to recover from
    #[error("No replicated source available to recover {0}")]
    NoReplicatedSource(String),

    /// Failover exhausted every backup
    #[error("No healthy backup node available; cluster degraded")]
    NoHealthyBackup,

    /// No primary configured
    #[error("No primary node configured")]
    NoPrimary,

    /// Payload larger than the encryption scheme accepts
    #[error("Payload of {size} bytes exceeds encryption limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Encryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Transfer failure
    #[error("Transfer to {node_id} failed: {source}")]
    Transfer {
        node_id: String,
        #[source]
        source: TransferError,
    },

    /// Branch failed hash-link validation
    #[error("Invalid fork branch: {0}")]
    InvalidBranch(String),

    /// No backup exists
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Stored backup failed its integrity hash
    #[error("Backup {0} is corrupted")]
    CorruptBackup(String),

    /// Disk or network operation exceeded its timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger access failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] qnet_ledger::LedgerError),

    /// Encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Manifest encoding failed
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS or HTTP client setup failed
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for HA operations
pub type HaResult<T> = Result<T, HaError>;
