//! Node error types

use qnet_ha::HaError;
use qnet_ledger::LedgerError;
use thiserror::Error;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration source could not be read or parsed
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// HA layer error
    #[error("HA error: {0}")]
    Ha(#[from] HaError),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Already running
    #[error("Node is already running")]
    AlreadyRunning,
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
