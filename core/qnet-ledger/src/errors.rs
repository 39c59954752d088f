//! Error types for ledger access

use thiserror::Error;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Chain has no blocks
    #[error("Chain is empty")]
    EmptyChain,

    /// Block failed a structural check
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Snapshot encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Audit sink rejected an entry
    #[error("Audit sink error: {0}")]
    Audit(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
