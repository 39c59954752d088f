//! Canonical ledger types for QNet
//!
//! Blocks, sub-blocks and full ledger snapshots are defined once here and
//! shared by the consensus layer and the high-availability layer.

pub mod audit;
pub mod block;
pub mod errors;
pub mod state;

pub use audit::{AuditEntry, AuditKind, InMemoryAudit, LedgerAudit, TracingAudit};
pub use block::{Block, BlockHash, BlockStatus, SubBlock};
pub use errors::{LedgerError, LedgerResult};
pub use state::{Ledger, LedgerState};

/// Chain access exposed by the consensus layer
pub trait ChainSource: Send + Sync {
    /// Current chain head
    fn get_last_block(&self) -> LedgerResult<Block>;

    /// Full canonical chain, genesis first
    fn get_blocks(&self) -> Vec<Block>;

    /// Replace the canonical chain in a single step
    fn set_chain(&self, chain: Vec<Block>) -> LedgerResult<()>;
}

/// Snapshot access to the full ledger state
pub trait LedgerStore: Send + Sync {
    /// Copy of the complete state
    fn snapshot(&self) -> LedgerState;

    /// Replace the in-memory state wholesale
    fn restore(&self, state: LedgerState);
}
