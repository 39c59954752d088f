//! Full ledger state and the in-memory ledger

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::block::{Block, BlockHash};
use crate::errors::{LedgerError, LedgerResult};
use crate::{ChainSource, LedgerStore};

/// Complete ledger snapshot: chain plus derived balances.
///
/// This is the unit written by backups and shipped by full-ledger replication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerState {
    /// Canonical chain, genesis first
    pub blocks: Vec<Block>,
    /// Account balances
    pub balances: BTreeMap<String, u64>,
}

impl LedgerState {
    /// Canonical byte encoding
    pub fn encode(&self) -> LedgerResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from canonical bytes
    pub fn decode(bytes: &[u8]) -> LedgerResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// SHA-256 of the canonical encoding
    pub fn digest(&self) -> LedgerResult<[u8; 32]> {
        let bytes = self.encode()?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// Height of the chain head, if any
    pub fn height(&self) -> Option<u64> {
        self.blocks.last().map(|b| b.index)
    }
}

/// In-memory ledger guarded by a single lock
pub struct Ledger {
    state: RwLock<LedgerState>,
}

impl Ledger {
    /// Empty ledger
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// Ledger seeded with a genesis block
    pub fn with_genesis(genesis: Block) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                blocks: vec![genesis],
                balances: BTreeMap::new(),
            }),
        }
    }

    /// Append a block that extends the current head
    pub fn append_block(&self, block: Block) -> LedgerResult<()> {
        let mut state = self.state.write();
        if let Some(head) = state.blocks.last() {
            if block.prev_hash != head.calculate_hash() {
                return Err(LedgerError::InvalidBlock(format!(
                    "block {} does not extend head {}",
                    block.short_hash(),
                    head.short_hash()
                )));
            }
        }
        debug!("Appending block #{} ({})", block.index, block.short_hash());
        state.blocks.push(block);
        Ok(())
    }

    /// Credit an account (used by state replay and tests)
    pub fn credit(&self, account: &str, amount: u64) {
        let mut state = self.state.write();
        let balance = state.balances.entry(account.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    /// Clone of the current state
    pub fn state(&self) -> LedgerState {
        self.state.read().clone()
    }

    /// Hash of the current head
    pub fn head_hash(&self) -> Option<BlockHash> {
        self.state.read().blocks.last().map(|b| b.hash)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainSource for Ledger {
    fn get_last_block(&self) -> LedgerResult<Block> {
        self.state
            .read()
            .blocks
            .last()
            .cloned()
            .ok_or(LedgerError::EmptyChain)
    }

    fn get_blocks(&self) -> Vec<Block> {
        self.state.read().blocks.clone()
    }

    fn set_chain(&self, chain: Vec<Block>) -> LedgerResult<()> {
        if chain.is_empty() {
            return Err(LedgerError::EmptyChain);
        }
        let mut state = self.state.write();
        info!(
            "Replacing canonical chain: {} -> {} blocks",
            state.blocks.len(),
            chain.len()
        );
        state.blocks = chain;
        Ok(())
    }
}

impl LedgerStore for Ledger {
    fn snapshot(&self) -> LedgerState {
        self.state()
    }

    fn restore(&self, state: LedgerState) {
        let mut current = self.state.write();
        info!(
            "Restoring ledger state ({} blocks, {} accounts)",
            state.blocks.len(),
            state.balances.len()
        );
        *current = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_requires_link() {
        let genesis = Block::genesis(0);
        let ledger = Ledger::with_genesis(genesis.clone());

        let next = Block::new(1, 1, genesis.hash, Vec::new(), Vec::new());
        ledger.append_block(next).unwrap();

        let orphan = Block::new(2, 2, [9; 32], Vec::new(), Vec::new());
        assert!(ledger.append_block(orphan).is_err());
        assert_eq!(ledger.get_blocks().len(), 2);
    }

    #[test]
    fn test_append_links_to_recomputed_hash() {
        let mut genesis = Block::genesis(0);
        genesis.hash = [7; 32];
        let ledger = Ledger::with_genesis(genesis.clone());

        let stale = Block::new(1, 1, [7; 32], Vec::new(), Vec::new());
        assert!(ledger.append_block(stale).is_err());

        let linked = Block::new(1, 1, genesis.calculate_hash(), Vec::new(), Vec::new());
        ledger.append_block(linked).unwrap();
        assert_eq!(ledger.get_blocks().len(), 2);
    }

    #[test]
    fn test_snapshot_restore() {
        let ledger = Ledger::with_genesis(Block::genesis(0));
        ledger.credit("alice", 10);
        let snapshot = ledger.snapshot();

        let bytes = snapshot.encode().unwrap();
        let decoded = LedgerState::decode(&bytes).unwrap();
        assert_eq!(decoded, snapshot);

        let other = Ledger::new();
        other.restore(decoded);
        assert_eq!(other.state().balances.get("alice"), Some(&10));
        assert_eq!(other.head_hash(), ledger.head_hash());
    }

    #[test]
    fn test_set_chain_rejects_empty() {
        let ledger = Ledger::with_genesis(Block::genesis(0));
        assert!(matches!(ledger.set_chain(Vec::new()), Err(LedgerError::EmptyChain)));
        assert!(ledger.get_last_block().is_ok());
    }
}
