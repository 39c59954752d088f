//! Block structures
//!
//! One representation is shared by the consensus layer and the HA layer, so
//! fork handling and replication never convert between block shapes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Block hash type
pub type BlockHash = [u8; 32];

/// Lifecycle status reported by consensus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockStatus {
    /// Produced but not yet validated
    Pending,
    /// Accepted by the validator set
    Validated,
    /// Irreversible
    Finalized,
    /// Rejected by validation
    Rejected,
}

/// Sub-block: transactions validated before aggregation into a full block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubBlock {
    /// Sub-block identifier
    pub id: String,
    /// Position inside the parent block
    pub index: u64,
    /// Creation time (unix seconds)
    pub timestamp: u64,
    /// Validator that produced the sub-block
    pub validator: String,
    /// Encoded transactions
    pub transactions: Vec<Vec<u8>>,
    /// Proof of History hash at creation
    pub poh_hash: Vec<u8>,
    /// Content hash
    pub hash: BlockHash,
}

impl SubBlock {
    /// Create a sub-block and seal its hash
    pub fn new(
        id: impl Into<String>,
        index: u64,
        timestamp: u64,
        validator: impl Into<String>,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        let mut sub_block = Self {
            id: id.into(),
            index,
            timestamp,
            validator: validator.into(),
            transactions,
            poh_hash: Vec::new(),
            hash: [0u8; 32],
        };
        sub_block.hash = sub_block.calculate_hash();
        sub_block
    }

    /// Calculate sub-block hash
    pub fn calculate_hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.validator.as_bytes());
        for tx in &self.transactions {
            hasher.update((tx.len() as u64).to_le_bytes());
            hasher.update(tx);
        }
        hasher.update(&self.poh_hash);
        hasher.finalize().into()
    }
}

/// Block in the blockchain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Block identifier
    pub id: String,
    /// Height in the chain (genesis = 0)
    pub index: u64,
    /// Timestamp (unix seconds)
    pub timestamp: u64,
    /// Previous block hash
    pub prev_hash: BlockHash,
    /// Sealed hash of this block
    pub hash: BlockHash,
    /// Aggregated sub-blocks
    pub sub_blocks: Vec<SubBlock>,
    /// Proof-of-work nonce
    pub nonce: u64,
    /// Proof-of-work difficulty
    pub difficulty: u64,
    /// Validators that signed off
    pub validators: Vec<String>,
    /// Consensus status
    pub status: BlockStatus,
}

impl Block {
    /// Create new block and seal its hash
    pub fn new(
        index: u64,
        timestamp: u64,
        prev_hash: BlockHash,
        sub_blocks: Vec<SubBlock>,
        validators: Vec<String>,
    ) -> Self {
        let mut block = Self {
            id: String::new(),
            index,
            timestamp,
            prev_hash,
            hash: [0u8; 32],
            sub_blocks,
            nonce: 0,
            difficulty: 1,
            validators,
            status: BlockStatus::Pending,
        };
        block.seal();
        block
    }

    /// Genesis block
    pub fn genesis(timestamp: u64) -> Self {
        Self::new(0, timestamp, [0u8; 32], Vec::new(), Vec::new())
    }

    /// Recompute hash and id after a field change
    pub fn seal(&mut self) {
        self.hash = self.calculate_hash();
        self.id = hex::encode(&self.hash[..8]);
    }

    /// Calculate block hash over the consensus-relevant fields.
    ///
    /// `hash`, `id` and `status` are excluded: status moves through its
    /// lifecycle without changing block identity.
    pub fn calculate_hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.prev_hash);
        for sub_block in &self.sub_blocks {
            hasher.update(sub_block.hash);
        }
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        for validator in &self.validators {
            hasher.update(validator.as_bytes());
        }
        hasher.finalize().into()
    }

    /// Short hex form for logs
    pub fn short_hash(&self) -> String {
        hex::encode(&self.hash[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_status() {
        let mut block = Block::new(1, 1000, [7; 32], Vec::new(), vec!["v1".to_string()]);
        let sealed = block.hash;
        block.status = BlockStatus::Finalized;
        assert_eq!(block.calculate_hash(), sealed);
    }

    #[test]
    fn test_hash_covers_sub_blocks() {
        let sb = SubBlock::new("sb-1", 0, 1000, "v1", vec![b"tx".to_vec()]);
        let with = Block::new(1, 1000, [7; 32], vec![sb], Vec::new());
        let without = Block::new(1, 1000, [7; 32], Vec::new(), Vec::new());
        assert_ne!(with.hash, without.hash);
    }

    #[test]
    fn test_nonce_changes_hash() {
        let mut block = Block::new(3, 1000, [1; 32], Vec::new(), Vec::new());
        let before = block.hash;
        block.nonce = 42;
        block.seal();
        assert_ne!(before, block.hash);
        assert_eq!(block.id, hex::encode(&block.hash[..8]));
    }
}
