//! Canonical encoding, chunking and digests for replicated data units

use std::fmt;

use bytes::Bytes;
use qnet_ledger::{Block, LedgerState, SubBlock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{HaError, HaResult};

/// Unit of replicated data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataUnit {
    FullLedger(LedgerState),
    Block(Block),
    SubBlock(SubBlock),
}

/// Stable identity of a [`DataUnit`]. Blocks and sub-blocks are addressed by
/// hash, full ledger snapshots by the digest of their encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataUnitId {
    FullLedger(String),
    Block(String),
    SubBlock(String),
}

impl fmt::Display for DataUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, id) = match self {
            DataUnitId::FullLedger(id) => ("ledger", id),
            DataUnitId::Block(id) => ("block", id),
            DataUnitId::SubBlock(id) => ("sub-block", id),
        };
        write!(f, "{}:{}", kind, &id[..id.len().min(16)])
    }
}

/// Receiving endpoint on the target node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    FullLedger,
    Ledger,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::FullLedger => "/api/replicate-full-ledger",
            Endpoint::Ledger => "/api/replicate-ledger",
        }
    }
}

impl DataUnit {
    /// Identity derived from content
    pub fn id(&self) -> HaResult<DataUnitId> {
        Ok(match self {
            DataUnit::FullLedger(state) => DataUnitId::FullLedger(hex::encode(state.digest()?)),
            DataUnit::Block(block) => DataUnitId::Block(hex::encode(block.hash)),
            DataUnit::SubBlock(sub_block) => DataUnitId::SubBlock(hex::encode(sub_block.hash)),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            DataUnit::FullLedger(_) => Endpoint::FullLedger,
            DataUnit::Block(_) | DataUnit::SubBlock(_) => Endpoint::Ledger,
        }
    }
}

impl DataUnitId {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            DataUnitId::FullLedger(_) => Endpoint::FullLedger,
            DataUnitId::Block(_) | DataUnitId::SubBlock(_) => Endpoint::Ledger,
        }
    }
}

/// Canonical byte encoding of a data unit
pub fn encode_unit(unit: &DataUnit) -> HaResult<Vec<u8>> {
    Ok(bincode::serialize(unit)?)
}

pub fn decode_unit(bytes: &[u8]) -> HaResult<DataUnit> {
    Ok(bincode::deserialize(bytes)?)
}

/// Split a payload into zero-copy chunks of at most `chunk_size` bytes
pub fn chunk_payload(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    (0..payload.len())
        .step_by(chunk_size)
        .map(|start| payload.slice(start..(start + chunk_size).min(payload.len())))
        .collect()
}

/// SHA-256 digest
pub fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// True iff the reconstructed bytes hash to the same digest as the source
pub fn validate_data_transfer(source: &[u8], reconstructed: &[u8]) -> bool {
    digest(source) == digest(reconstructed)
}

/// Compare the digest reported by a target against the source digest
pub fn verify_ack(node_id: &str, expected: &[u8; 32], reported_hex: &str) -> HaResult<()> {
    let expected_hex = hex::encode(expected);
    if expected_hex.eq_ignore_ascii_case(reported_hex.trim()) {
        Ok(())
    } else {
        Err(HaError::IntegrityMismatch {
            node_id: node_id.to_string(),
            expected: expected_hex,
            actual: reported_hex.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let sub = SubBlock::new("sb-1", 0, 1_000, "v1", vec![b"tx-1".to_vec(), b"tx-2".to_vec()]);
        Block::new(1, 1_000, [3; 32], vec![sub], vec!["v1".into()])
    }

    #[test]
    fn test_chunking_covers_payload() {
        let payload = Bytes::from(vec![7u8; 64 * 1024 * 2 + 10]);
        let chunks = chunk_payload(&payload, 64 * 1024);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 64 * 1024));
        assert_eq!(chunks[2].len(), 10);
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(rejoined, payload.to_vec());
    }

    #[test]
    fn test_empty_payload_has_no_chunks() {
        assert!(chunk_payload(&Bytes::new(), 1024).is_empty());
    }

    #[test]
    fn test_flipped_byte_fails_validation() {
        let encoded = encode_unit(&DataUnit::Block(sample_block())).unwrap();
        let reconstructed = encoded.clone();
        assert!(validate_data_transfer(&encoded, &reconstructed));
        assert_eq!(decode_unit(&reconstructed).unwrap(), DataUnit::Block(sample_block()));

        let mut corrupted = encoded.clone();
        let mid = corrupted.len() / 2;
        corrupted[mid] ^= 0x01;
        assert!(!validate_data_transfer(&encoded, &corrupted));
    }

    #[test]
    fn test_verify_ack() {
        let d = digest(b"ledger");
        assert!(verify_ack("n1", &d, &hex::encode(d).to_uppercase()).is_ok());
        let err = verify_ack("n1", &d, &hex::encode(digest(b"other"))).unwrap_err();
        assert!(matches!(err, HaError::IntegrityMismatch { .. }));
    }

    #[test]
    fn test_endpoint_routing() {
        let block = sample_block();
        assert_eq!(DataUnit::Block(block.clone()).endpoint().path(), "/api/replicate-ledger");
        assert_eq!(
            DataUnit::FullLedger(LedgerState::default()).endpoint().path(),
            "/api/replicate-full-ledger"
        );
        let id = DataUnit::Block(block.clone()).id().unwrap();
        assert_eq!(id, DataUnitId::Block(hex::encode(block.hash)));
        assert!(id.to_string().starts_with("block:"));
    }
}
