//! Replication of data units to `replication_factor` nodes
//!
//! The source node counts towards the factor. Targets are contacted in list
//! order and the round stops as soon as the factor is met. Successful
//! replicas are never rolled back, so the replicated set only grows until a
//! node is recovered from scratch.
//!
//! With a chain attached, the encoded bytes of a durable block or sub-block
//! are dropped and re-encoded from the chain when needed again. Full ledger
//! snapshots are never released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use qnet_ledger::{Block, ChainSource, LedgerAudit, LedgerState, SubBlock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::cipher::PayloadCipher;
use super::codec::{digest, encode_unit, verify_ack, DataUnit, DataUnitId};
use super::transport::{ReplicationTransport, TransferRequest};
use crate::config::ReplicationConfig;
use crate::errors::{HaError, HaResult, TransferError};
use crate::metrics;
use crate::traits::NodeRecoveryHandler;

/// Back-off between attempts to the same target
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Replication state of one data unit on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub node_id: String,
    pub is_data_replicated: bool,
    pub last_replicated: Option<DateTime<Utc>>,
}

/// Outcome of a replication round
#[derive(Debug, Clone, Default)]
pub struct ReplicationReport {
    /// Targets that received the unit in this round
    pub replicated: Vec<String>,
    /// Targets that failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Nodes holding the unit after the round, source included
    pub achieved: usize,
}

/// Tracked unit: canonical bytes while still needed, plus per-node state in
/// first-seen order
struct UnitRecord {
    payload: Option<Bytes>,
    digest: [u8; 32],
    nodes: Vec<ReplicationState>,
}

impl UnitRecord {
    fn replicated_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_data_replicated).count()
    }

    fn is_replicated_on(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == node_id && n.is_data_replicated)
    }

    fn entry(&mut self, node_id: &str) -> &mut ReplicationState {
        let pos = match self.nodes.iter().position(|n| n.node_id == node_id) {
            Some(pos) => pos,
            None => {
                self.nodes.push(ReplicationState {
                    node_id: node_id.to_string(),
                    is_data_replicated: false,
                    last_replicated: None,
                });
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[pos]
    }

    fn mark_replicated(&mut self, node_id: &str) {
        let state = self.entry(node_id);
        state.is_data_replicated = true;
        state.last_replicated = Some(Utc::now());
    }
}

struct ReplicationInner {
    replication_factor: usize,
    units: HashMap<DataUnitId, UnitRecord>,
}

/// Replicates ledger state, blocks and sub-blocks across the cluster
pub struct DataReplicationManager {
    local_node: String,
    config: ReplicationConfig,
    inner: Mutex<ReplicationInner>,
    transport: Arc<dyn ReplicationTransport>,
    cipher: Arc<dyn PayloadCipher>,
    audit: Arc<dyn LedgerAudit>,
    chain: Option<Arc<dyn ChainSource>>,
}

impl DataReplicationManager {
    pub fn new(
        local_node: impl Into<String>,
        config: ReplicationConfig,
        transport: Arc<dyn ReplicationTransport>,
        cipher: Arc<dyn PayloadCipher>,
        audit: Arc<dyn LedgerAudit>,
    ) -> Self {
        let inner = ReplicationInner {
            replication_factor: config.replication_factor.max(1),
            units: HashMap::new(),
        };
        Self {
            local_node: local_node.into(),
            config,
            inner: Mutex::new(inner),
            transport,
            cipher,
            audit,
            chain: None,
        }
    }

    /// Re-encode released blocks and sub-blocks from `chain`
    pub fn with_chain(mut self, chain: Arc<dyn ChainSource>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Replicate `unit` from the local node to `targets`
    pub async fn replicate(&self, unit: &DataUnit, targets: &[String]) -> HaResult<ReplicationReport> {
        let id = unit.id()?;
        let payload = Bytes::from(encode_unit(unit)?);
        let digest = digest(&payload);

        {
            let mut inner = self.inner.lock();
            let record = inner.units.entry(id.clone()).or_insert_with(|| UnitRecord {
                payload: None,
                digest,
                nodes: Vec::new(),
            });
            record.payload.get_or_insert(payload);
            if !record.is_replicated_on(&self.local_node) {
                record.mark_replicated(&self.local_node);
            }
        }
        self.replicate_known(&id, targets).await
    }

    pub async fn replicate_full_ledger(&self, state: &LedgerState, targets: &[String]) -> HaResult<ReplicationReport> {
        self.replicate(&DataUnit::FullLedger(state.clone()), targets).await
    }

    pub async fn replicate_block(&self, block: &Block, targets: &[String]) -> HaResult<ReplicationReport> {
        self.replicate(&DataUnit::Block(block.clone()), targets).await
    }

    pub async fn replicate_sub_block(&self, sub_block: &SubBlock, targets: &[String]) -> HaResult<ReplicationReport> {
        self.replicate(&DataUnit::SubBlock(sub_block.clone()), targets).await
    }

    /// Replicate an already tracked unit until the factor is met
    pub async fn replicate_known(&self, id: &DataUnitId, targets: &[String]) -> HaResult<ReplicationReport> {
        let (wire, digest) = self.encrypted_payload(id)?;

        let mut report = ReplicationReport::default();
        for target in targets {
            if target == &self.local_node {
                continue;
            }
            let (achieved, required, already) = {
                let inner = self.inner.lock();
                let achieved = inner.units.get(id).map(|r| r.replicated_count()).unwrap_or(0);
                let already = inner.units.get(id).map(|r| r.is_replicated_on(target)).unwrap_or(false);
                (achieved, inner.replication_factor, already)
            };
            if achieved >= required {
                break;
            }
            if already {
                continue;
            }

            match self.transfer_with_retry(id, &self.local_node, target, wire.clone(), &digest).await {
                Ok(()) => {
                    if let Some(record) = self.inner.lock().units.get_mut(id) {
                        record.mark_replicated(target);
                    }
                    if let Err(e) = self.audit.log_replication(target, Utc::now()) {
                        warn!("Failed to audit replication to {}: {}", target, e);
                    }
                    report.replicated.push(target.clone());
                }
                Err(e) => {
                    warn!("Replication of {} to {} failed: {}", id, target, e);
                    report.failed.push((target.clone(), e.to_string()));
                }
            }
        }

        let (achieved, required) = {
            let inner = self.inner.lock();
            (
                inner.units.get(id).map(|r| r.replicated_count()).unwrap_or(0),
                inner.replication_factor,
            )
        };
        report.achieved = achieved;
        if achieved < required {
            error!("{} replicated on {} of {} required nodes", id, achieved, required);
            return Err(HaError::InsufficientReplication { achieved, required });
        }
        info!("{} replicated on {} nodes", id, achieved);
        self.release_payload(id);
        Ok(report)
    }

    /// Encoded bytes and digest of a tracked unit, from the cache or the chain
    fn load_payload(&self, id: &DataUnitId) -> HaResult<(Bytes, [u8; 32])> {
        let expected = {
            let inner = self.inner.lock();
            let record = inner
                .units
                .get(id)
                .ok_or_else(|| HaError::NoReplicatedSource(id.to_string()))?;
            if let Some(payload) = &record.payload {
                return Ok((payload.clone(), record.digest));
            }
            record.digest
        };

        let unit = self
            .chain
            .as_ref()
            .and_then(|chain| find_on_chain(chain.as_ref(), id))
            .ok_or_else(|| HaError::NoReplicatedSource(id.to_string()))?;
        let payload = Bytes::from(encode_unit(&unit)?);
        if digest(&payload) != expected {
            warn!("{} re-encoded from the chain with a different digest", id);
            return Err(HaError::NoReplicatedSource(id.to_string()));
        }
        debug!("{} re-encoded from the chain", id);
        Ok((payload, expected))
    }

    fn encrypted_payload(&self, id: &DataUnitId) -> HaResult<(Bytes, [u8; 32])> {
        let (payload, expected) = self.load_payload(id)?;
        Ok((Bytes::from(self.cipher.encrypt(&payload)?), expected))
    }

    /// Drop the cached bytes of a durable unit the chain can reproduce
    fn release_payload(&self, id: &DataUnitId) {
        if self.chain.is_none() || matches!(id, DataUnitId::FullLedger(_)) {
            return;
        }
        let mut inner = self.inner.lock();
        let required = inner.replication_factor;
        if let Some(record) = inner.units.get_mut(id) {
            if record.replicated_count() >= required {
                record.payload = None;
            }
        }
    }

    /// Bounded, retried delivery of one payload. Integrity failures and
    /// non-transient errors are never retried.
    async fn transfer_with_retry(
        &self,
        id: &DataUnitId,
        source: &str,
        target: &str,
        wire: Bytes,
        expected: &[u8; 32],
    ) -> HaResult<()> {
        let timeout = self.config.transfer_timeout();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request = TransferRequest {
                unit: id,
                source,
                target,
                endpoint: id.endpoint(),
                payload: wire.clone(),
                chunk_size: self.config.chunk_size,
            };
            let result = match tokio::time::timeout(timeout, self.transport.transfer(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout(timeout.as_millis() as u64)),
            };

            match result {
                Ok(reported) => {
                    return match verify_ack(target, expected, &reported) {
                        Ok(()) => {
                            metrics::record_transfer("success");
                            debug!("{} delivered to {} on attempt {}", id, target, attempt);
                            Ok(())
                        }
                        Err(e) => {
                            metrics::record_transfer("integrity");
                            Err(e)
                        }
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    metrics::record_transfer("retry");
                    debug!("Attempt {}/{} to {} failed: {}", attempt, max_attempts, target, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    metrics::record_transfer("failure");
                    return Err(HaError::Transfer {
                        node_id: target.to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Re-populate a faulty node with every unit it held.
    ///
    /// The bytes are pushed from the local copy. Each transfer is attributed
    /// to the first other node holding the unit, and recovery of a unit fails
    /// while that node is unreachable. The node's replication state is reset
    /// first. Returns the number of units restored; fails if any unit had no
    /// replicated source.
    pub async fn recover_node_data(&self, faulty_node: &str) -> HaResult<usize> {
        let mut plan = Vec::new();
        let mut missing = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (id, record) in inner.units.iter_mut() {
                let Some(state) = record.nodes.iter_mut().find(|n| n.node_id == faulty_node) else {
                    continue;
                };
                state.is_data_replicated = false;
                state.last_replicated = None;

                let source = record
                    .nodes
                    .iter()
                    .find(|n| n.node_id != faulty_node && n.is_data_replicated)
                    .map(|n| n.node_id.clone());
                match source {
                    Some(source) => plan.push((id.clone(), source)),
                    None => missing.push(id.clone()),
                }
            }
        }

        if plan.is_empty() && missing.is_empty() {
            debug!("Node {} holds no tracked data", faulty_node);
            return Ok(0);
        }
        info!("Recovering {} units onto {}", plan.len(), faulty_node);

        let mut recovered = 0;
        let mut first_error = None;
        for (id, source) in plan {
            let (wire, expected) = match self.encrypted_payload(&id) {
                Ok(prepared) => prepared,
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            match self.transfer_with_retry(&id, &source, faulty_node, wire, &expected).await {
                Ok(()) => {
                    if let Some(record) = self.inner.lock().units.get_mut(&id) {
                        record.mark_replicated(faulty_node);
                    }
                    if let Err(e) = self.audit.log_data_recovery(faulty_node, Utc::now()) {
                        warn!("Failed to audit data recovery of {}: {}", faulty_node, e);
                    }
                    recovered += 1;
                }
                Err(e) => {
                    error!("Recovery of {} onto {} from {} failed: {}", id, faulty_node, source, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !missing.is_empty() {
            error!("{} units have no replicated source for {}", missing.len(), faulty_node);
            return Err(HaError::NoReplicatedSource(faulty_node.to_string()));
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(recovered),
        }
    }

    /// Raise the factor; lower or equal values are ignored
    pub fn increase_replication_factor(&self, factor: usize) -> bool {
        let mut inner = self.inner.lock();
        if factor > inner.replication_factor {
            info!("Replication factor raised {} -> {}", inner.replication_factor, factor);
            inner.replication_factor = factor;
            true
        } else {
            debug!("Ignoring replication factor {} (current {})", factor, inner.replication_factor);
            false
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.inner.lock().replication_factor
    }

    /// Per-node state of a unit, in first-contact order
    pub fn get_replication_status(&self, id: &DataUnitId) -> Vec<ReplicationState> {
        self.inner
            .lock()
            .units
            .get(id)
            .map(|r| r.nodes.clone())
            .unwrap_or_default()
    }

    pub fn replicated_count(&self, id: &DataUnitId) -> usize {
        self.inner.lock().units.get(id).map(|r| r.replicated_count()).unwrap_or(0)
    }

    /// Replicated on at least `replication_factor` nodes
    pub fn is_durable(&self, id: &DataUnitId) -> bool {
        let inner = self.inner.lock();
        inner
            .units
            .get(id)
            .map(|r| r.replicated_count() >= inner.replication_factor)
            .unwrap_or(false)
    }

    /// Every tracked unit
    pub fn units(&self) -> Vec<DataUnitId> {
        let mut ids: Vec<_> = self.inner.lock().units.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Units below the replication factor
    pub fn under_replicated(&self) -> Vec<DataUnitId> {
        let inner = self.inner.lock();
        let mut ids: Vec<_> = inner
            .units
            .iter()
            .filter(|(_, r)| r.replicated_count() < inner.replication_factor)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Tracked units whose encoded bytes are still held in memory
    pub fn cached_payloads(&self) -> usize {
        self.inner.lock().units.values().filter(|r| r.payload.is_some()).count()
    }

    /// Nodes currently holding a unit
    pub fn holders(&self, id: &DataUnitId) -> Vec<String> {
        self.get_replication_status(id)
            .into_iter()
            .filter(|s| s.is_data_replicated)
            .map(|s| s.node_id)
            .collect()
    }
}

/// Locate a block or sub-block on the canonical chain by id
fn find_on_chain(chain: &dyn ChainSource, id: &DataUnitId) -> Option<DataUnit> {
    match id {
        DataUnitId::FullLedger(_) => None,
        DataUnitId::Block(hash) => chain
            .get_blocks()
            .into_iter()
            .find(|b| hex::encode(b.hash) == *hash)
            .map(DataUnit::Block),
        DataUnitId::SubBlock(hash) => chain
            .get_blocks()
            .into_iter()
            .flat_map(|b| b.sub_blocks)
            .find(|s| hex::encode(s.hash) == *hash)
            .map(DataUnit::SubBlock),
    }
}

#[async_trait]
impl NodeRecoveryHandler for DataReplicationManager {
    async fn recover_node(&self, node_id: &str) -> HaResult<()> {
        self.recover_node_data(node_id).await.map(|_| ())
    }
}
