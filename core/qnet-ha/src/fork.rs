//! Fork detection and resolution for the canonical chain
//!
//! Blocks that do not build on the local head are buffered as branches
//! rooted at the canonical block they extend. Resolution switches to the best
//! valid branch only when it strictly beats the canonical chain and every
//! other branch; any tie keeps the current chain. Branches that weigh less
//! than the canonical chain are dropped when resolution keeps it, and the
//! buffer evicts its oldest branch once full.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use qnet_ledger::{Block, BlockHash, ChainSource};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ForkConfig;
use crate::errors::HaResult;
use crate::metrics;

/// Rule used to compare competing chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkChoiceRule {
    /// Most blocks wins
    #[default]
    LongestChain,
    /// Greatest cumulative difficulty wins
    HeaviestChain,
}

impl ForkChoiceRule {
    fn weight<'a>(&self, blocks: impl Iterator<Item = &'a Block>) -> u128 {
        match self {
            ForkChoiceRule::LongestChain => blocks.count() as u128,
            ForkChoiceRule::HeaviestChain => blocks.map(|b| b.difficulty as u128).sum(),
        }
    }
}

/// Competing history buffered until resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkBranch {
    pub id: u64,
    /// Index of the canonical block the branch builds on; `None` if the
    /// parent was never seen
    pub divergence_index: Option<usize>,
    pub blocks: Vec<Block>,
    pub detected_at: DateTime<Utc>,
}

impl ForkBranch {
    /// Length of the chain this branch would produce
    pub fn chain_len(&self) -> usize {
        self.divergence_index.map(|i| i + 1).unwrap_or(0) + self.blocks.len()
    }

    fn tip_hash(&self) -> Option<BlockHash> {
        self.blocks.last().map(|b| b.calculate_hash())
    }
}

/// Result of [`ChainForkManager::detect_fork`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkDetection {
    /// Block extends the local head
    NoFork,
    /// Block started a new branch
    NewBranch(u64),
    /// Block extended a buffered branch
    ExtendedBranch(u64),
}

/// Result of a resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkResolution {
    /// Canonical chain replaced by the branch
    Switched { branch_id: u64, reorg_depth: u64, new_length: usize },
    /// No branch beat the canonical chain
    KeptCanonical,
}

/// Fork metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkMetrics {
    /// Total forks detected
    pub total_forks: u64,

    /// Canonical chain switches
    pub resolutions: u64,

    /// Branches discarded as invalid, outweighed or evicted
    pub rejected_branches: u64,

    /// Deepest reorg
    pub max_reorg_depth: u64,

    /// Branches currently buffered
    pub active_branches: u64,
}

/// Fork event for history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: ForkEventType,
    /// Blocks involved
    pub blocks: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkEventType {
    ForkDetected { height: u64, branches: usize },
    Reorganization { depth: u64, from: BlockHash, to: BlockHash },
    BranchRejected { branch_id: u64, reason: String },
    /// Every buffered branch was invalid
    NoValidAlternative,
}

/// Check a branch against the canonical chain: the first block must link to
/// the canonical block at the divergence point and every adjacent pair must
/// be hash-linked.
pub fn validate_branch(canonical: &[Block], branch: &ForkBranch) -> bool {
    let Some(index) = branch.divergence_index else {
        return false;
    };
    let (Some(anchor), Some(first)) = (canonical.get(index), branch.blocks.first()) else {
        return false;
    };
    if first.prev_hash != anchor.calculate_hash() {
        return false;
    }
    branch
        .blocks
        .windows(2)
        .all(|pair| pair[1].prev_hash == pair[0].calculate_hash())
}

struct ForkState {
    branches: Vec<ForkBranch>,
    next_branch_id: u64,
    metrics: ForkMetrics,
    history: VecDeque<ForkEvent>,
}

/// Fork manager for the canonical chain
pub struct ChainForkManager {
    chain: Arc<dyn ChainSource>,
    rule: ForkChoiceRule,
    history_capacity: usize,
    max_branches: usize,
    /// Held for the whole of every detection and resolution
    state: Mutex<ForkState>,
}

impl ChainForkManager {
    pub fn new(chain: Arc<dyn ChainSource>, config: &ForkConfig) -> Self {
        if config.rule == ForkChoiceRule::LongestChain {
            debug!("Fork choice: longest chain (block count only, difficulty ignored)");
        }
        Self {
            chain,
            rule: config.rule,
            history_capacity: config.history_capacity.max(1),
            max_branches: config.max_branches.max(1),
            state: Mutex::new(ForkState {
                branches: Vec::new(),
                next_branch_id: 1,
                metrics: ForkMetrics::default(),
                history: VecDeque::with_capacity(config.history_capacity.min(1000)),
            }),
        }
    }

    /// Classify an incoming block, buffering it if it does not extend the head
    pub async fn detect_fork(&self, block: Block) -> HaResult<ForkDetection> {
        // Resolution swaps the chain under this lock, so the head is read after it
        let mut state = self.state.lock().await;
        let head = self.chain.get_last_block()?;
        if block.prev_hash == head.calculate_hash() {
            return Ok(ForkDetection::NoFork);
        }

        if let Some(branch) = state
            .branches
            .iter_mut()
            .find(|b| b.tip_hash() == Some(block.prev_hash))
        {
            debug!("Block {} extends branch {}", block.short_hash(), branch.id);
            branch.blocks.push(block);
            return Ok(ForkDetection::ExtendedBranch(branch.id));
        }

        let divergence_index = self
            .chain
            .get_blocks()
            .iter()
            .position(|b| b.calculate_hash() == block.prev_hash);
        if divergence_index.is_none() {
            warn!("Block {} has unknown parent; buffering as orphan branch", block.short_hash());
        }

        if state.branches.len() >= self.max_branches {
            let evicted = state.branches.remove(0);
            warn!("Branch buffer full; evicting branch {}", evicted.id);
            state.metrics.rejected_branches += 1;
            metrics::record_fork_event("evicted");
            self.record_event(
                &mut state,
                ForkEventType::BranchRejected {
                    branch_id: evicted.id,
                    reason: "branch buffer full".into(),
                },
                evicted.blocks.iter().map(|b| b.hash).collect(),
            );
        }

        let id = state.next_branch_id;
        state.next_branch_id += 1;
        let height = block.index;
        let hash = block.hash;
        state.branches.push(ForkBranch {
            id,
            divergence_index,
            blocks: vec![block],
            detected_at: Utc::now(),
        });
        state.metrics.total_forks += 1;
        state.metrics.active_branches = state.branches.len() as u64;
        let branches = state.branches.len();
        self.record_event(
            &mut state,
            ForkEventType::ForkDetected { height, branches },
            vec![head.hash, hash],
        );
        metrics::record_fork_event("detected");
        info!("Fork detected at height {} (branch {}, {} buffered)", height, id, branches);
        Ok(ForkDetection::NewBranch(id))
    }

    /// Validate a branch against the current canonical chain
    pub fn validate_chain(&self, branch: &ForkBranch) -> bool {
        validate_branch(&self.chain.get_blocks(), branch)
    }

    /// Switch to the best valid branch if it strictly beats everything else
    pub async fn resolve_fork(&self) -> HaResult<ForkResolution> {
        let mut state = self.state.lock().await;
        self.resolve_locked(&mut state)
    }

    /// Drop invalid branches, then resolve among the valid ones
    pub async fn fork_recovery(&self) -> HaResult<ForkResolution> {
        let mut state = self.state.lock().await;
        let canonical = self.chain.get_blocks();

        let (valid, invalid): (Vec<ForkBranch>, Vec<ForkBranch>) = state
            .branches
            .drain(..)
            .partition(|b| validate_branch(&canonical, b));
        for branch in &invalid {
            warn!("Discarding invalid branch {} ({} blocks)", branch.id, branch.blocks.len());
            state.metrics.rejected_branches += 1;
            metrics::record_fork_event("rejected");
            self.record_event(
                &mut state,
                ForkEventType::BranchRejected {
                    branch_id: branch.id,
                    reason: "hash link broken".into(),
                },
                branch.blocks.iter().map(|b| b.hash).collect(),
            );
        }
        state.branches = valid;
        state.metrics.active_branches = state.branches.len() as u64;

        if state.branches.is_empty() {
            info!("No valid alternative chain; keeping canonical chain");
            self.record_event(&mut state, ForkEventType::NoValidAlternative, Vec::new());
            return Ok(ForkResolution::KeptCanonical);
        }
        self.resolve_locked(&mut state)
    }

    fn resolve_locked(&self, state: &mut ForkState) -> HaResult<ForkResolution> {
        let canonical = self.chain.get_blocks();
        let canonical_weight = self.rule.weight(canonical.iter());

        // None for branches that cannot be compared
        let weights: Vec<Option<u128>> = state
            .branches
            .iter()
            .map(|branch| {
                let index = branch.divergence_index?;
                if !validate_branch(&canonical, branch) {
                    return None;
                }
                Some(
                    self.rule
                        .weight(canonical[..=index].iter().chain(branch.blocks.iter())),
                )
            })
            .collect();

        let mut best: Option<(usize, u128)> = None;
        let mut tied = false;
        for (pos, weight) in weights.iter().enumerate() {
            let Some(weight) = *weight else {
                continue;
            };
            match best {
                Some((_, w)) if weight == w => tied = true,
                Some((_, w)) if weight < w => {}
                _ => {
                    best = Some((pos, weight));
                    tied = false;
                }
            }
        }

        let winner = match best {
            Some((pos, weight)) if !tied && weight > canonical_weight => pos,
            _ => {
                debug!("Fork resolution kept canonical chain ({} blocks)", canonical.len());
                metrics::record_fork_event("kept");
                self.prune_outweighed(state, &weights, canonical_weight);
                return Ok(ForkResolution::KeptCanonical);
            }
        };

        let branch = state.branches[winner].clone();
        let index = branch.divergence_index.unwrap_or(0);
        let mut new_chain: Vec<Block> = canonical[..=index].to_vec();
        new_chain.extend(branch.blocks.iter().cloned());
        let new_length = new_chain.len();
        let reorg_depth = (canonical.len() - (index + 1)) as u64;
        let from = canonical.last().map(|b| b.hash).unwrap_or_default();
        let to = branch.blocks.last().map(|b| b.hash).unwrap_or_default();

        self.chain.set_chain(new_chain)?;

        state.branches.clear();
        state.metrics.active_branches = 0;
        state.metrics.resolutions += 1;
        state.metrics.max_reorg_depth = state.metrics.max_reorg_depth.max(reorg_depth);
        self.record_event(
            state,
            ForkEventType::Reorganization {
                depth: reorg_depth,
                from,
                to,
            },
            vec![from, to],
        );
        metrics::record_fork_event("resolved");
        info!(
            "Switched to branch {}: {} -> {} blocks (reorg depth {})",
            branch.id,
            canonical.len(),
            new_length,
            reorg_depth
        );
        Ok(ForkResolution::Switched {
            branch_id: branch.id,
            reorg_depth,
            new_length,
        })
    }

    /// Drop valid branches lighter than the canonical chain; equal-weight
    /// rivals stay buffered
    fn prune_outweighed(&self, state: &mut ForkState, weights: &[Option<u128>], canonical_weight: u128) {
        let branches = std::mem::take(&mut state.branches);
        for (branch, weight) in branches.into_iter().zip(weights.iter()) {
            match weight {
                Some(w) if *w < canonical_weight => {
                    debug!("Dropping branch {} (weight {} < {})", branch.id, w, canonical_weight);
                    state.metrics.rejected_branches += 1;
                    metrics::record_fork_event("pruned");
                    self.record_event(
                        state,
                        ForkEventType::BranchRejected {
                            branch_id: branch.id,
                            reason: "outweighed by canonical chain".into(),
                        },
                        branch.blocks.iter().map(|b| b.hash).collect(),
                    );
                }
                _ => state.branches.push(branch),
            }
        }
        state.metrics.active_branches = state.branches.len() as u64;
    }

    fn record_event(&self, state: &mut ForkState, event_type: ForkEventType, blocks: Vec<BlockHash>) {
        if state.history.len() >= self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(ForkEvent {
            timestamp: Utc::now(),
            event_type,
            blocks,
        });
    }

    /// Buffered branches
    pub async fn branches(&self) -> Vec<ForkBranch> {
        self.state.lock().await.branches.clone()
    }

    pub async fn stats(&self) -> ForkMetrics {
        self.state.lock().await.metrics.clone()
    }

    /// Recorded fork events, oldest first
    pub async fn history(&self) -> Vec<ForkEvent> {
        self.state.lock().await.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use qnet_ledger::Ledger;

    /// Chain of `len` blocks starting at genesis; `salt` makes branches distinct
    fn build_chain(len: usize, salt: u64) -> Vec<Block> {
        let mut chain = vec![Block::genesis(1_000)];
        for i in 1..len {
            let prev = chain[i - 1].calculate_hash();
            chain.push(Block::new(i as u64, 1_000 + i as u64 + salt * 1_000_000, prev, Vec::new(), Vec::new()));
        }
        chain
    }

    /// Blocks extending `parent` with `count` new blocks
    fn extend(parent: &Block, count: usize, salt: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..count {
            let prev = blocks.last().unwrap_or(parent).calculate_hash();
            let index = parent.index + 1 + i as u64;
            blocks.push(Block::new(index, 5_000 + index + salt * 1_000_000, prev, Vec::new(), Vec::new()));
        }
        blocks
    }

    fn manager(len: usize, rule: ForkChoiceRule) -> (Arc<Ledger>, ChainForkManager) {
        let ledger = Arc::new(Ledger::new());
        ledger.set_chain(build_chain(len, 0)).unwrap();
        let config = ForkConfig {
            rule,
            history_capacity: 8,
            max_branches: 4,
        };
        let manager = ChainForkManager::new(ledger.clone(), &config);
        (ledger, manager)
    }

    async fn feed(manager: &ChainForkManager, blocks: Vec<Block>) {
        for block in blocks {
            manager.detect_fork(block).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_block_on_head_is_not_fork() {
        let (ledger, manager) = manager(3, ForkChoiceRule::LongestChain);
        let next = extend(&ledger.get_last_block().unwrap(), 1, 0).remove(0);
        assert_eq!(manager.detect_fork(next).await.unwrap(), ForkDetection::NoFork);
        assert!(manager.branches().await.is_empty());
    }

    #[tokio::test]
    async fn test_branch_is_buffered_and_extended() {
        let (ledger, manager) = manager(5, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        let mut blocks = extend(&canonical[2], 2, 1).into_iter();

        assert_eq!(manager.detect_fork(blocks.next().unwrap()).await.unwrap(), ForkDetection::NewBranch(1));
        assert_eq!(
            manager.detect_fork(blocks.next().unwrap()).await.unwrap(),
            ForkDetection::ExtendedBranch(1)
        );
        let branches = manager.branches().await;
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].divergence_index, Some(2));
        assert_eq!(branches[0].chain_len(), 5);
        assert!(manager.validate_chain(&branches[0]));
        assert_eq!(manager.stats().await.total_forks, 1);
    }

    #[tokio::test]
    async fn test_longest_branch_wins_alone() {
        let (ledger, manager) = manager(5, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        // Branch lengths N-1, N, N+1 with N = 5
        feed(&manager, extend(&canonical[2], 1, 1)).await;
        feed(&manager, extend(&canonical[2], 2, 2)).await;
        let winner = extend(&canonical[2], 3, 3);
        let winner_tip = winner.last().unwrap().hash;
        feed(&manager, winner).await;

        let resolution = manager.fork_recovery().await.unwrap();
        assert_eq!(
            resolution,
            ForkResolution::Switched {
                branch_id: 3,
                reorg_depth: 2,
                new_length: 6
            }
        );
        assert_eq!(ledger.get_last_block().unwrap().hash, winner_tip);
        assert!(manager.branches().await.is_empty());

        let stats = manager.stats().await;
        assert_eq!(stats.resolutions, 1);
        assert_eq!(stats.max_reorg_depth, 2);
        assert_eq!(stats.active_branches, 0);
    }

    #[tokio::test]
    async fn test_tie_keeps_canonical() {
        let (ledger, manager) = manager(5, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        feed(&manager, extend(&canonical[2], 3, 1)).await;
        feed(&manager, extend(&canonical[3], 2, 2)).await;

        assert_eq!(manager.resolve_fork().await.unwrap(), ForkResolution::KeptCanonical);
        assert_eq!(ledger.get_blocks(), canonical);
        assert_eq!(manager.branches().await.len(), 2);
    }

    #[tokio::test]
    async fn test_equal_length_branch_keeps_canonical() {
        let (ledger, manager) = manager(5, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        feed(&manager, extend(&canonical[2], 2, 1)).await;
        assert_eq!(manager.resolve_fork().await.unwrap(), ForkResolution::KeptCanonical);
        assert_eq!(ledger.get_blocks(), canonical);
    }

    #[tokio::test]
    async fn test_invalid_branches_discarded() {
        let (ledger, manager) = manager(4, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        let mut orphan = extend(&canonical[1], 4, 9);
        orphan[0].prev_hash = [0xee; 32];
        orphan[0].seal();
        feed(&manager, vec![orphan.remove(0)]).await;

        assert_eq!(manager.fork_recovery().await.unwrap(), ForkResolution::KeptCanonical);
        assert!(manager.branches().await.is_empty());
        assert_eq!(ledger.get_blocks(), canonical);

        let stats = manager.stats().await;
        assert_eq!(stats.rejected_branches, 1);
        let history = manager.history().await;
        assert_eq!(history.last().unwrap().event_type, ForkEventType::NoValidAlternative);
    }

    #[tokio::test]
    async fn test_heaviest_chain_rule() {
        let (ledger, manager) = manager(5, ForkChoiceRule::HeaviestChain);
        let canonical = ledger.get_blocks();
        // Two blocks of difficulty 5 outweigh the two canonical blocks they replace
        let mut heavy = Vec::new();
        let mut parent = canonical[2].clone();
        for i in 0..2u64 {
            let mut block = Block::new(parent.index + 1, 9_000 + i, parent.calculate_hash(), Vec::new(), Vec::new());
            block.difficulty = 5;
            block.seal();
            parent = block.clone();
            heavy.push(block);
        }
        feed(&manager, heavy).await;

        assert!(matches!(manager.fork_recovery().await.unwrap(), ForkResolution::Switched { .. }));
        assert_eq!(ledger.get_blocks().len(), 5);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (ledger, manager) = manager(3, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        for salt in 0..20 {
            feed(&manager, extend(&canonical[0], 1, salt + 1)).await;
        }
        assert_eq!(manager.history().await.len(), 8);
        assert_eq!(manager.stats().await.total_forks, 20);
    }

    #[tokio::test]
    async fn test_outweighed_branches_pruned() {
        let (ledger, manager) = manager(5, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        feed(&manager, extend(&canonical[2], 1, 1)).await;
        feed(&manager, extend(&canonical[2], 2, 2)).await;

        assert_eq!(manager.resolve_fork().await.unwrap(), ForkResolution::KeptCanonical);
        let branches = manager.branches().await;
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].id, 2);

        let stats = manager.stats().await;
        assert_eq!(stats.rejected_branches, 1);
        assert_eq!(stats.active_branches, 1);
        assert_eq!(
            manager.history().await.last().unwrap().event_type,
            ForkEventType::BranchRejected {
                branch_id: 1,
                reason: "outweighed by canonical chain".into()
            }
        );
    }

    #[tokio::test]
    async fn test_losing_rivals_do_not_accumulate() {
        let (ledger, manager) = manager(2, ForkChoiceRule::LongestChain);
        for round in 0..50u64 {
            let head = ledger.get_last_block().unwrap();
            let parent = ledger.get_blocks()[head.index as usize - 1].clone();
            let rival = extend(&parent, 1, 100 + round).remove(0);
            ledger.append_block(extend(&head, 1, round).remove(0)).unwrap();

            assert!(matches!(
                manager.detect_fork(rival).await.unwrap(),
                ForkDetection::NewBranch(_)
            ));
            assert_eq!(manager.fork_recovery().await.unwrap(), ForkResolution::KeptCanonical);
            assert!(manager.branches().await.len() <= 1);
        }
        assert_eq!(manager.stats().await.total_forks, 50);
    }

    #[tokio::test]
    async fn test_branch_buffer_capped() {
        let (ledger, manager) = manager(3, ForkChoiceRule::LongestChain);
        let canonical = ledger.get_blocks();
        for salt in 1..=10 {
            feed(&manager, extend(&canonical[0], 1, salt)).await;
        }

        let ids: Vec<u64> = manager.branches().await.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
        let stats = manager.stats().await;
        assert_eq!(stats.total_forks, 10);
        assert_eq!(stats.rejected_branches, 6);
        assert_eq!(stats.active_branches, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detection_sees_concurrent_switch() {
        for _ in 0..50 {
            let (ledger, manager) = manager(5, ForkChoiceRule::LongestChain);
            let manager = Arc::new(manager);
            let canonical = ledger.get_blocks();
            let winner = extend(&canonical[2], 3, 1);
            let next = extend(winner.last().unwrap(), 1, 2).remove(0);
            feed(&manager, winner).await;

            let resolver = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.fork_recovery().await })
            };
            let detection = manager.detect_fork(next).await.unwrap();
            let resolution = resolver.await.unwrap().unwrap();

            assert!(matches!(resolution, ForkResolution::Switched { .. }));
            assert!(
                matches!(detection, ForkDetection::NoFork | ForkDetection::ExtendedBranch(1)),
                "unexpected detection {:?}",
                detection
            );
        }
    }

    proptest! {
        #[test]
        fn prop_branch_valid_iff_links_hold(
            canonical_len in 1usize..6,
            branch_len in 1usize..8,
            corrupt in proptest::option::of(0usize..8),
        ) {
            let canonical = build_chain(canonical_len, 0);
            let index = canonical_len - 1;
            let mut blocks = extend(&canonical[index], branch_len, 7);
            let corrupted = match corrupt {
                Some(pos) if pos < branch_len => {
                    blocks[pos].prev_hash[0] ^= 0x01;
                    true
                }
                _ => false,
            };
            let branch = ForkBranch {
                id: 1,
                divergence_index: Some(index),
                blocks,
                detected_at: Utc::now(),
            };
            prop_assert_eq!(validate_branch(&canonical, &branch), !corrupted);
        }
    }
}
