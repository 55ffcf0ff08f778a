//! Per-block prepare/commit quorum accumulator
//!
//! One `PpcmState` record per block still above the last irreversible
//! block. A vote for a block also counts for every ancestor of that block
//! down to LIB, so the walk in `add_prepare`/`add_commit` appends the vote
//! to each ancestor record until it meets one that is already settled.
//!
//! The quorum rule is bucketed by view: votes from mixed views never
//! combine; a block becomes prepared/committed only when a single view
//! holds 2f+1 distinct members of that block's own active schedule.

use crate::error::VoteError;
use crate::message::{Commit, Prepare};
use keystone_chain::ChainAdapter;
use keystone_core::{
    decode_seq, encode_seq, CanonicalDecode, CanonicalEncode, CodecError,
};
use keystone_core::{BlockId, BlockNum, ProducerSchedule, ViewNum};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Per-block tally of prepares and commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpcmState {
    pub block_id: BlockId,
    pub block_num: BlockNum,
    pub prepares: Vec<Prepare>,
    pub should_prepared: bool,
    pub commits: Vec<Commit>,
    pub should_committed: bool,
}

impl PpcmState {
    fn new(block_id: BlockId, block_num: BlockNum) -> Self {
        Self {
            block_id,
            block_num,
            prepares: Vec::new(),
            should_prepared: false,
            commits: Vec::new(),
            should_committed: false,
        }
    }

    /// Views that reached the quorum of `schedule` members among these
    /// prepares, mixed views kept apart.
    pub fn prepared_views(&self, schedule: &ProducerSchedule) -> Vec<ViewNum> {
        quorum_views(
            self.prepares.iter().map(|p| (p.view, p.public_key)),
            schedule,
        )
    }

    pub fn committed_views(&self, schedule: &ProducerSchedule) -> Vec<ViewNum> {
        quorum_views(
            self.commits.iter().map(|c| (c.view, c.public_key)),
            schedule,
        )
    }
}

fn quorum_views(
    votes: impl Iterator<Item = (ViewNum, keystone_core::PublicKey)>,
    schedule: &ProducerSchedule,
) -> Vec<ViewNum> {
    let mut counts: BTreeMap<ViewNum, usize> = BTreeMap::new();
    for (view, key) in votes {
        if schedule.contains(&key) {
            *counts.entry(view).or_default() += 1;
        }
    }
    let threshold = schedule.quorum_threshold();
    counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(view, _)| view)
        .collect()
}

impl CanonicalEncode for PpcmState {
    fn encode(&self, out: &mut Vec<u8>) {
        self.block_id.encode(out);
        self.block_num.encode(out);
        encode_seq(&self.prepares, out);
        self.should_prepared.encode(out);
        encode_seq(&self.commits, out);
        self.should_committed.encode(out);
    }
}

impl CanonicalDecode for PpcmState {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            block_id: BlockId::decode(input)?,
            block_num: BlockNum::decode(input)?,
            prepares: decode_seq::<Prepare>(input)?,
            should_prepared: bool::decode(input)?,
            commits: decode_seq::<Commit>(input)?,
            should_committed: bool::decode(input)?,
        })
    }
}

/// Owning store of `PpcmState` records with the auxiliary orderings kept
/// in lockstep: by block number, and by flag over block number for O(1)
/// access to the highest prepared/committed block.
#[derive(Default)]
pub struct QuorumAccumulator {
    records: HashMap<BlockId, PpcmState>,
    by_num: BTreeSet<(BlockNum, BlockId)>,
    prepared_index: BTreeSet<(BlockNum, BlockId)>,
    committed_index: BTreeSet<(BlockNum, BlockId)>,
}

impl QuorumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &BlockId) -> Option<&PpcmState> {
        self.records.get(id)
    }

    fn validate_prepare(&self, p: &Prepare, chain: &dyn ChainAdapter) -> Result<(), VoteError> {
        if p.block_num != p.block_id.block_num() {
            return Err(VoteError::Malformed("block number does not match id prefix"));
        }
        if !p.verify_signature(&chain.chain_id()) {
            return Err(VoteError::Malformed("bad signature"));
        }
        if p.block_num <= chain.last_stable_checkpoint_block_num() {
            return Err(VoteError::Stale);
        }
        let block = chain
            .block_state_by_id(&p.block_id)
            .ok_or(VoteError::UnknownBlock)?;
        if !block.active_schedule.contains(&p.public_key) {
            return Err(VoteError::OutOfSchedule);
        }
        Ok(())
    }

    fn validate_commit(&self, c: &Commit, chain: &dyn ChainAdapter) -> Result<(), VoteError> {
        if c.block_num != c.block_id.block_num() {
            return Err(VoteError::Malformed("block number does not match id prefix"));
        }
        if !c.verify_signature(&chain.chain_id()) {
            return Err(VoteError::Malformed("bad signature"));
        }
        if c.block_num <= chain.last_stable_checkpoint_block_num() {
            return Err(VoteError::Stale);
        }
        let block = chain
            .block_state_by_id(&c.block_id)
            .ok_or(VoteError::UnknownBlock)?;
        if !block.active_schedule.contains(&c.public_key) {
            return Err(VoteError::OutOfSchedule);
        }
        Ok(())
    }

    /// Record a prepare for its block and every unsettled ancestor above
    /// LIB. Idempotent per `(signer, view, block)` tuple.
    pub fn add_prepare(&mut self, p: &Prepare, chain: &dyn ChainAdapter) -> Result<(), VoteError> {
        self.validate_prepare(p, chain)?;

        let lib = chain.last_irreversible_block_num();
        let mut cursor = chain.block_state_by_id(&p.block_id);

        while let Some(block) = cursor {
            if block.num <= lib {
                break;
            }
            let schedule = &block.active_schedule;

            match self.records.get_mut(&block.id) {
                None => {
                    let mut record = PpcmState::new(block.id, block.num);
                    record.prepares.push(p.clone());
                    self.by_num.insert((block.num, block.id));
                    self.records.insert(block.id, record);
                }
                Some(record) if record.should_prepared => break,
                Some(record) => {
                    let duplicate = record
                        .prepares
                        .iter()
                        .any(|e| e.public_key == p.public_key && e.view == p.view);
                    if !duplicate {
                        record.prepares.push(p.clone());
                    }
                }
            }

            let record = self
                .records
                .get_mut(&block.id)
                .expect("record inserted above");
            if !record.should_prepared && record.prepares.len() >= schedule.quorum_threshold() {
                if let Some(view) = record.prepared_views(schedule).into_iter().next_back() {
                    record.should_prepared = true;
                    self.prepared_index.insert((block.num, block.id));
                    tracing::debug!(
                        "block {} is now prepared at view {}",
                        block.id.short_id(),
                        view
                    );
                }
            }

            cursor = chain.block_state_by_id(&block.prev);
        }
        Ok(())
    }

    /// Record a commit for its block and every unsettled ancestor above
    /// LIB. Idempotent per `(signer, view, block)` tuple.
    pub fn add_commit(&mut self, c: &Commit, chain: &dyn ChainAdapter) -> Result<(), VoteError> {
        self.validate_commit(c, chain)?;

        let lib = chain.last_irreversible_block_num();
        let mut cursor = chain.block_state_by_id(&c.block_id);

        while let Some(block) = cursor {
            if block.num <= lib {
                break;
            }
            let schedule = &block.active_schedule;

            match self.records.get_mut(&block.id) {
                None => {
                    let mut record = PpcmState::new(block.id, block.num);
                    record.commits.push(c.clone());
                    self.by_num.insert((block.num, block.id));
                    self.records.insert(block.id, record);
                }
                Some(record) if record.should_committed => break,
                Some(record) => {
                    let duplicate = record
                        .commits
                        .iter()
                        .any(|e| e.public_key == c.public_key && e.view == c.view);
                    if !duplicate {
                        record.commits.push(c.clone());
                    }
                }
            }

            let record = self
                .records
                .get_mut(&block.id)
                .expect("record inserted above");
            if !record.should_committed && record.commits.len() >= schedule.quorum_threshold() {
                if let Some(view) = record.committed_views(schedule).into_iter().next_back() {
                    record.should_committed = true;
                    self.committed_index.insert((block.num, block.id));
                    tracing::debug!(
                        "block {} is now committed at view {}",
                        block.id.short_id(),
                        view
                    );
                }
            }

            cursor = chain.block_state_by_id(&block.prev);
        }
        Ok(())
    }

    /// Whether the highest prepared block is actionable: above LIB and not
    /// past the watermark. When it is, the branch is pinned on the chain
    /// as pbft-prepared.
    pub fn should_prepared(
        &self,
        chain: &dyn ChainAdapter,
        watermark: Option<BlockNum>,
    ) -> bool {
        let Some(&(num, id)) = self.prepared_index.iter().next_back() else {
            return false;
        };
        if num <= chain.last_irreversible_block_num() {
            return false;
        }
        if let Some(cap) = watermark {
            if num > cap {
                return false;
            }
        }
        chain.set_pbft_prepared(&id);
        true
    }

    /// Whether the highest committed block is actionable.
    pub fn should_committed(
        &self,
        chain: &dyn ChainAdapter,
        watermark: Option<BlockNum>,
    ) -> bool {
        let Some(&(num, _)) = self.committed_index.iter().next_back() else {
            return false;
        };
        if num <= chain.last_irreversible_block_num() {
            return false;
        }
        if let Some(cap) = watermark {
            if num > cap {
                return false;
            }
        }
        true
    }

    pub fn highest_prepared(&self) -> Option<&PpcmState> {
        let (_, id) = self.prepared_index.iter().next_back()?;
        self.records.get(id)
    }

    pub fn highest_committed(&self) -> Option<&PpcmState> {
        let (_, id) = self.committed_index.iter().next_back()?;
        self.records.get(id)
    }

    /// All committed records, highest block first.
    pub fn committed_records(&self) -> Vec<&PpcmState> {
        self.committed_index
            .iter()
            .rev()
            .filter_map(|(_, id)| self.records.get(id))
            .collect()
    }

    /// The view in which the highest committed block gathered its quorum,
    /// or 0 when nothing is committed. Seeds `current_view` after restart.
    pub fn committed_view(&self, chain: &dyn ChainAdapter) -> ViewNum {
        let Some(record) = self.highest_committed() else {
            return 0;
        };
        let Some(schedule) = chain.active_producers_at(&record.block_id) else {
            return 0;
        };
        record
            .committed_views(&schedule)
            .into_iter()
            .next_back()
            .unwrap_or(0)
    }

    /// Drop every record at or below `num` (the new LSCB).
    pub fn prune_at_or_below(&mut self, num: BlockNum) {
        let doomed: Vec<(BlockNum, BlockId)> = self
            .by_num
            .range(..=(num, BlockId([0xff; 32])))
            .copied()
            .collect();
        for (n, id) in doomed {
            self.by_num.remove(&(n, id));
            self.prepared_index.remove(&(n, id));
            self.committed_index.remove(&(n, id));
            self.records.remove(&id);
        }
    }

    /// Records in block-number order, for persistence.
    pub fn snapshot(&self) -> Vec<PpcmState> {
        self.by_num
            .iter()
            .filter_map(|(_, id)| self.records.get(id).cloned())
            .collect()
    }

    /// Rebuild from persisted records, reconstructing every index.
    pub fn restore(records: Vec<PpcmState>) -> Self {
        let mut acc = Self::new();
        for record in records {
            acc.by_num.insert((record.block_num, record.block_id));
            if record.should_prepared {
                acc.prepared_index.insert((record.block_num, record.block_id));
            }
            if record.should_committed {
                acc.committed_index.insert((record.block_num, record.block_id));
            }
            acc.records.insert(record.block_id, record);
        }
        acc
    }
}
