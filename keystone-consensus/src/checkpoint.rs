//! Per-block checkpoint accumulator
//!
//! Same shape as the quorum accumulator but with no view bucketing: a
//! block becomes stable when 2f+1 distinct members of its active schedule
//! have checkpointed it. The stable checkpoint is attached to the block as
//! an extension exactly once, so replicas that missed the gossip can pick
//! it up from block propagation.

use crate::error::VoteError;
use crate::message::{Checkpoint, StableCheckpoint};
use keystone_chain::{BlockExtension, ChainAdapter, STABLE_CHECKPOINT_EXTENSION};
use keystone_core::{
    decode_seq, encode_seq, CanonicalDecode, CanonicalEncode, CodecError,
};
use keystone_core::{BlockId, BlockNum};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Per-block tally of checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub block_id: BlockId,
    pub block_num: BlockNum,
    pub checkpoints: Vec<Checkpoint>,
    pub is_stable: bool,
}

impl CheckpointState {
    fn new(block_id: BlockId, block_num: BlockNum) -> Self {
        Self {
            block_id,
            block_num,
            checkpoints: Vec::new(),
            is_stable: false,
        }
    }
}

impl CanonicalEncode for CheckpointState {
    fn encode(&self, out: &mut Vec<u8>) {
        self.block_id.encode(out);
        self.block_num.encode(out);
        encode_seq(&self.checkpoints, out);
        self.is_stable.encode(out);
    }
}

impl CanonicalDecode for CheckpointState {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            block_id: BlockId::decode(input)?,
            block_num: BlockNum::decode(input)?,
            checkpoints: decode_seq::<Checkpoint>(input)?,
            is_stable: bool::decode(input)?,
        })
    }
}

#[derive(Default)]
pub struct CheckpointAccumulator {
    records: HashMap<BlockId, CheckpointState>,
    by_num: BTreeSet<(BlockNum, BlockId)>,
    stable_index: BTreeSet<(BlockNum, BlockId)>,
}

impl CheckpointAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &BlockId) -> Option<&CheckpointState> {
        self.records.get(id)
    }

    fn validate(&self, cp: &Checkpoint, chain: &dyn ChainAdapter) -> Result<(), VoteError> {
        if cp.block_num != cp.block_id.block_num() {
            return Err(VoteError::Malformed("block number does not match id prefix"));
        }
        if !cp.verify_signature(&chain.chain_id()) {
            return Err(VoteError::Malformed("bad signature"));
        }
        if cp.block_num <= chain.last_stable_checkpoint_block_num() {
            return Err(VoteError::Stale);
        }
        let block = chain
            .block_state_by_id(&cp.block_id)
            .ok_or(VoteError::UnknownBlock)?;
        if !block.active_schedule.contains(&cp.public_key) {
            return Err(VoteError::OutOfSchedule);
        }
        Ok(())
    }

    /// Record a checkpoint. When the block crosses the threshold, the
    /// stable checkpoint is built, attached to the block as an extension,
    /// and returned so the caller can advance LSCB.
    pub fn add_checkpoint(
        &mut self,
        cp: &Checkpoint,
        chain: &dyn ChainAdapter,
    ) -> Result<Option<StableCheckpoint>, VoteError> {
        self.validate(cp, chain)?;

        let block = chain
            .block_state_by_id(&cp.block_id)
            .ok_or(VoteError::UnknownBlock)?;
        let schedule = &block.active_schedule;

        match self.records.get_mut(&cp.block_id) {
            None => {
                let mut record = CheckpointState::new(cp.block_id, cp.block_num);
                record.checkpoints.push(cp.clone());
                self.by_num.insert((cp.block_num, cp.block_id));
                self.records.insert(cp.block_id, record);
            }
            Some(record) if record.is_stable => return Ok(None),
            Some(record) => {
                let duplicate = record
                    .checkpoints
                    .iter()
                    .any(|e| e.public_key == cp.public_key);
                if !duplicate {
                    record.checkpoints.push(cp.clone());
                }
            }
        }

        let record = self
            .records
            .get_mut(&cp.block_id)
            .expect("record inserted above");

        let mut members: Vec<_> = record
            .checkpoints
            .iter()
            .filter(|c| schedule.contains(&c.public_key))
            .map(|c| c.public_key)
            .collect();
        members.sort();
        members.dedup();

        if record.is_stable || members.len() < schedule.quorum_threshold() {
            return Ok(None);
        }

        record.is_stable = true;
        self.stable_index.insert((record.block_num, record.block_id));
        tracing::info!(
            "block {} is now stable-checkpointed with {} signers",
            record.block_id.short_id(),
            members.len()
        );

        let stable = StableCheckpoint {
            block_id: record.block_id,
            checkpoints: record
                .checkpoints
                .iter()
                .filter(|c| schedule.contains(&c.public_key))
                .cloned()
                .collect(),
        };

        // attach once; a block that already carries the extension keeps it
        let already_attached = chain
            .block_extensions(&stable.block_id)
            .iter()
            .any(|e| e.tag == STABLE_CHECKPOINT_EXTENSION);
        if !already_attached {
            chain.append_block_extension(
                &stable.block_id,
                BlockExtension {
                    tag: STABLE_CHECKPOINT_EXTENSION,
                    payload: stable.encoded(),
                },
            );
        }

        Ok(Some(stable))
    }

    /// The stable checkpoint evidence for a block, if it is stable.
    pub fn stable_checkpoint_for(&self, id: &BlockId) -> Option<StableCheckpoint> {
        let record = self.records.get(id)?;
        if !record.is_stable {
            return None;
        }
        Some(StableCheckpoint {
            block_id: record.block_id,
            checkpoints: record.checkpoints.clone(),
        })
    }

    /// Highest stable block not yet reflected in the chain's LSCB.
    pub fn pending_stable_block(&self, chain: &dyn ChainAdapter) -> Option<(BlockNum, BlockId)> {
        let &(num, id) = self.stable_index.iter().next_back()?;
        if num <= chain.last_stable_checkpoint_block_num() {
            return None;
        }
        Some((num, id))
    }

    /// A stable checkpoint carried by a peer is valid when its checkpoints
    /// all target its block, verify, and cover a quorum of the block's
    /// schedule.
    pub fn is_valid_stable_checkpoint(scp: &StableCheckpoint, chain: &dyn ChainAdapter) -> bool {
        if scp.checkpoints.is_empty() {
            return false;
        }
        let Some(block) = chain.block_state_by_id(&scp.block_id) else {
            return false;
        };
        let schedule = &block.active_schedule;
        for cp in &scp.checkpoints {
            if cp.block_id != scp.block_id
                || cp.block_num != cp.block_id.block_num()
                || !cp.verify_signature(&chain.chain_id())
                || !schedule.contains(&cp.public_key)
            {
                return false;
            }
        }
        let mut signers = scp.signers();
        signers.retain(|key| schedule.contains(key));
        signers.len() >= schedule.quorum_threshold()
    }

    /// Parse a stable checkpoint back out of a block's extensions.
    pub fn stable_checkpoint_from_extension(
        chain: &dyn ChainAdapter,
        id: &BlockId,
    ) -> Option<StableCheckpoint> {
        chain
            .block_extensions(id)
            .iter()
            .find(|e| e.tag == STABLE_CHECKPOINT_EXTENSION)
            .and_then(|e| StableCheckpoint::decode_all(&e.payload).ok())
    }

    /// Drop records strictly below `num`; the record at the LSCB itself
    /// stays retrievable for gossip.
    pub fn prune_below(&mut self, num: BlockNum) {
        let doomed: Vec<(BlockNum, BlockId)> = self
            .by_num
            .range(..(num, BlockId::ZERO))
            .copied()
            .collect();
        for (n, id) in doomed {
            self.by_num.remove(&(n, id));
            self.stable_index.remove(&(n, id));
            self.records.remove(&id);
        }
    }

    pub fn snapshot(&self) -> Vec<CheckpointState> {
        self.by_num
            .iter()
            .filter_map(|(_, id)| self.records.get(id).cloned())
            .collect()
    }

    pub fn restore(records: Vec<CheckpointState>) -> Self {
        let mut acc = Self::new();
        for record in records {
            acc.by_num.insert((record.block_num, record.block_id));
            if record.is_stable {
                acc.stable_index.insert((record.block_num, record.block_id));
            }
            acc.records.insert(record.block_id, record);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_chain::MemoryChain;
    use keystone_core::{ChainId, KeyPair, ProducerSchedule};

    fn keypairs(n: u8) -> Vec<KeyPair> {
        (0..n).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn schedule_of(kps: &[KeyPair]) -> ProducerSchedule {
        ProducerSchedule::new(1, kps.iter().map(|k| k.public_key()).collect())
    }

    fn chain_with_blocks(kps: &[KeyPair], count: u32) -> (MemoryChain, Vec<BlockId>) {
        let chain = MemoryChain::new(ChainId([7; 32]), schedule_of(kps));
        let ids = chain.extend_best_chain(count, &schedule_of(kps));
        (chain, ids)
    }

    fn checkpoint(kp: &KeyPair, block: BlockId, chain: &MemoryChain) -> Checkpoint {
        Checkpoint::signed(block, &chain.chain_id(), kp)
    }

    #[test]
    fn third_of_four_checkpoints_makes_stable() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let mut acc = CheckpointAccumulator::new();

        assert!(acc
            .add_checkpoint(&checkpoint(&kps[0], ids[0], &chain), &chain)
            .unwrap()
            .is_none());
        assert!(acc
            .add_checkpoint(&checkpoint(&kps[1], ids[0], &chain), &chain)
            .unwrap()
            .is_none());
        let stable = acc
            .add_checkpoint(&checkpoint(&kps[2], ids[0], &chain), &chain)
            .unwrap()
            .expect("third checkpoint crosses the threshold");
        assert_eq!(stable.block_id, ids[0]);
        assert_eq!(stable.checkpoints.len(), 3);
        assert!(acc.get(&ids[0]).unwrap().is_stable);
    }

    #[test]
    fn extension_attached_exactly_once() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let mut acc = CheckpointAccumulator::new();

        for kp in &kps {
            let _ = acc.add_checkpoint(&checkpoint(kp, ids[0], &chain), &chain);
        }
        let extensions = chain.block_extensions(&ids[0]);
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].tag, STABLE_CHECKPOINT_EXTENSION);

        let parsed =
            CheckpointAccumulator::stable_checkpoint_from_extension(&chain, &ids[0]).unwrap();
        assert_eq!(parsed.block_id, ids[0]);
        assert!(CheckpointAccumulator::is_valid_stable_checkpoint(
            &parsed, &chain
        ));
    }

    #[test]
    fn duplicate_signer_is_dropped() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let mut acc = CheckpointAccumulator::new();

        acc.add_checkpoint(&checkpoint(&kps[0], ids[0], &chain), &chain)
            .unwrap();
        acc.add_checkpoint(&checkpoint(&kps[0], ids[0], &chain), &chain)
            .unwrap();
        assert_eq!(acc.get(&ids[0]).unwrap().checkpoints.len(), 1);
    }

    #[test]
    fn stale_and_foreign_checkpoints_rejected() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 2);
        chain.advance_lscb(1);
        let mut acc = CheckpointAccumulator::new();

        assert_eq!(
            acc.add_checkpoint(&checkpoint(&kps[0], ids[0], &chain), &chain),
            Err(VoteError::Stale)
        );
        let outsider = KeyPair::from_seed(&[88; 32]);
        assert_eq!(
            acc.add_checkpoint(&checkpoint(&outsider, ids[1], &chain), &chain),
            Err(VoteError::OutOfSchedule)
        );
    }

    #[test]
    fn invalid_stable_checkpoints_rejected() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);

        // not enough signers
        let thin = StableCheckpoint {
            block_id: ids[0],
            checkpoints: vec![
                checkpoint(&kps[0], ids[0], &chain),
                checkpoint(&kps[1], ids[0], &chain),
            ],
        };
        assert!(!CheckpointAccumulator::is_valid_stable_checkpoint(
            &thin, &chain
        ));

        // quorum padded with an out-of-schedule signer
        let outsider = KeyPair::from_seed(&[88; 32]);
        let padded = StableCheckpoint {
            block_id: ids[0],
            checkpoints: vec![
                checkpoint(&kps[0], ids[0], &chain),
                checkpoint(&kps[1], ids[0], &chain),
                checkpoint(&outsider, ids[0], &chain),
            ],
        };
        assert!(!CheckpointAccumulator::is_valid_stable_checkpoint(
            &padded, &chain
        ));
    }

    #[test]
    fn pending_stable_block_and_prune() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 3);
        let mut acc = CheckpointAccumulator::new();

        for kp in &kps[..3] {
            let _ = acc.add_checkpoint(&checkpoint(kp, ids[2], &chain), &chain);
        }
        assert_eq!(acc.pending_stable_block(&chain), Some((3, ids[2])));

        chain.advance_lscb(3);
        assert_eq!(acc.pending_stable_block(&chain), None);

        acc.prune_below(3);
        assert_eq!(acc.len(), 1);
        assert!(acc.stable_checkpoint_for(&ids[2]).is_some());

        let restored = CheckpointAccumulator::restore(acc.snapshot());
        assert!(restored.get(&ids[2]).unwrap().is_stable);
    }
}
