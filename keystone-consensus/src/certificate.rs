//! Certificate construction and validation
//!
//! Certificates package accumulator evidence for transport inside
//! ViewChange and NewView messages. A certificate for block B may carry
//! votes whose own block is a descendant of B: a vote prepares its whole
//! ancestry, so the ancestry check here mirrors the accumulator walk.

use crate::checkpoint::CheckpointAccumulator;
use crate::message::{
    CommittedCertificate, PreparedCertificate, ViewChange, ViewChangedCertificate,
};
use crate::quorum::{PpcmState, QuorumAccumulator};
use crate::view::ViewAccumulator;
use keystone_chain::ChainAdapter;
use keystone_core::{BlockId, ProducerSchedule, PublicKey, ViewNum};
use std::collections::BTreeMap;

/// Builds certificates out of live accumulator state.
pub struct CertificateBuilder<'a> {
    pub chain: &'a dyn ChainAdapter,
    pub quorum: &'a QuorumAccumulator,
    pub views: &'a ViewAccumulator,
}

impl<'a> CertificateBuilder<'a> {
    /// Certificate for the highest prepared block: the prepares of its
    /// winning view, restricted to members of the block's schedule.
    pub fn prepared_certificate(&self) -> Option<PreparedCertificate> {
        let record = self.quorum.highest_prepared()?;
        let schedule = self.chain.active_producers_at(&record.block_id)?;
        let winning = record.prepared_views(&schedule).into_iter().next_back()?;
        let prepares = record
            .prepares
            .iter()
            .filter(|p| p.view == winning && schedule.contains(&p.public_key))
            .cloned()
            .collect();
        Some(PreparedCertificate {
            block_id: record.block_id,
            prepares,
        })
    }

    /// Certificates for every committed block, grouped by fork: each outer
    /// entry is one contiguous committed ancestry, highest block first.
    pub fn committed_certificates(&self) -> Vec<Vec<CommittedCertificate>> {
        let mut pool: Vec<&PpcmState> = self.quorum.committed_records();
        let mut forks = Vec::new();

        while !pool.is_empty() {
            let mut fork = vec![pool.remove(0)];
            loop {
                let tail = fork.last().expect("fork starts non-empty");
                let Some(state) = self.chain.block_state_by_id(&tail.block_id) else {
                    break;
                };
                let Some(pos) = pool.iter().position(|r| r.block_id == state.prev) else {
                    break;
                };
                fork.push(pool.remove(pos));
            }
            let certs: Vec<CommittedCertificate> = fork
                .into_iter()
                .filter_map(|record| self.committed_certificate_for(record))
                .collect();
            if !certs.is_empty() {
                forks.push(certs);
            }
        }
        forks
    }

    fn committed_certificate_for(&self, record: &PpcmState) -> Option<CommittedCertificate> {
        let schedule = self.chain.active_producers_at(&record.block_id)?;
        let winning = record.committed_views(&schedule).into_iter().next_back()?;
        let commits = record
            .commits
            .iter()
            .filter(|c| c.view == winning && schedule.contains(&c.public_key))
            .cloned()
            .collect();
        Some(CommittedCertificate {
            block_id: record.block_id,
            commits,
        })
    }

    /// The view-changes collected for a target view, once it is ready.
    pub fn view_changed_certificate(&self, target: ViewNum) -> Option<ViewChangedCertificate> {
        let record = self.views.get(target)?;
        if !record.should_view_changed {
            return None;
        }
        Some(ViewChangedCertificate {
            view: target,
            view_changes: record.view_changes.clone(),
        })
    }
}

/// True when `descendant` is `ancestor` itself or reachable from it by
/// parent links. Unknown blocks fail the check.
fn extends(chain: &dyn ChainAdapter, descendant: &BlockId, ancestor: &BlockId) -> bool {
    if descendant == ancestor {
        return true;
    }
    let target_num = ancestor.block_num();
    let mut cursor = chain.block_state_by_id(descendant);
    while let Some(block) = cursor {
        if block.num <= target_num {
            return block.id == *ancestor;
        }
        cursor = chain.block_state_by_id(&block.prev);
    }
    false
}

fn single_view_quorum(
    votes: impl Iterator<Item = (ViewNum, PublicKey)>,
    schedule: &ProducerSchedule,
) -> bool {
    let mut counts: BTreeMap<ViewNum, usize> = BTreeMap::new();
    for (view, key) in votes {
        if schedule.contains(&key) {
            *counts.entry(view).or_default() += 1;
        }
    }
    counts
        .values()
        .any(|count| *count >= schedule.quorum_threshold())
}

/// A prepared certificate is valid when every prepare verifies, targets
/// the certified block or a descendant of it, and a single view holds a
/// quorum of the certified block's schedule.
pub fn is_valid_prepared_certificate(
    cert: &PreparedCertificate,
    chain: &dyn ChainAdapter,
) -> bool {
    if cert.prepares.is_empty() {
        return false;
    }
    let Some(schedule) = chain.active_producers_at(&cert.block_id) else {
        return false;
    };
    for p in &cert.prepares {
        if p.block_num != p.block_id.block_num()
            || !p.verify_signature(&chain.chain_id())
            || !extends(chain, &p.block_id, &cert.block_id)
        {
            return false;
        }
    }
    let mut seen: Vec<(ViewNum, PublicKey)> = Vec::new();
    for p in &cert.prepares {
        let tuple = (p.view, p.public_key);
        if seen.contains(&tuple) {
            // duplicate tuples could fake a quorum by repetition
            return false;
        }
        seen.push(tuple);
    }
    single_view_quorum(seen.into_iter(), &schedule)
}

pub fn is_valid_committed_certificate(
    cert: &CommittedCertificate,
    chain: &dyn ChainAdapter,
) -> bool {
    if cert.commits.is_empty() {
        return false;
    }
    let Some(schedule) = chain.active_producers_at(&cert.block_id) else {
        return false;
    };
    for c in &cert.commits {
        if c.block_num != c.block_id.block_num()
            || !c.verify_signature(&chain.chain_id())
            || !extends(chain, &c.block_id, &cert.block_id)
        {
            return false;
        }
    }
    let mut seen: Vec<(ViewNum, PublicKey)> = Vec::new();
    for c in &cert.commits {
        let tuple = (c.view, c.public_key);
        if seen.contains(&tuple) {
            return false;
        }
        seen.push(tuple);
    }
    single_view_quorum(seen.into_iter(), &schedule)
}

/// A view-change is individually valid when its signature verifies and
/// every piece of evidence it carries is itself valid. Schedule
/// membership of the signer is the accumulator's concern.
pub fn is_valid_view_change(vc: &ViewChange, chain: &dyn ChainAdapter) -> bool {
    if !vc.verify_signature(&chain.chain_id()) {
        return false;
    }
    if let Some(cert) = &vc.prepared_cert {
        if !is_valid_prepared_certificate(cert, chain) {
            return false;
        }
    }
    for cert in &vc.committed_certs {
        if !is_valid_committed_certificate(cert, chain) {
            return false;
        }
    }
    if let Some(scp) = &vc.stable_checkpoint {
        if !CheckpointAccumulator::is_valid_stable_checkpoint(scp, chain) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Commit, Prepare};
    use crate::view::ViewAccumulator;
    use keystone_chain::MemoryChain;
    use keystone_core::{ChainId, KeyPair};

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

    fn quorum_with_commits(
        kps: &[KeyPair],
        chain: &MemoryChain,
        blocks: &[BlockId],
    ) -> QuorumAccumulator {
        let mut acc = QuorumAccumulator::new();
        for block in blocks {
            for kp in &kps[..3] {
                acc.add_commit(&Commit::signed(0, *block, &chain.chain_id(), kp), chain)
                    .unwrap();
            }
        }
        acc
    }

    #[test]
    fn prepared_certificate_keeps_only_winning_view() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let mut quorum = QuorumAccumulator::new();

        // a straggler vote from an older view, then a quorum in view 1
        quorum
            .add_prepare(&Prepare::signed(0, ids[0], &chain.chain_id(), &kps[3]), &chain)
            .unwrap();
        for kp in &kps[..3] {
            quorum
                .add_prepare(&Prepare::signed(1, ids[0], &chain.chain_id(), kp), &chain)
                .unwrap();
        }

        let views = ViewAccumulator::new();
        let builder = CertificateBuilder {
            chain: &chain,
            quorum: &quorum,
            views: &views,
        };
        let cert = builder.prepared_certificate().unwrap();
        assert_eq!(cert.block_id, ids[0]);
        assert_eq!(cert.prepares.len(), 3);
        assert!(cert.prepares.iter().all(|p| p.view == 1));
        assert!(is_valid_prepared_certificate(&cert, &chain));
    }

    #[test]
    fn committed_certificates_partition_forks() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 3);
        // sibling of block 3 on a fork
        let fork_tip = chain.append_block_salted(&ids[1], schedule_of(&kps), None, 9);

        let mut quorum = quorum_with_commits(&kps, &chain, &[ids[2], ids[1], ids[0]]);
        for kp in &kps[..3] {
            quorum
                .add_commit(&Commit::signed(0, fork_tip, &chain.chain_id(), kp), &chain)
                .unwrap();
        }

        let views = ViewAccumulator::new();
        let builder = CertificateBuilder {
            chain: &chain,
            quorum: &quorum,
            views: &views,
        };
        let forks = builder.committed_certificates();
        assert_eq!(forks.len(), 2, "sibling committed branch is its own fork");

        // each fork is a contiguous ancestry, highest block first
        for fork in &forks {
            for pair in fork.windows(2) {
                let child = chain.block_state_by_id(&pair[0].block_id).unwrap();
                assert_eq!(child.prev, pair[1].block_id);
            }
        }
        let heads: Vec<BlockId> = forks.iter().map(|f| f[0].block_id).collect();
        assert!(heads.contains(&ids[2]));
        assert!(heads.contains(&fork_tip));

        for fork in &forks {
            for cert in fork {
                assert!(is_valid_committed_certificate(cert, &chain));
            }
        }
    }

    #[test]
    fn descendant_votes_validate_against_ancestor_certificate() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 3);

        // votes for the tip certify the ancestor they walked through
        let prepares: Vec<Prepare> = kps[..3]
            .iter()
            .map(|kp| Prepare::signed(0, ids[2], &chain.chain_id(), kp))
            .collect();
        let cert = PreparedCertificate {
            block_id: ids[0],
            prepares,
        };
        assert!(is_valid_prepared_certificate(&cert, &chain));
    }

    #[test]
    fn mixed_view_certificate_is_invalid() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let cert = PreparedCertificate {
            block_id: ids[0],
            prepares: vec![
                Prepare::signed(0, ids[0], &chain.chain_id(), &kps[0]),
                Prepare::signed(0, ids[0], &chain.chain_id(), &kps[1]),
                Prepare::signed(1, ids[0], &chain.chain_id(), &kps[2]),
            ],
        };
        assert!(!is_valid_prepared_certificate(&cert, &chain));
    }

    #[test]
    fn duplicate_tuples_cannot_fake_a_quorum() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let p = Prepare::signed(0, ids[0], &chain.chain_id(), &kps[0]);
        let cert = PreparedCertificate {
            block_id: ids[0],
            prepares: vec![p.clone(), p.clone(), p],
        };
        assert!(!is_valid_prepared_certificate(&cert, &chain));
    }

    #[test]
    fn empty_certificate_is_invalid() {
        let kps = keypairs(4);
        let (chain, ids) = chain_with_blocks(&kps, 1);
        let cert = PreparedCertificate {
            block_id: ids[0],
            prepares: Vec::new(),
        };
        assert!(!is_valid_prepared_certificate(&cert, &chain));
    }
}
