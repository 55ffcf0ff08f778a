//! End-to-end protocol scenarios over a four-replica (and one 21-replica)
//! cluster. Every replica runs its own engine and state machine against
//! its own copy of the chain; "gossip" is the test moving outgoing
//! messages between them.

use keystone_chain::{ChainAdapter, MemoryChain};
use keystone_consensus::{
    persistence, Commit, ConsensusEngine, NewView, NewViewError, Outgoing, Prepare,
    ReplicaState, ReplicaStateMachine, ViewChange, ViewChangedCertificate,
};
use keystone_core::{BlockId, ChainId, KeyPair, ProducerSchedule};
use std::sync::Arc;

fn keypairs(n: u8) -> Vec<KeyPair> {
    (0..n).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
}

fn schedule_of(kps: &[KeyPair]) -> ProducerSchedule {
    ProducerSchedule::new(1, kps.iter().map(|k| k.public_key()).collect())
}

struct Replica {
    chain: Arc<MemoryChain>,
    engine: ConsensusEngine,
    machine: ReplicaStateMachine,
}

impl Replica {
    /// Chains are rebuilt per replica from the same seeds, so every
    /// replica sees identical block ids.
    fn new(kps: &[KeyPair], provider: Option<&KeyPair>, blocks: u32) -> Self {
        let chain = Arc::new(MemoryChain::new(ChainId([7; 32]), schedule_of(kps)));
        chain.extend_best_chain(blocks, &schedule_of(kps));
        if let Some(kp) = provider {
            chain.add_provider(Arc::new(kp.clone()));
        }
        Replica {
            engine: ConsensusEngine::new(chain.clone()),
            machine: ReplicaStateMachine::new(6, 0, true),
            chain,
        }
    }
}

fn prepares_of(out: &[Outgoing]) -> Vec<Prepare> {
    out.iter()
        .filter_map(|o| match o {
            Outgoing::Prepare(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn commits_of(out: &[Outgoing]) -> Vec<Commit> {
    out.iter()
        .filter_map(|o| match o {
            Outgoing::Commit(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

mod clean_round {
    use super::*;

    /// Scenario: four honest replicas prepare and commit block 10.
    #[test]
    fn four_replicas_prepare_then_commit() {
        let kps = keypairs(4);
        let mut replicas: Vec<Replica> = kps
            .iter()
            .map(|kp| Replica::new(&kps, Some(kp), 10))
            .collect();
        let block_10 = replicas[0].chain.head_block_id();
        assert_eq!(block_10.block_num(), 10);

        // everyone prepares the head
        let mut wire: Vec<Prepare> = Vec::new();
        for r in &mut replicas {
            let out = r.machine.send_prepare(&mut r.engine);
            wire.extend(prepares_of(&out));
        }
        assert_eq!(wire.len(), 4);

        for (i, r) in replicas.iter_mut().enumerate() {
            for p in wire.iter().filter(|p| p.public_key != kps[i].public_key()) {
                r.machine.on_prepare(p, &mut r.engine).unwrap();
            }
            assert!(r.engine.should_prepared(), "replica {} must see the quorum", i);
        }

        // the prepared branch is pinned exactly once per replica
        for r in &replicas {
            assert_eq!(r.chain.get_pbft_prepared(), Some(block_10));
            assert_eq!(r.chain.pbft_prepared_history(), vec![block_10]);
        }

        // everyone commits the prepared block
        let mut wire: Vec<Commit> = Vec::new();
        for r in &mut replicas {
            let out = r.machine.send_commit(&mut r.engine);
            wire.extend(commits_of(&out));
        }
        assert_eq!(wire.len(), 4);

        for (i, r) in replicas.iter_mut().enumerate() {
            for c in wire.iter().filter(|c| c.public_key != kps[i].public_key()) {
                r.machine.on_commit(c, &mut r.engine).unwrap();
            }
            assert!(r.engine.should_committed(), "replica {} must commit", i);
            assert_eq!(r.machine.state(), ReplicaState::Committed);
        }
    }

    /// Scenario: three prepares in view 0 and one in view 1. The quorum
    /// exists in view 0 alone; the mixed total of four is irrelevant.
    #[test]
    fn mixed_views_do_not_combine() {
        let kps = keypairs(4);
        let mut replica = Replica::new(&kps, None, 10);
        let block = replica.chain.head_block_id();
        let cid = replica.chain.chain_id();

        replica
            .machine
            .on_prepare(&Prepare::signed(0, block, &cid, &kps[0]), &mut replica.engine)
            .unwrap();
        replica
            .machine
            .on_prepare(&Prepare::signed(1, block, &cid, &kps[3]), &mut replica.engine)
            .unwrap();
        replica
            .machine
            .on_prepare(&Prepare::signed(0, block, &cid, &kps[1]), &mut replica.engine)
            .unwrap();
        assert!(
            !replica.engine.should_prepared(),
            "two at view 0 plus one at view 1 is not a quorum"
        );

        replica
            .machine
            .on_prepare(&Prepare::signed(0, block, &cid, &kps[2]), &mut replica.engine)
            .unwrap();
        assert!(replica.engine.should_prepared(), "view 0 reached three alone");
    }
}

mod view_change {
    use super::*;

    fn bare_view_change(kp: &KeyPair, current_view: u32, chain: &MemoryChain) -> ViewChange {
        ViewChange::signed(current_view, None, Vec::new(), None, &chain.chain_id(), kp)
    }

    /// Scenario: the f+1 wake-up. R0 (primary of view 1) sees two peers
    /// changing views, joins, completes the quorum and emits a NewView a
    /// passive observer accepts.
    #[test]
    fn wakeup_to_new_view_accepted_by_observer() {
        let kps = keypairs(4);
        // primary(1) = schedule[1]
        let mut primary = Replica::new(&kps, Some(&kps[1]), 5);

        let vc_a = bare_view_change(&kps[2], 0, &primary.chain);
        let out = primary
            .machine
            .on_view_change(&vc_a, &mut primary.engine)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(primary.machine.state(), ReplicaState::Prepared);

        let vc_b = bare_view_change(&kps[3], 0, &primary.chain);
        let out = primary
            .machine
            .on_view_change(&vc_b, &mut primary.engine)
            .unwrap();

        // joined with its own view-change, then immediately led the view
        assert!(out
            .iter()
            .any(|o| matches!(o, Outgoing::ViewChange(vc) if vc.target_view() == 1)));
        let nv = out
            .iter()
            .find_map(|o| match o {
                Outgoing::NewView(nv) => Some(nv.clone()),
                _ => None,
            })
            .expect("primary emits the new-view");
        assert_eq!(primary.machine.current_view(), 1);
        assert_eq!(primary.machine.state(), ReplicaState::Prepared);

        // a passive observer that saw the same view-changes accepts it
        let mut observer = Replica::new(&kps, None, 5);
        for vc in &nv.view_changed_cert.view_changes {
            let _ = observer.machine.on_view_change(vc, &mut observer.engine);
        }
        observer
            .machine
            .on_new_view(&nv, &mut observer.engine)
            .unwrap();
        assert_eq!(observer.machine.current_view(), 1);
    }

    /// Scenario: a NewView whose certificate includes an out-of-schedule
    /// signer. Raw count is three but only two are members; clause 4
    /// rejects it.
    #[test]
    fn padded_certificate_fails_member_quorum() {
        let kps = keypairs(4);
        let observer = Replica::new(&kps, None, 5);
        let outsider = KeyPair::from_seed(&[99; 32]);
        let cid = observer.chain.chain_id();

        let mut view_changes: Vec<ViewChange> = kps[2..4]
            .iter()
            .map(|kp| bare_view_change(kp, 0, &observer.chain))
            .collect();
        view_changes.push(ViewChange::signed(
            0,
            None,
            Vec::new(),
            None,
            &cid,
            &outsider,
        ));

        let primary = &kps[1];
        let nv = NewView::signed(
            1,
            None,
            Vec::new(),
            None,
            ViewChangedCertificate {
                view: 1,
                view_changes,
            },
            &cid,
            primary,
        );
        assert_eq!(
            observer.engine.validate_new_view(&nv),
            Err(NewViewError::InsufficientQuorum { have: 2, need: 3 })
        );
    }
}

mod stable_checkpoints {
    use super::*;
    use keystone_consensus::Checkpoint;
    use keystone_chain::STABLE_CHECKPOINT_EXTENSION;

    /// Scenario: block 100 collects three checkpoints and becomes stable;
    /// the block extension is appended exactly once even when a fourth
    /// checkpoint trails in.
    #[test]
    fn promotion_at_block_100() {
        let kps = keypairs(4);
        let mut replica = Replica::new(&kps, None, 100);
        let block_100 = replica.chain.head_block_id();
        let cid = replica.chain.chain_id();

        for kp in &kps[..3] {
            replica
                .engine
                .add_checkpoint(&Checkpoint::signed(block_100, &cid, kp))
                .unwrap();
        }
        let record = replica.engine.checkpoints.get(&block_100).unwrap();
        assert!(record.is_stable);

        replica.engine.checkpoint_local();
        assert_eq!(replica.chain.last_stable_checkpoint_block_num(), 100);

        // the straggler changes nothing
        let _ = replica
            .engine
            .add_checkpoint(&Checkpoint::signed(block_100, &cid, &kps[3]));
        let extensions = replica.chain.block_extensions(&block_100);
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].tag, STABLE_CHECKPOINT_EXTENSION);
    }
}

mod snapshots {
    use super::*;

    /// Scenario: an engine with prepares and commits spread over ten
    /// blocks survives a close/reopen bit-for-bit.
    #[test]
    fn snapshot_round_trip_preserves_decisions() {
        let kps = keypairs(21);
        let mut replica = Replica::new(&kps, None, 10);
        let cid = replica.chain.chain_id();

        let blocks: Vec<BlockId> = (1..=10)
            .map(|n| replica.chain.block_state_by_num(n).unwrap().id)
            .collect();

        // ten prepares and five commits per block, rotating signer sets
        for (i, block) in blocks.iter().enumerate() {
            for k in 0..10 {
                let kp = &kps[(i + k) % kps.len()];
                replica
                    .machine
                    .on_prepare(&Prepare::signed(0, *block, &cid, kp), &mut replica.engine)
                    .unwrap();
            }
            for k in 0..5 {
                let kp = &kps[(i + k) % kps.len()];
                replica
                    .machine
                    .on_commit(&Commit::signed(0, *block, &cid, kp), &mut replica.engine)
                    .unwrap();
            }
        }

        let dir = std::env::temp_dir().join(format!(
            "keystone-scenario-snapshot-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        persistence::store_quorum(&dir, &replica.engine.quorum.snapshot(), 7).unwrap();

        let (records, view) = persistence::load_quorum(&dir).unwrap().unwrap();
        assert_eq!(view, 7);
        let mut restored = Replica::new(&kps, None, 10);
        restored.engine.restore_quorum(records);
        restored.machine.set_current_view(view);

        for block in &blocks {
            assert_eq!(
                restored.engine.quorum.get(block),
                replica.engine.quorum.get(block),
                "record for {} must survive the round trip",
                block.short_id()
            );
        }
        assert_eq!(
            restored.engine.should_prepared(),
            replica.engine.should_prepared()
        );
        assert_eq!(
            restored.engine.should_committed(),
            replica.engine.should_committed()
        );
        assert_eq!(restored.machine.current_view(), 7);

        // accepts and rejects the same messages as the original
        let dup = Prepare::signed(0, blocks[9], &cid, &kps[9]);
        let a = replica.engine.add_prepare(&dup);
        let b = restored.engine.add_prepare(&dup);
        assert_eq!(a, b);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
