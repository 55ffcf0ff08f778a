//! Engine composition
//!
//! `ConsensusEngine` owns the three accumulators and the fork-schedule
//! tracker, and is the single place the state machine queries or mutates
//! them. All chain access goes through the adapter handle; every method is
//! synchronous and runs on the event-loop thread.

use crate::certificate::CertificateBuilder;
use crate::checkpoint::{CheckpointAccumulator, CheckpointState};
use crate::error::{NewViewError, VoteError};
use crate::message::{
    Checkpoint, Commit, CommittedCertificate, NewView, Prepare, PreparedCertificate,
    StableCheckpoint, ViewChange, ViewChangedCertificate,
};
use crate::new_view::NewViewValidator;
use crate::quorum::{PpcmState, QuorumAccumulator};
use crate::view::ViewAccumulator;
use crate::watermark::ForkScheduleTracker;
use keystone_chain::ChainAdapter;
use keystone_core::{BlockId, BlockNum, ChainId, PublicKey, SignatureProvider, ViewNum};
use metrics::gauge;
use std::sync::Arc;

pub struct ConsensusEngine {
    chain: Arc<dyn ChainAdapter>,
    pub quorum: QuorumAccumulator,
    pub checkpoints: CheckpointAccumulator,
    pub views: ViewAccumulator,
    pub schedules: ForkScheduleTracker,
}

impl ConsensusEngine {
    pub fn new(chain: Arc<dyn ChainAdapter>) -> Self {
        Self {
            chain,
            quorum: QuorumAccumulator::new(),
            checkpoints: CheckpointAccumulator::new(),
            views: ViewAccumulator::new(),
            schedules: ForkScheduleTracker::new(),
        }
    }

    pub fn chain(&self) -> &dyn ChainAdapter {
        self.chain.as_ref()
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain.chain_id()
    }

    pub fn watermark(&self) -> Option<BlockNum> {
        self.schedules.current_watermark()
    }

    // --- intake ---------------------------------------------------------

    pub fn add_prepare(&mut self, p: &Prepare) -> Result<(), VoteError> {
        self.quorum.add_prepare(p, self.chain.as_ref())
    }

    pub fn add_commit(&mut self, c: &Commit) -> Result<(), VoteError> {
        self.quorum.add_commit(c, self.chain.as_ref())
    }

    pub fn add_view_change(
        &mut self,
        vc: &ViewChange,
        current_view: ViewNum,
    ) -> Result<(), VoteError> {
        self.views
            .add_view_change(vc, current_view, self.chain.as_ref())
    }

    pub fn add_checkpoint(
        &mut self,
        cp: &Checkpoint,
    ) -> Result<Option<StableCheckpoint>, VoteError> {
        self.checkpoints.add_checkpoint(cp, self.chain.as_ref())
    }

    // --- predicates -----------------------------------------------------

    pub fn should_prepared(&self) -> bool {
        self.quorum
            .should_prepared(self.chain.as_ref(), self.watermark())
    }

    pub fn should_committed(&self) -> bool {
        self.quorum
            .should_committed(self.chain.as_ref(), self.watermark())
    }

    pub fn should_view_change(&self) -> Option<ViewNum> {
        self.views.should_view_change(self.chain.as_ref())
    }

    pub fn should_new_view(&self, target: ViewNum) -> bool {
        self.views.should_new_view(target)
    }

    pub fn new_view_primary_key(&self, target: ViewNum) -> Option<PublicKey> {
        self.chain.lscb_active_producers().primary_for(target)
    }

    /// Whether one of our signature providers is the primary of `target`.
    pub fn is_new_primary(&self, target: ViewNum) -> bool {
        let Some(primary) = self.new_view_primary_key(target) else {
            return false;
        };
        self.chain
            .my_signature_providers()
            .iter()
            .any(|p| p.public_key() == primary)
    }

    pub fn provider_for(&self, key: &PublicKey) -> Option<Arc<dyn SignatureProvider>> {
        self.chain
            .my_signature_providers()
            .into_iter()
            .find(|p| p.public_key() == *key)
    }

    /// A message should be emitted only when one of our keys is in the
    /// LSCB schedule or an upcoming fork schedule.
    pub fn should_send(&self) -> bool {
        let schedule = self.chain.lscb_active_producers();
        self.chain.my_signature_providers().iter().any(|p| {
            let key = p.public_key();
            schedule.contains(&key) || self.schedules.is_upcoming_producer(&key)
        })
    }

    /// Messages are accepted from LSCB schedule members and upcoming
    /// producers only.
    pub fn should_recv(&self, key: &PublicKey) -> bool {
        self.chain.lscb_active_producers().contains(key) || self.schedules.is_upcoming_producer(key)
    }

    pub fn committed_view(&self) -> ViewNum {
        self.quorum.committed_view(self.chain.as_ref())
    }

    // --- certificates ---------------------------------------------------

    fn builder(&self) -> CertificateBuilder<'_> {
        CertificateBuilder {
            chain: self.chain.as_ref(),
            quorum: &self.quorum,
            views: &self.views,
        }
    }

    pub fn prepared_certificate(&self) -> Option<PreparedCertificate> {
        self.builder().prepared_certificate()
    }

    pub fn committed_certificates(&self) -> Vec<Vec<CommittedCertificate>> {
        self.builder().committed_certificates()
    }

    pub fn view_changed_certificate(&self, target: ViewNum) -> Option<ViewChangedCertificate> {
        self.builder().view_changed_certificate(target)
    }

    /// The stable checkpoint evidence at the current LSCB, from the
    /// accumulator or, failing that, the block extension.
    pub fn latest_stable_checkpoint(&self) -> Option<StableCheckpoint> {
        let lscb = self.chain.last_stable_checkpoint_block_num();
        if lscb == 0 {
            return None;
        }
        let block = self.chain.block_state_by_num(lscb)?;
        self.checkpoints
            .stable_checkpoint_for(&block.id)
            .or_else(|| {
                CheckpointAccumulator::stable_checkpoint_from_extension(
                    self.chain.as_ref(),
                    &block.id,
                )
            })
    }

    // --- signing --------------------------------------------------------

    /// One prepare per provider key in the block's active schedule.
    pub fn sign_prepares(&self, view: ViewNum, block_id: BlockId) -> Vec<Prepare> {
        let Some(schedule) = self.chain.active_producers_at(&block_id) else {
            return Vec::new();
        };
        self.chain
            .my_signature_providers()
            .iter()
            .filter(|p| schedule.contains(&p.public_key()))
            .map(|p| Prepare::signed(view, block_id, &self.chain.chain_id(), p.as_ref()))
            .collect()
    }

    pub fn sign_commits(&self, view: ViewNum, block_id: BlockId) -> Vec<Commit> {
        let Some(schedule) = self.chain.active_producers_at(&block_id) else {
            return Vec::new();
        };
        self.chain
            .my_signature_providers()
            .iter()
            .filter(|p| schedule.contains(&p.public_key()))
            .map(|p| Commit::signed(view, block_id, &self.chain.chain_id(), p.as_ref()))
            .collect()
    }

    /// One view-change per provider key in the LSCB schedule, voting to
    /// abandon `target - 1`.
    pub fn sign_view_changes(
        &self,
        target: ViewNum,
        prepared_cert: Option<PreparedCertificate>,
        committed_certs: Vec<CommittedCertificate>,
        stable_checkpoint: Option<StableCheckpoint>,
    ) -> Vec<ViewChange> {
        let schedule = self.chain.lscb_active_producers();
        self.chain
            .my_signature_providers()
            .iter()
            .filter(|p| schedule.contains(&p.public_key()))
            .map(|p| {
                ViewChange::signed(
                    target - 1,
                    prepared_cert.clone(),
                    committed_certs.clone(),
                    stable_checkpoint.clone(),
                    &self.chain.chain_id(),
                    p.as_ref(),
                )
            })
            .collect()
    }

    /// Sign a checkpoint for the highest committed-but-not-stable block,
    /// one per in-schedule provider, and add them locally.
    pub fn generate_checkpoints(&mut self) -> Vec<Checkpoint> {
        let lscb = self.chain.last_stable_checkpoint_block_num();
        let Some((block_id, block_num)) = self
            .quorum
            .highest_committed()
            .map(|r| (r.block_id, r.block_num))
        else {
            return Vec::new();
        };
        if block_num <= lscb {
            return Vec::new();
        }
        if self
            .checkpoints
            .get(&block_id)
            .map(|r| r.is_stable)
            .unwrap_or(false)
        {
            return Vec::new();
        }
        let Some(schedule) = self.chain.active_producers_at(&block_id) else {
            return Vec::new();
        };

        let providers: Vec<_> = self
            .chain
            .my_signature_providers()
            .into_iter()
            .filter(|p| schedule.contains(&p.public_key()))
            .collect();

        let chain_id = self.chain.chain_id();
        let mut out = Vec::new();
        for provider in providers {
            let cp = Checkpoint::signed(block_id, &chain_id, provider.as_ref());
            match self.add_checkpoint(&cp) {
                Ok(_) => out.push(cp),
                Err(err) => {
                    tracing::debug!("own checkpoint not recorded: {}", err);
                }
            }
        }
        out
    }

    // --- new view -------------------------------------------------------

    pub fn validate_new_view(&self, nv: &NewView) -> Result<(), NewViewError> {
        NewViewValidator {
            chain: self.chain.as_ref(),
            views: &self.views,
        }
        .validate(nv)
    }

    /// Install the evidence a validated NewView carries. Re-adding
    /// messages already present is harmless; the accumulators dedup.
    pub fn apply_new_view(&mut self, nv: &NewView) {
        if let Some(cert) = &nv.prepared_cert {
            for p in &cert.prepares {
                let _ = self.add_prepare(p);
            }
        }
        for cert in &nv.committed_certs {
            for c in &cert.commits {
                let _ = self.add_commit(c);
            }
        }
        if let Some(scp) = &nv.stable_checkpoint {
            for cp in &scp.checkpoints {
                let _ = self.add_checkpoint(cp);
            }
            self.checkpoint_local();
        }
    }

    // --- lifecycle ------------------------------------------------------

    /// Advance LSCB to the highest stable checkpoint and prune everything
    /// that fell behind it.
    pub fn checkpoint_local(&mut self) {
        if let Some((num, id)) = self.checkpoints.pending_stable_block(self.chain.as_ref()) {
            tracing::info!("advancing lscb to block {} ({})", num, id.short_id());
            self.chain.advance_lscb(num);
        }
        let lscb = self.chain.last_stable_checkpoint_block_num();
        self.quorum.prune_at_or_below(lscb);
        self.checkpoints.prune_below(lscb);
        self.schedules.prune_at_or_below(lscb);
    }

    /// Track schedule promotions carried by a new block.
    pub fn observe_block(&mut self, id: &BlockId) {
        let Some(state) = self.chain.block_state_by_id(id) else {
            return;
        };
        let lscb_schedule = self.chain.lscb_active_producers();
        self.schedules.observe_block(&state, &lscb_schedule);
    }

    pub fn restore_quorum(&mut self, records: Vec<PpcmState>) {
        self.quorum = QuorumAccumulator::restore(records);
    }

    pub fn restore_checkpoints(&mut self, records: Vec<CheckpointState>) {
        self.checkpoints = CheckpointAccumulator::restore(records);
    }

    pub fn record_gauges(&self) {
        gauge!("pbft.quorum_records").set(self.quorum.len() as f64);
        gauge!("pbft.checkpoint_records").set(self.checkpoints.len() as f64);
        gauge!("pbft.view_records").set(self.views.len() as f64);
        gauge!("pbft.lscb").set(self.chain.last_stable_checkpoint_block_num() as f64);
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

    fn engine_with_providers(
        kps: &[KeyPair],
        providers: &[KeyPair],
        blocks: u32,
    ) -> (ConsensusEngine, Vec<BlockId>) {
        let chain = MemoryChain::new(ChainId([7; 32]), schedule_of(kps));
        let ids = chain.extend_best_chain(blocks, &schedule_of(kps));
        for kp in providers {
            chain.add_provider(Arc::new(kp.clone()));
        }
        (ConsensusEngine::new(Arc::new(chain)), ids)
    }

    #[test]
    fn should_send_requires_an_in_schedule_provider() {
        let kps = keypairs(4);
        let (engine, _) = engine_with_providers(&kps, &kps[..1], 1);
        assert!(engine.should_send());

        let outsider = KeyPair::from_seed(&[50; 32]);
        let (engine, _) = engine_with_providers(&kps, &[outsider], 1);
        assert!(!engine.should_send());

        let (engine, _) = engine_with_providers(&kps, &[], 1);
        assert!(!engine.should_send());
    }

    #[test]
    fn should_recv_covers_schedule_members() {
        let kps = keypairs(4);
        let (engine, _) = engine_with_providers(&kps, &[], 1);
        assert!(engine.should_recv(&kps[0].public_key()));
        assert!(!engine.should_recv(&KeyPair::from_seed(&[51; 32]).public_key()));
    }

    #[test]
    fn multi_key_checkpoint_generation_reaches_stability() {
        let kps = keypairs(4);
        // this node holds three producer keys
        let (mut engine, ids) = engine_with_providers(&kps, &kps[..3], 2);

        // make block 2 committed
        for kp in &kps[..3] {
            let c = Commit::signed(0, ids[1], &engine.chain_id(), kp);
            engine.add_commit(&c).unwrap();
        }
        assert!(engine.should_committed());

        let emitted = engine.generate_checkpoints();
        assert_eq!(emitted.len(), 3, "one checkpoint per in-schedule key");

        engine.checkpoint_local();
        assert_eq!(engine.chain().last_stable_checkpoint_block_num(), 2);
        // quorum records at or below the new lscb are gone
        assert!(engine.quorum.is_empty());
        // a second generation pass has nothing left to checkpoint
        assert!(engine.generate_checkpoints().is_empty());
    }

    #[test]
    fn primary_rotation_and_provider_lookup() {
        let kps = keypairs(4);
        let (engine, _) = engine_with_providers(&kps, &kps[1..2], 1);
        assert_eq!(engine.new_view_primary_key(1), Some(kps[1].public_key()));
        assert!(engine.is_new_primary(1));
        assert!(!engine.is_new_primary(2));
        assert!(engine.provider_for(&kps[1].public_key()).is_some());
        assert!(engine.provider_for(&kps[0].public_key()).is_none());
    }
}
