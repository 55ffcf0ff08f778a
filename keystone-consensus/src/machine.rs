//! Replica state machine
//!
//! A tagged variant drives the replica through prepared, committed and
//! view-changing in response to incoming messages and timer ticks. The
//! machine owns the message caches and `current_view`; every outgoing
//! message is added to the local accumulator exactly once before it is
//! handed back for broadcast.

use crate::engine::ConsensusEngine;
use crate::error::{NewViewError, VoteError};
use crate::message::{
    Commit, CommittedCertificate, NewView, Prepare, PreparedCertificate, ViewChange,
    ViewChangedCertificate,
};
use crate::new_view::reconstruct_evidence;
use keystone_core::ViewNum;
use metrics::counter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Prepared,
    Committed,
    ViewChanging { target_view: ViewNum },
}

impl ReplicaState {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaState::Prepared => "prepared",
            ReplicaState::Committed => "committed",
            ReplicaState::ViewChanging { .. } => "view-changing",
        }
    }
}

/// Messages produced by a transition, to be published on the outgoing
/// streams by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Prepare(Prepare),
    Commit(Commit),
    ViewChange(ViewChange),
    NewView(NewView),
}

/// Own recently-emitted messages and installed certificates. Cached so
/// re-emission can re-sign with a fresh envelope instead of gossiping
/// stale copies.
#[derive(Debug, Default)]
pub struct MessageCache {
    pub prepares: Vec<Prepare>,
    pub commits: Vec<Commit>,
    pub view_changes: Vec<ViewChange>,
    pub prepared_cert: Option<PreparedCertificate>,
    pub committed_certs: Vec<Vec<CommittedCertificate>>,
    pub view_changed_cert: Option<ViewChangedCertificate>,
}

pub struct ReplicaStateMachine {
    state: ReplicaState,
    current_view: ViewNum,
    view_change_timeout: u32,
    /// A non-candidate replica validates everything but signs nothing.
    bp_candidate: bool,
    target_view_retries: u32,
    view_change_timer: u32,
    cache: MessageCache,
}

impl ReplicaStateMachine {
    pub fn new(view_change_timeout: u32, initial_view: ViewNum, bp_candidate: bool) -> Self {
        Self {
            state: ReplicaState::Prepared,
            current_view: initial_view,
            view_change_timeout,
            bp_candidate,
            target_view_retries: 0,
            view_change_timer: 0,
            cache: MessageCache::default(),
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn current_view(&self) -> ViewNum {
        self.current_view
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Override the view, e.g. from a restored snapshot.
    pub fn set_current_view(&mut self, view: ViewNum) {
        self.current_view = view;
    }

    /// The chain made progress; a replica not already changing views has
    /// no reason to keep its stall timer running.
    pub fn note_progress(&mut self) {
        if !matches!(self.state, ReplicaState::ViewChanging { .. }) {
            self.view_change_timer = 0;
        }
    }

    // --- incoming messages ----------------------------------------------

    pub fn on_prepare(
        &mut self,
        p: &Prepare,
        engine: &mut ConsensusEngine,
    ) -> Result<(), VoteError> {
        engine.add_prepare(p)
    }

    pub fn on_commit(
        &mut self,
        c: &Commit,
        engine: &mut ConsensusEngine,
    ) -> Result<(), VoteError> {
        engine.add_commit(c)?;
        self.maybe_transit_committed(engine);
        Ok(())
    }

    pub fn on_view_change(
        &mut self,
        vc: &ViewChange,
        engine: &mut ConsensusEngine,
    ) -> Result<Vec<Outgoing>, VoteError> {
        engine.add_view_change(vc, self.current_view)?;

        let mut out = Vec::new();
        if !matches!(self.state, ReplicaState::ViewChanging { .. }) {
            if let Some(target) = engine.should_view_change() {
                out.extend(self.transit_to_view_changing(target, engine));
            }
        }
        if let Some(nv) = self.maybe_emit_new_view(engine) {
            out.push(Outgoing::NewView(nv));
        }
        Ok(out)
    }

    /// A NewView for a view at or below ours is stale noise; anything else
    /// must pass full validation before any local state moves.
    pub fn on_new_view(
        &mut self,
        nv: &NewView,
        engine: &mut ConsensusEngine,
    ) -> Result<(), NewViewError> {
        if nv.view <= self.current_view {
            return Ok(());
        }
        engine.validate_new_view(nv)?;
        self.install_new_view(nv, engine);
        Ok(())
    }

    // --- emission -------------------------------------------------------

    /// Emit prepares for the reserved block, or the watermark-capped head.
    pub fn send_prepare(&mut self, engine: &mut ConsensusEngine) -> Vec<Outgoing> {
        if !self.bp_candidate || matches!(self.state, ReplicaState::ViewChanging { .. }) {
            return Vec::new();
        }

        let chain = engine.chain();
        let lib = chain.last_irreversible_block_num();
        // keep preparing the same block while it still extends LIB on the
        // best chain
        let reserved = chain.get_pbft_my_prepare().filter(|mp| {
            mp.block_num() > lib
                && chain.block_state_by_num(mp.block_num()).map(|b| b.id) == Some(*mp)
        });
        let target = match reserved {
            Some(mp) => mp,
            None => {
                let head = chain.head_block_num();
                if head == 0 {
                    return Vec::new();
                }
                let capped = engine.watermark().map_or(head, |w| w.min(head));
                let Some(block) = engine.chain().block_state_by_num(capped) else {
                    return Vec::new();
                };
                block.id
            }
        };

        let prepares = engine.sign_prepares(self.current_view, target);
        if prepares.is_empty() {
            return Vec::new();
        }
        engine.chain().set_pbft_my_prepare(&target);

        let mut out = Vec::new();
        for p in &prepares {
            match engine.add_prepare(p) {
                Ok(()) => out.push(Outgoing::Prepare(p.clone())),
                Err(err) => tracing::debug!("own prepare not recorded: {}", err),
            }
        }
        self.cache.prepares = prepares;
        out
    }

    /// Emit commits for the highest prepared block, once there is one.
    pub fn send_commit(&mut self, engine: &mut ConsensusEngine) -> Vec<Outgoing> {
        if !self.bp_candidate || matches!(self.state, ReplicaState::ViewChanging { .. }) {
            return Vec::new();
        }
        if !engine.should_prepared() {
            return Vec::new();
        }
        let Some(block_id) = engine.quorum.highest_prepared().map(|r| r.block_id) else {
            return Vec::new();
        };

        let commits = engine.sign_commits(self.current_view, block_id);
        if commits.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for c in &commits {
            match engine.add_commit(c) {
                Ok(()) => out.push(Outgoing::Commit(c.clone())),
                Err(err) => tracing::debug!("own commit not recorded: {}", err),
            }
        }
        self.cache.commits = commits;
        self.maybe_transit_committed(engine);
        out
    }

    /// Build, record and emit view-changes for the current target view.
    pub fn send_view_change(&mut self, engine: &mut ConsensusEngine) -> Vec<Outgoing> {
        let ReplicaState::ViewChanging { target_view } = self.state else {
            return Vec::new();
        };
        if !self.bp_candidate {
            return Vec::new();
        }

        let prepared = engine.prepared_certificate();
        let committed_forks = engine.committed_certificates();
        let committed_flat: Vec<CommittedCertificate> =
            committed_forks.iter().flatten().cloned().collect();
        let stable = engine.latest_stable_checkpoint();
        self.cache.prepared_cert = prepared.clone();
        self.cache.committed_certs = committed_forks;

        let view_changes =
            engine.sign_view_changes(target_view, prepared, committed_flat, stable);
        let mut out = Vec::new();
        for vc in &view_changes {
            match engine.add_view_change(vc, self.current_view) {
                Ok(()) => out.push(Outgoing::ViewChange(vc.clone())),
                Err(err) => tracing::debug!("own view-change not recorded: {}", err),
            }
        }
        self.cache.view_changes = view_changes;

        if let Some(nv) = self.maybe_emit_new_view(engine) {
            out.push(Outgoing::NewView(nv));
        }
        out
    }

    /// Timer tick: within the timeout window, re-emit cached view-changes
    /// with fresh envelopes; past it, escalate (or, outside view change,
    /// conclude liveness has stalled and start one).
    pub fn tick(&mut self, engine: &mut ConsensusEngine) -> Vec<Outgoing> {
        let mut out = Vec::new();

        if self.view_change_timer <= self.view_change_timeout {
            if !self.cache.view_changes.is_empty() {
                let chain_id = engine.chain_id();
                let mut fresh = Vec::new();
                for vc in &self.cache.view_changes {
                    let Some(provider) = engine.provider_for(&vc.public_key) else {
                        continue;
                    };
                    fresh.push(vc.resigned(&chain_id, provider.as_ref()));
                }
                for vc in &fresh {
                    let _ = engine.add_view_change(vc, self.current_view);
                    out.push(Outgoing::ViewChange(vc.clone()));
                }
                self.cache.view_changes = fresh;
            }
            self.view_change_timer += 1;
        } else {
            self.view_change_timer = 0;
            match self.state {
                ReplicaState::ViewChanging { target_view } => {
                    self.target_view_retries += 1;
                    let escalated = self.current_view + 1 + self.target_view_retries;
                    tracing::info!(
                        "view change to {} timed out, escalating to {}",
                        target_view,
                        escalated
                    );
                    counter!("pbft.view_change_escalations").increment(1);
                    self.state = ReplicaState::ViewChanging {
                        target_view: escalated,
                    };
                    self.cache.view_changes.clear();
                    out.extend(self.send_view_change(engine));
                }
                _ => {
                    let target = self.current_view + 1;
                    out.extend(self.transit_to_view_changing(target, engine));
                }
            }
        }

        if let Some(nv) = self.maybe_emit_new_view(engine) {
            out.push(Outgoing::NewView(nv));
        }
        out
    }

    // --- transitions ----------------------------------------------------

    fn maybe_transit_committed(&mut self, engine: &mut ConsensusEngine) {
        if self.state != ReplicaState::Prepared || !engine.should_committed() {
            return;
        }
        self.cache.prepares.clear();
        self.cache.committed_certs = engine.committed_certificates();
        self.state = ReplicaState::Committed;
        self.view_change_timer = 0;
        counter!("pbft.transitions_to_committed").increment(1);
        tracing::info!("replica is committed in view {}", self.current_view);
    }

    fn transit_to_view_changing(
        &mut self,
        target: ViewNum,
        engine: &mut ConsensusEngine,
    ) -> Vec<Outgoing> {
        tracing::info!(
            "leaving {} state, changing view {} -> {}",
            self.state.name(),
            self.current_view,
            target
        );
        counter!("pbft.transitions_to_view_changing").increment(1);
        self.state = ReplicaState::ViewChanging {
            target_view: target,
        };
        self.view_change_timer = 0;
        self.target_view_retries = target.saturating_sub(self.current_view + 1);
        self.send_view_change(engine)
    }

    fn install_new_view(&mut self, nv: &NewView, engine: &mut ConsensusEngine) {
        engine.apply_new_view(nv);
        engine.views.prune_at_or_below(nv.view);
        self.current_view = nv.view;
        self.state = ReplicaState::Prepared;
        self.view_change_timer = 0;
        self.target_view_retries = 0;
        self.cache = MessageCache::default();
        tracing::info!("entered view {} in prepared state", nv.view);
        self.maybe_transit_committed(engine);
    }

    /// Build and locally apply a NewView once the target view is ready and
    /// one of our keys is its primary. The supporting view-changes are
    /// already in the accumulator, so causal order holds.
    fn maybe_emit_new_view(&mut self, engine: &mut ConsensusEngine) -> Option<NewView> {
        let ReplicaState::ViewChanging { target_view } = self.state else {
            return None;
        };
        if !self.bp_candidate
            || !engine.should_new_view(target_view)
            || !engine.is_new_primary(target_view)
        {
            return None;
        }
        let vcc = engine.view_changed_certificate(target_view)?;
        let evidence = reconstruct_evidence(engine.chain(), &vcc.view_changes);
        let primary_key = engine.new_view_primary_key(target_view)?;
        let provider = engine.provider_for(&primary_key)?;
        self.cache.view_changed_cert = Some(vcc.clone());

        let nv = NewView::signed(
            target_view,
            evidence.prepared,
            evidence.committed,
            evidence.stable_checkpoint,
            vcc,
            &engine.chain_id(),
            provider.as_ref(),
        );
        counter!("pbft.new_views_emitted").increment(1);
        tracing::info!("broadcasting new-view for view {}", target_view);
        self.install_new_view(&nv, engine);
        Some(nv)
    }
}
