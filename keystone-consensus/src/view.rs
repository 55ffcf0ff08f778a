//! Per-target-view view-change accumulator
//!
//! A view-change voting to abandon view V lands in the record for target
//! view V+1. Quorum counting uses distinct members of the LSCB schedule as
//! the sole criterion. The f+1 wake-up scan lets a stalled replica join
//! the smallest view change that at least one honest peer is attempting.

use crate::certificate::is_valid_view_change;
use crate::error::VoteError;
use crate::message::ViewChange;
use keystone_chain::ChainAdapter;
use keystone_core::{PublicKey, ViewNum};
use std::collections::BTreeMap;

/// Per-target-view tally of view-changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub view: ViewNum,
    pub view_changes: Vec<ViewChange>,
    pub should_view_changed: bool,
}

impl ViewState {
    fn new(view: ViewNum) -> Self {
        Self {
            view,
            view_changes: Vec::new(),
            should_view_changed: false,
        }
    }

    fn schedule_members(&self, schedule: &keystone_core::ProducerSchedule) -> usize {
        let mut keys: Vec<PublicKey> = self
            .view_changes
            .iter()
            .map(|vc| vc.public_key)
            .filter(|key| schedule.contains(key))
            .collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }
}

/// Records ordered by target view; the `(should_view_changed, view)`
/// ordering of the original falls out of scanning this map from either
/// end.
#[derive(Default)]
pub struct ViewAccumulator {
    records: BTreeMap<ViewNum, ViewState>,
}

impl ViewAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, target: ViewNum) -> Option<&ViewState> {
        self.records.get(&target)
    }

    /// Record a view-change against its target view. `current_view` is the
    /// local replica's view; targets at or below it are stale.
    pub fn add_view_change(
        &mut self,
        vc: &ViewChange,
        current_view: ViewNum,
        chain: &dyn ChainAdapter,
    ) -> Result<(), VoteError> {
        if !is_valid_view_change(vc, chain) {
            return Err(VoteError::Malformed("invalid view-change"));
        }
        let schedule = chain.lscb_active_producers();
        if !schedule.contains(&vc.public_key) {
            return Err(VoteError::OutOfSchedule);
        }
        let target = vc.target_view();
        if target <= current_view {
            return Err(VoteError::Stale);
        }

        let record = self
            .records
            .entry(target)
            .or_insert_with(|| ViewState::new(target));
        if record.should_view_changed {
            return Ok(());
        }
        let duplicate = record
            .view_changes
            .iter()
            .any(|e| e.public_key == vc.public_key);
        if !duplicate {
            record.view_changes.push(vc.clone());
        }

        if record.schedule_members(&schedule) >= schedule.quorum_threshold() {
            record.should_view_changed = true;
            tracing::info!(
                "view {} is ready: {} view-changes collected",
                target,
                record.view_changes.len()
            );
        }
        Ok(())
    }

    /// The f+1 wake-up rule: the smallest target view backed by at least
    /// f+1 distinct schedule members that has not itself reached quorum.
    pub fn should_view_change(&self, chain: &dyn ChainAdapter) -> Option<ViewNum> {
        let schedule = chain.lscb_active_producers();
        for (view, record) in &self.records {
            if record.should_view_changed {
                continue;
            }
            if record.schedule_members(&schedule) >= schedule.wakeup_threshold() {
                return Some(*view);
            }
        }
        None
    }

    /// Whether the target view collected its 2f+1 quorum.
    pub fn should_new_view(&self, target: ViewNum) -> bool {
        self.records
            .get(&target)
            .map(|r| r.should_view_changed)
            .unwrap_or(false)
    }

    /// Drop records for views we have already entered or passed.
    pub fn prune_at_or_below(&mut self, view: ViewNum) {
        self.records.retain(|target, _| *target > view);
    }
}
