//! Fork-schedule tracking and prepare watermarks
//!
//! A promoted producer schedule observed on a block opens a watermark at
//! that height: prepares and commits must not race past it until the
//! transition itself has stabilized (fallen at or below LSCB). The tracker
//! also remembers the earliest block at which each incoming producer key
//! becomes active, so messages from producers of an upcoming schedule are
//! not dropped as foreign.

use keystone_chain::BlockState;
use keystone_core::{BlockNum, ProducerSchedule, PublicKey};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct ForkScheduleTracker {
    watermarks: BTreeSet<BlockNum>,
    fork_schedules: BTreeMap<PublicKey, BlockNum>,
}

impl ForkScheduleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a block for a schedule promotion.
    pub fn observe_block(&mut self, block: &BlockState, lscb_schedule: &ProducerSchedule) {
        let Some(pending) = &block.pending_schedule else {
            return;
        };
        if pending.version <= block.active_schedule.version {
            return;
        }
        if self.watermarks.insert(block.num) {
            tracing::debug!(
                "schedule v{} promoted at block {}, watermark opened",
                pending.version,
                block.num
            );
        }
        for key in &pending.producers {
            if !lscb_schedule.contains(key) {
                self.fork_schedules.entry(*key).or_insert(block.num);
            }
        }
    }

    /// The lowest block number above which a schedule change is still
    /// pending confirmation. `None` while no transition is in flight.
    pub fn current_watermark(&self) -> Option<BlockNum> {
        self.watermarks.iter().next().copied()
    }

    pub fn watermarks(&self) -> Vec<BlockNum> {
        self.watermarks.iter().copied().collect()
    }

    /// Whether `key` belongs to a promoted-but-unstabilized schedule.
    pub fn is_upcoming_producer(&self, key: &PublicKey) -> bool {
        self.fork_schedules.contains_key(key)
    }

    pub fn fork_schedules(&self) -> &BTreeMap<PublicKey, BlockNum> {
        &self.fork_schedules
    }

    /// Transitions at or below the stable checkpoint are confirmed; drop
    /// their watermarks and producer entries.
    pub fn prune_at_or_below(&mut self, num: BlockNum) {
        self.watermarks.retain(|w| *w > num);
        self.fork_schedules.retain(|_, activated| *activated > num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{BlockId, KeyPair};

    fn key(tag: u8) -> PublicKey {
        KeyPair::from_seed(&[tag; 32]).public_key()
    }

    fn schedule(version: u32, tags: &[u8]) -> ProducerSchedule {
        ProducerSchedule::new(version, tags.iter().map(|t| key(*t)).collect())
    }

    fn block(num: BlockNum, active: ProducerSchedule, pending: Option<ProducerSchedule>) -> BlockState {
        let mut raw = [0u8; 32];
        raw[..4].copy_from_slice(&num.to_be_bytes());
        BlockState {
            id: BlockId(raw),
            num,
            prev: BlockId::ZERO,
            active_schedule: active,
            pending_schedule: pending,
        }
    }

    #[test]
    fn promotion_opens_a_watermark() {
        let lscb = schedule(1, &[1, 2, 3, 4]);
        let mut tracker = ForkScheduleTracker::new();
        assert_eq!(tracker.current_watermark(), None);

        tracker.observe_block(&block(10, schedule(1, &[1, 2, 3, 4]), Some(schedule(2, &[1, 2, 3, 5]))), &lscb);
        assert_eq!(tracker.current_watermark(), Some(10));
        assert!(tracker.is_upcoming_producer(&key(5)));
        assert!(!tracker.is_upcoming_producer(&key(1)));
    }

    #[test]
    fn lowest_watermark_wins() {
        let lscb = schedule(1, &[1, 2, 3, 4]);
        let mut tracker = ForkScheduleTracker::new();
        tracker.observe_block(&block(20, schedule(2, &[1, 2, 3, 5]), Some(schedule(3, &[1, 2, 3, 6]))), &lscb);
        tracker.observe_block(&block(10, schedule(1, &[1, 2, 3, 4]), Some(schedule(2, &[1, 2, 3, 5]))), &lscb);
        assert_eq!(tracker.current_watermark(), Some(10));
        assert_eq!(tracker.watermarks(), vec![10, 20]);
    }

    #[test]
    fn stale_promotions_are_ignored() {
        let lscb = schedule(2, &[1, 2, 3, 4]);
        let mut tracker = ForkScheduleTracker::new();
        // pending version not newer than active: no transition in flight
        tracker.observe_block(&block(10, schedule(2, &[1, 2, 3, 4]), Some(schedule(2, &[1, 2, 3, 4]))), &lscb);
        tracker.observe_block(&block(11, schedule(2, &[1, 2, 3, 4]), None), &lscb);
        assert_eq!(tracker.current_watermark(), None);
    }

    #[test]
    fn prune_confirms_transitions() {
        let lscb = schedule(1, &[1, 2, 3, 4]);
        let mut tracker = ForkScheduleTracker::new();
        tracker.observe_block(&block(10, schedule(1, &[1, 2, 3, 4]), Some(schedule(2, &[1, 2, 3, 5]))), &lscb);
        tracker.observe_block(&block(30, schedule(2, &[1, 2, 3, 5]), Some(schedule(3, &[1, 2, 3, 6]))), &lscb);

        tracker.prune_at_or_below(10);
        assert_eq!(tracker.current_watermark(), Some(30));
        assert!(!tracker.is_upcoming_producer(&key(5)));
        assert!(tracker.is_upcoming_producer(&key(6)));
    }
}
