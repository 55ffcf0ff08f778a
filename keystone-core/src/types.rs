//! Chain-facing primitive types
//!
//! Block identifiers carry their block number in the first four bytes
//! (big-endian), so lexicographic id order equals (number, hash) order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Height of a block on the underlying chain.
pub type BlockNum = u32;

/// A primary epoch. Monotone non-negative.
pub type ViewNum = u32;

/// 32-byte block hash with the block number embedded in its prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    pub const ZERO: BlockId = BlockId([0u8; 32]);

    /// Block number extracted from the id prefix.
    pub fn block_num(&self) -> BlockNum {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Short identifier for logs (first 8 bytes, hex).
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}..@{})", self.short_id(), self.block_num())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Identity of the chain this engine is finalizing; mixed into every
/// message digest so signatures cannot migrate across deployments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub [u8; 32]);

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", hex::encode(&self.0[..8]))
    }
}

/// An ed25519 public key identifying a producer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", self.short_id())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Ordered list of active producer keys at some block, with the schedule
/// version the chain assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<PublicKey>,
}

impl ProducerSchedule {
    pub fn new(version: u32, producers: Vec<PublicKey>) -> Self {
        Self { version, producers }
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.producers.iter().any(|p| p == key)
    }

    /// Quorum threshold: 2f+1 under standard BFT sizing.
    /// 3-of-4, 15-of-21.
    pub fn quorum_threshold(&self) -> usize {
        self.producers.len() * 2 / 3 + 1
    }

    /// Wake-up threshold: f+1. 2-of-4, 8-of-21.
    pub fn wakeup_threshold(&self) -> usize {
        self.producers.len() / 3 + 1
    }

    /// Primary of the given view: `producers[view mod N]`.
    pub fn primary_for(&self, view: ViewNum) -> Option<PublicKey> {
        if self.producers.is_empty() {
            return None;
        }
        Some(self.producers[view as usize % self.producers.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: u8) -> PublicKey {
        PublicKey([tag; 32])
    }

    #[test]
    fn block_num_lives_in_id_prefix() {
        let mut raw = [0u8; 32];
        raw[..4].copy_from_slice(&1234u32.to_be_bytes());
        raw[4] = 0xab;
        let id = BlockId(raw);
        assert_eq!(id.block_num(), 1234);
    }

    #[test]
    fn id_order_is_block_num_order() {
        let mut lo = [0xffu8; 32];
        lo[..4].copy_from_slice(&10u32.to_be_bytes());
        let mut hi = [0x00u8; 32];
        hi[..4].copy_from_slice(&11u32.to_be_bytes());
        assert!(BlockId(lo) < BlockId(hi));
    }

    #[test]
    fn quorum_thresholds() {
        let s4 = ProducerSchedule::new(1, (0..4).map(|i| key(i as u8)).collect());
        assert_eq!(s4.quorum_threshold(), 3);
        assert_eq!(s4.wakeup_threshold(), 2);

        let s21 = ProducerSchedule::new(1, (0..21).map(|i| key(i as u8)).collect());
        assert_eq!(s21.quorum_threshold(), 15);
        assert_eq!(s21.wakeup_threshold(), 8);
    }

    #[test]
    fn primary_rotates_through_schedule() {
        let s = ProducerSchedule::new(1, vec![key(1), key(2), key(3), key(4)]);
        assert_eq!(s.primary_for(0), Some(key(1)));
        assert_eq!(s.primary_for(5), Some(key(2)));
        assert_eq!(ProducerSchedule::default().primary_for(0), None);
    }
}
