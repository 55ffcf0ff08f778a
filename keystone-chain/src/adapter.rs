//! Chain adapter interface
//!
//! The engine never touches chain internals directly; everything it needs
//! from the underlying chain comes through this trait, and everything it
//! pins back (prepared branch, LSCB advancement, stable-checkpoint
//! extensions) goes back through it. All calls are synchronous; the engine
//! consults the adapter from its single event-loop thread only.

use keystone_core::{BlockId, BlockNum, ChainId, ProducerSchedule, SignatureProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Block-extension tag carrying a serialized stable checkpoint.
pub const STABLE_CHECKPOINT_EXTENSION: u16 = 0x0004;

/// An opaque extension attached to a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockExtension {
    pub tag: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// The slice of per-block chain state the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub id: BlockId,
    pub num: BlockNum,
    pub prev: BlockId,
    /// Producer schedule in force at this block.
    pub active_schedule: ProducerSchedule,
    /// A promoted-but-not-yet-active schedule, if this block announced one.
    pub pending_schedule: Option<ProducerSchedule>,
}

/// Read/write surface the engine holds onto the chain.
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> ChainId;

    fn block_state_by_id(&self, id: &BlockId) -> Option<BlockState>;

    /// Block at the given height on the current best chain.
    fn block_state_by_num(&self, num: BlockNum) -> Option<BlockState>;

    fn head_block_num(&self) -> BlockNum;

    fn head_block_id(&self) -> BlockId;

    fn last_irreversible_block_num(&self) -> BlockNum;

    fn last_stable_checkpoint_block_num(&self) -> BlockNum;

    /// Record a newer stable checkpoint block. Ignored if not newer.
    fn advance_lscb(&self, num: BlockNum);

    fn active_producers_at(&self, id: &BlockId) -> Option<ProducerSchedule>;

    /// Schedule in force at the last stable-checkpoint block. Falls back to
    /// the genesis schedule while no checkpoint is stable yet.
    fn lscb_active_producers(&self) -> ProducerSchedule;

    /// The branch from `id` down to (but not including) the last
    /// irreversible block, newest first. Empty when `id` is unknown.
    fn branch_from(&self, id: &BlockId) -> Vec<BlockState>;

    /// Signing providers configured on this node, one per key.
    fn my_signature_providers(&self) -> Vec<Arc<dyn SignatureProvider>>;

    /// Pin the branch containing `id` as pbft-prepared for fork choice.
    fn set_pbft_prepared(&self, id: &BlockId);

    fn get_pbft_prepared(&self) -> Option<BlockId>;

    /// Remember the block this node last prepared.
    fn set_pbft_my_prepare(&self, id: &BlockId);

    fn get_pbft_my_prepare(&self) -> Option<BlockId>;

    /// Append an extension to a block. Returns false when the block is
    /// unknown.
    fn append_block_extension(&self, id: &BlockId, extension: BlockExtension) -> bool;

    fn block_extensions(&self, id: &BlockId) -> Vec<BlockExtension>;
}
