//! In-memory fork-aware chain
//!
//! Backs the test suites and the local harness. Blocks form a tree over
//! parent links; the best chain is whatever `head` currently points at.

use crate::adapter::{BlockExtension, BlockState, ChainAdapter};
use keystone_core::{
    crypto, BlockId, BlockNum, ChainId, ProducerSchedule, PublicKey, SignatureProvider,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct Inner {
    blocks: HashMap<BlockId, BlockState>,
    extensions: HashMap<BlockId, Vec<BlockExtension>>,
    head: BlockId,
    lib: BlockNum,
    lscb: BlockNum,
    prepared: Option<BlockId>,
    prepared_history: Vec<BlockId>,
    my_prepare: Option<BlockId>,
    providers: Vec<Arc<dyn SignatureProvider>>,
}

pub struct MemoryChain {
    chain_id: ChainId,
    genesis_schedule: ProducerSchedule,
    inner: RwLock<Inner>,
}

impl MemoryChain {
    pub fn new(chain_id: ChainId, genesis_schedule: ProducerSchedule) -> Self {
        Self {
            chain_id,
            genesis_schedule,
            inner: RwLock::new(Inner {
                blocks: HashMap::new(),
                extensions: HashMap::new(),
                head: BlockId::ZERO,
                lib: 0,
                lscb: 0,
                prepared: None,
                prepared_history: Vec::new(),
                my_prepare: None,
                providers: Vec::new(),
            }),
        }
    }

    /// Derive a block id: number in the first four bytes, hash of the
    /// parent link in the rest.
    fn make_block_id(num: BlockNum, prev: &BlockId, salt: u8) -> BlockId {
        let mut payload = Vec::with_capacity(33);
        payload.extend_from_slice(&prev.0);
        payload.push(salt);
        let digest = crypto::hash_with_prefix(b"keystone.block", &payload);
        let mut raw = digest;
        raw[..4].copy_from_slice(&num.to_be_bytes());
        BlockId(raw)
    }

    /// Append a block on `prev` (use `BlockId::ZERO` to start the chain).
    /// Advances head when the new block is the highest seen.
    pub fn append_block(&self, prev: &BlockId, schedule: ProducerSchedule) -> BlockId {
        self.append_block_salted(prev, schedule, None, 0)
    }

    /// Append a block that also announces a promoted schedule.
    pub fn append_block_with_pending(
        &self,
        prev: &BlockId,
        schedule: ProducerSchedule,
        pending: ProducerSchedule,
    ) -> BlockId {
        self.append_block_salted(prev, schedule, Some(pending), 0)
    }

    /// Append with an explicit salt so tests can build sibling blocks at
    /// the same height.
    pub fn append_block_salted(
        &self,
        prev: &BlockId,
        schedule: ProducerSchedule,
        pending: Option<ProducerSchedule>,
        salt: u8,
    ) -> BlockId {
        let mut inner = self.inner.write();
        let num = if prev.is_zero() { 1 } else { prev.block_num() + 1 };
        let id = Self::make_block_id(num, prev, salt);
        let state = BlockState {
            id,
            num,
            prev: *prev,
            active_schedule: schedule,
            pending_schedule: pending,
        };
        inner.blocks.insert(id, state);
        if inner.head.is_zero() || num > inner.head.block_num() {
            inner.head = id;
        }
        id
    }

    /// Grow the best chain by `count` blocks under one schedule; returns
    /// the appended ids in order.
    pub fn extend_best_chain(&self, count: u32, schedule: &ProducerSchedule) -> Vec<BlockId> {
        let mut ids = Vec::with_capacity(count as usize);
        let mut prev = self.head_block_id();
        for _ in 0..count {
            let id = self.append_block(&prev, schedule.clone());
            ids.push(id);
            prev = id;
        }
        ids
    }

    pub fn set_head(&self, id: &BlockId) {
        let mut inner = self.inner.write();
        if inner.blocks.contains_key(id) {
            inner.head = *id;
        }
    }

    pub fn advance_lib(&self, num: BlockNum) {
        let mut inner = self.inner.write();
        if num > inner.lib {
            inner.lib = num;
        }
    }

    pub fn add_provider(&self, provider: Arc<dyn SignatureProvider>) {
        self.inner.write().providers.push(provider);
    }

    /// Every distinct pbft-prepared pin, in order. Repeated pins of the
    /// same block are not recorded.
    pub fn pbft_prepared_history(&self) -> Vec<BlockId> {
        self.inner.read().prepared_history.clone()
    }

    pub fn provider_keys(&self) -> Vec<PublicKey> {
        self.inner
            .read()
            .providers
            .iter()
            .map(|p| p.public_key())
            .collect()
    }
}

impl ChainAdapter for MemoryChain {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn block_state_by_id(&self, id: &BlockId) -> Option<BlockState> {
        self.inner.read().blocks.get(id).cloned()
    }

    fn block_state_by_num(&self, num: BlockNum) -> Option<BlockState> {
        let inner = self.inner.read();
        let mut cursor = inner.blocks.get(&inner.head)?;
        loop {
            if cursor.num == num {
                return Some(cursor.clone());
            }
            if cursor.num < num {
                return None;
            }
            cursor = inner.blocks.get(&cursor.prev)?;
        }
    }

    fn head_block_num(&self) -> BlockNum {
        let inner = self.inner.read();
        if inner.head.is_zero() {
            0
        } else {
            inner.head.block_num()
        }
    }

    fn head_block_id(&self) -> BlockId {
        self.inner.read().head
    }

    fn last_irreversible_block_num(&self) -> BlockNum {
        self.inner.read().lib
    }

    fn last_stable_checkpoint_block_num(&self) -> BlockNum {
        self.inner.read().lscb
    }

    fn advance_lscb(&self, num: BlockNum) {
        let mut inner = self.inner.write();
        if num > inner.lscb {
            tracing::debug!("lscb advanced {} -> {}", inner.lscb, num);
            inner.lscb = num;
        }
    }

    fn active_producers_at(&self, id: &BlockId) -> Option<ProducerSchedule> {
        self.inner
            .read()
            .blocks
            .get(id)
            .map(|b| b.active_schedule.clone())
    }

    fn lscb_active_producers(&self) -> ProducerSchedule {
        let lscb = self.last_stable_checkpoint_block_num();
        if lscb == 0 {
            return self.genesis_schedule.clone();
        }
        self.block_state_by_num(lscb)
            .map(|b| b.active_schedule)
            .unwrap_or_else(|| self.genesis_schedule.clone())
    }

    fn branch_from(&self, id: &BlockId) -> Vec<BlockState> {
        let inner = self.inner.read();
        let mut branch = Vec::new();
        let mut cursor = inner.blocks.get(id);
        while let Some(block) = cursor {
            if block.num <= inner.lib {
                break;
            }
            branch.push(block.clone());
            cursor = inner.blocks.get(&block.prev);
        }
        branch
    }

    fn my_signature_providers(&self) -> Vec<Arc<dyn SignatureProvider>> {
        self.inner.read().providers.clone()
    }

    fn set_pbft_prepared(&self, id: &BlockId) {
        let mut inner = self.inner.write();
        if inner.prepared != Some(*id) {
            inner.prepared = Some(*id);
            inner.prepared_history.push(*id);
        }
    }

    fn get_pbft_prepared(&self) -> Option<BlockId> {
        self.inner.read().prepared
    }

    fn set_pbft_my_prepare(&self, id: &BlockId) {
        self.inner.write().my_prepare = Some(*id);
    }

    fn get_pbft_my_prepare(&self) -> Option<BlockId> {
        self.inner.read().my_prepare
    }

    fn append_block_extension(&self, id: &BlockId, extension: BlockExtension) -> bool {
        let mut inner = self.inner.write();
        if !inner.blocks.contains_key(id) {
            return false;
        }
        inner.extensions.entry(*id).or_default().push(extension);
        true
    }

    fn block_extensions(&self, id: &BlockId) -> Vec<BlockExtension> {
        self.inner
            .read()
            .extensions
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}
