//! Block metadata for the paged KV cache.
//!
//! A `Block` is pure bookkeeping: it records who references a slot of pool
//! memory, where that slot currently lives (primary or secondary pool), and
//! how the block is linked into the reuse tree. The payload itself is owned
//! by the [`BlockPool`](super::block_pool::BlockPool) and is reused across
//! all layers, so no tensor pointers live here.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use super::block_pool::KvCacheIndex;

/// Token id as produced by the tokenizer.
pub type TokenId = u32;

/// Auxiliary id distinguishing otherwise identical token ids, e.g. positions
/// that a prompt table replaces with external embeddings.
pub type TokenExtraId = u64;

/// Task id of a LoRA adapter. Zero means the base model.
pub type LoraTaskId = u64;

/// Dense index of a block in the manager's arena.
pub type BlockId = usize;

/// The unit of cache matching: a token id paired with its extra id.
///
/// Two tokens with equal ids but different extra ids are distinct for reuse,
/// since their KV state may differ (the extra id selects a prompt-table
/// embedding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueToken {
    pub token_id: TokenId,
    pub extra_id: TokenExtraId,
}

impl UniqueToken {
    pub fn new(token_id: TokenId, extra_id: TokenExtraId) -> Self {
        Self { token_id, extra_id }
    }
}

/// Content key of a full block: the adapter task id plus one unique token
/// per cache position. Partial blocks carry an empty token vector and are
/// never inserted into the reuse tree.
///
/// Equality is full elementwise comparison; the hash below is only used to
/// index child maps and never substitutes for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockKey {
    pub lora_task_id: LoraTaskId,
    pub unique_tokens: Vec<UniqueToken>,
}

impl BlockKey {
    pub fn new(lora_task_id: LoraTaskId, unique_tokens: Vec<UniqueToken>) -> Self {
        Self {
            lora_task_id,
            unique_tokens,
        }
    }

    /// Mix the key down to a single 64-bit value.
    ///
    /// Token ids go through a 32-bit xorshift-multiply avalanche, extra ids
    /// and the task id through the SplitMix64 finalizer, and everything is
    /// folded into the seed with the golden-ratio constant.
    fn mix(&self) -> u64 {
        let mut seed = self.unique_tokens.len() as u64;
        for token in &self.unique_tokens {
            let mut a = token.token_id;
            a = ((a >> 16) ^ a).wrapping_mul(0x45d9_f3b);
            a = ((a >> 16) ^ a).wrapping_mul(0x45d9_f3b);
            a = (a >> 16) ^ a;
            seed ^= (a as u64)
                .wrapping_add(0x9e37_79b9)
                .wrapping_add(seed << 6)
                .wrapping_add(seed >> 2);

            let b = splitmix64(token.extra_id);
            seed ^= b
                .wrapping_add(0x9e37_79b9)
                .wrapping_add(seed << 6)
                .wrapping_add(seed >> 2);
        }
        let c = splitmix64(self.lora_task_id);
        seed ^= c
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(seed << 6)
            .wrapping_add(seed >> 2);
        seed
    }
}

impl Hash for BlockKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.mix());
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Partition a unique-token stream into full-block keys.
///
/// Only complete windows of `tokens_per_block` produce a key; the trailing
/// partial window is dropped because partial blocks are never cached.
pub fn block_keys_of_tokens(
    lora_task_id: LoraTaskId,
    tokens: &[UniqueToken],
    tokens_per_block: usize,
) -> Vec<BlockKey> {
    tokens
        .chunks_exact(tokens_per_block)
        .map(|window| BlockKey::new(lora_task_id, window.to_vec()))
        .collect()
}

/// Per-block bookkeeping record, arena-allocated by the block manager.
///
/// Tree links are block ids into the same arena, never owning pointers:
/// freeing a block detaches it from its parent's child map and clears its
/// parent link.
#[derive(Debug)]
pub struct Block {
    /// Dense id, stable for the lifetime of the manager.
    block_id: BlockId,
    /// Which pool currently backs this block, and at what offset. Swapped
    /// with another block's index on offload/onboard so that `block_id`
    /// stays valid for sequences holding it.
    pool_index: KvCacheIndex,
    /// Number of (sequence, beam) references.
    ref_count: u32,
    /// Shadow count used to simulate releases during admission.
    scheduling_ref_count: u32,
    /// Key under which this block hangs in its parent's child map. Empty
    /// token vector while the block is partial or untracked.
    block_key: BlockKey,
    /// Set once the block's full token window has been written.
    is_full: bool,
    /// Parent in the reuse tree, if registered.
    prev_block: Option<BlockId>,
    /// Children in the reuse tree, keyed by their block key.
    next_blocks: HashMap<BlockKey, BlockId>,
}

impl Block {
    pub fn new(block_id: BlockId, pool_index: KvCacheIndex) -> Self {
        Self {
            block_id,
            pool_index,
            ref_count: 0,
            scheduling_ref_count: 0,
            block_key: BlockKey::default(),
            is_full: false,
            prev_block: None,
            next_blocks: HashMap::new(),
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn pool_index(&self) -> KvCacheIndex {
        self.pool_index
    }

    pub fn set_pool_index(&mut self, index: KvCacheIndex) {
        self.pool_index = index;
    }

    pub fn is_primary(&self) -> bool {
        self.pool_index.is_primary()
    }

    pub fn inc_ref_count(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref_count(&mut self) {
        debug_assert!(self.ref_count > 0, "refcount underflow");
        self.ref_count -= 1;
    }

    pub fn has_refs(&self) -> bool {
        self.ref_count > 0
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Snapshot the real refcount into the shadow count at the start of an
    /// admission step.
    pub fn start_scheduling(&mut self) {
        self.scheduling_ref_count = self.ref_count;
    }

    pub fn dec_scheduling_ref_count(&mut self) {
        debug_assert!(self.scheduling_ref_count > 0, "scheduling refcount underflow");
        self.scheduling_ref_count -= 1;
    }

    pub fn has_scheduling_refs(&self) -> bool {
        self.scheduling_ref_count > 0
    }

    pub fn set_block_key(&mut self, block_key: BlockKey, is_full: bool) {
        self.block_key = block_key;
        self.is_full = is_full;
    }

    pub fn block_key(&self) -> &BlockKey {
        &self.block_key
    }

    pub fn unique_tokens(&self) -> &[UniqueToken] {
        &self.block_key.unique_tokens
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    pub fn prev_block(&self) -> Option<BlockId> {
        self.prev_block
    }

    pub fn set_prev_block(&mut self, prev: Option<BlockId>) {
        self.prev_block = prev;
    }

    pub fn next_blocks(&self) -> &HashMap<BlockKey, BlockId> {
        &self.next_blocks
    }

    pub fn add_next_block(&mut self, key: BlockKey, block: BlockId) {
        self.next_blocks.insert(key, block);
    }

    pub fn remove_next_block(&mut self, key: &BlockKey) {
        self.next_blocks.remove(key);
    }

    pub fn find_matching_block(&self, key: &BlockKey) -> Option<BlockId> {
        self.next_blocks.get(key).copied()
    }

    pub fn is_leaf(&self) -> bool {
        self.next_blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn tokens(ids: &[TokenId]) -> Vec<UniqueToken> {
        ids.iter().map(|&t| UniqueToken::new(t, 0)).collect()
    }

    fn hash_of(key: &BlockKey) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    #[test]
    fn equal_keys_hash_equal() {
        let a = BlockKey::new(0, tokens(&[1, 2, 3, 4]));
        let b = BlockKey::new(0, tokens(&[1, 2, 3, 4]));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn different_tokens_differ() {
        let a = BlockKey::new(0, tokens(&[1, 2, 3, 4]));
        let b = BlockKey::new(0, tokens(&[1, 2, 3, 5]));
        assert_ne!(a, b);
        assert_ne!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn extra_id_distinguishes_keys() {
        let a = BlockKey::new(0, tokens(&[1, 2, 3, 4]));
        let b = BlockKey::new(
            0,
            (1..=4u32).map(|t| UniqueToken::new(t, 7)).collect::<Vec<_>>(),
        );
        assert_ne!(a, b);
        assert_ne!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn lora_task_distinguishes_keys() {
        let a = BlockKey::new(0, tokens(&[1, 2, 3, 4]));
        let b = BlockKey::new(42, tokens(&[1, 2, 3, 4]));
        assert_ne!(a, b);
        assert_ne!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn block_keys_drop_partial_window() {
        let keys = block_keys_of_tokens(0, &tokens(&[1, 2, 3, 4, 5, 6, 7, 8, 9]), 4);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].unique_tokens, tokens(&[1, 2, 3, 4]));
        assert_eq!(keys[1].unique_tokens, tokens(&[5, 6, 7, 8]));
    }

    #[test]
    fn block_keys_empty_input() {
        assert!(block_keys_of_tokens(0, &[], 4).is_empty());
    }

    #[test]
    fn refcount_lifecycle() {
        let mut block = Block::new(0, KvCacheIndex::primary(0));
        assert!(!block.has_refs());
        block.inc_ref_count();
        block.inc_ref_count();
        assert!(block.is_shared());
        block.dec_ref_count();
        assert!(block.has_refs());
        assert!(!block.is_shared());
        block.dec_ref_count();
        assert!(!block.has_refs());
    }

    #[test]
    fn scheduling_refcount_shadows_real_count() {
        let mut block = Block::new(0, KvCacheIndex::primary(0));
        block.inc_ref_count();
        block.start_scheduling();
        assert!(block.has_scheduling_refs());
        block.dec_scheduling_ref_count();
        assert!(!block.has_scheduling_refs());
        // Real count untouched by the simulation.
        assert!(block.has_refs());
    }

    #[test]
    fn tree_links() {
        let mut parent = Block::new(0, KvCacheIndex::primary(0));
        let key = BlockKey::new(0, tokens(&[1, 2, 3, 4]));
        parent.add_next_block(key.clone(), 1);
        assert_eq!(parent.find_matching_block(&key), Some(1));
        assert!(!parent.is_leaf());
        parent.remove_next_block(&key);
        assert_eq!(parent.find_matching_block(&key), None);
        assert!(parent.is_leaf());
    }
}
