//! Block allocation, eviction, and prefix reuse.
//!
//! The manager owns an arena of block records covering both pools plus a
//! dummy root. Full blocks released by finished sequences stay linked into a
//! tree rooted at that dummy: each node's key is one block-sized token
//! window, so a path from the root spells out a token prefix. New sequences
//! descend the tree to recover cached prefixes; eviction walks the free
//! queues and refuses to drop a block while a primary-resident descendant
//! would be stranded.
//!
//! Single-writer: the serving loop is the only mutator, so refcounts are
//! plain integers and tree edits are ordinary field updates.

use tracing::debug;

use super::block::{block_keys_of_tokens, Block, BlockId, BlockKey, LoraTaskId, UniqueToken};
use super::block_pool::{BlockPool, KvCacheIndex};
use super::config::CacheConfig;
use super::error::CacheError;
use super::free_block_queue::FreeBlockQueue;
use super::sequence::Sequence;

pub struct BlockManager {
    tokens_per_block: usize,
    num_primary_blocks: usize,
    num_secondary_blocks: usize,
    /// All block records; ids `0..P` are born primary, `P..P+S` born
    /// secondary, and the last entry is the tree root.
    blocks: Vec<Block>,
    root: BlockId,
    free_primary: FreeBlockQueue,
    free_secondary: FreeBlockQueue,
    pool: BlockPool,
    onboard_blocks: bool,
    /// Free-block count seen by admission simulation.
    scheduling_num_free_blocks: usize,
    alloc_total_blocks: usize,
    alloc_new_blocks: usize,
    reused_blocks: usize,
}

impl BlockManager {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let pool = BlockPool::new(config)?;
        let num_primary = config.blocks_in_primary;
        let num_secondary = config.blocks_in_secondary;
        let total = num_primary + num_secondary;

        let mut blocks = Vec::with_capacity(total + 1);
        for offset in 0..num_primary {
            blocks.push(Block::new(offset, KvCacheIndex::primary(offset as u32)));
        }
        for offset in 0..num_secondary {
            blocks.push(Block::new(
                num_primary + offset,
                KvCacheIndex::secondary(offset as u32),
            ));
        }
        // Dummy root: never allocated, never queued; its pool index is
        // meaningless.
        let root = total;
        blocks.push(Block::new(root, KvCacheIndex::primary(0)));

        let mut free_primary = FreeBlockQueue::new(total);
        for id in 0..num_primary {
            free_primary.push_back(id);
        }
        let mut free_secondary = FreeBlockQueue::new(total);
        for id in num_primary..total {
            free_secondary.push_back(id);
        }

        Ok(Self {
            tokens_per_block: config.tokens_per_block,
            num_primary_blocks: num_primary,
            num_secondary_blocks: num_secondary,
            blocks,
            root,
            free_primary,
            free_secondary,
            pool,
            onboard_blocks: config.onboard_blocks,
            scheduling_num_free_blocks: 0,
            alloc_total_blocks: 0,
            alloc_new_blocks: 0,
            reused_blocks: 0,
        })
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn max_num_blocks(&self) -> usize {
        self.num_primary_blocks + self.num_secondary_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_primary.len()
    }

    pub fn num_free_secondary_blocks(&self) -> usize {
        self.free_secondary.len()
    }

    pub fn num_allocated_blocks(&self) -> usize {
        self.max_num_blocks() - self.num_free_blocks()
    }

    pub fn has_free_blocks(&self, num_required: usize) -> bool {
        self.num_free_blocks() >= num_required
    }

    pub fn num_alloc_total_blocks(&self) -> usize {
        self.alloc_total_blocks
    }

    pub fn num_alloc_new_blocks(&self) -> usize {
        self.alloc_new_blocks
    }

    pub fn num_reused_blocks(&self) -> usize {
        self.reused_blocks
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn pool_index_of(&self, block_id: BlockId) -> KvCacheIndex {
        self.blocks[block_id].pool_index()
    }

    pub fn block_ref_count(&self, block_id: BlockId) -> u32 {
        self.blocks[block_id].ref_count()
    }

    // ─── Scheduling simulation ───────────────────────────────────────────────

    /// Snapshot refcounts into shadow counts at the top of an admission step.
    pub fn start_scheduling(&mut self) {
        self.scheduling_num_free_blocks = self.free_primary.len();
        for block in &mut self.blocks {
            block.start_scheduling();
        }
    }

    /// Simulate releasing every block of `seq`, so the scheduler can test how
    /// many blocks a preemption would recover. Real state is untouched.
    pub fn scheduling_release_blocks(&mut self, seq: &Sequence) {
        for beam in seq.cache_block_ids() {
            for &block_id in beam {
                let block = &mut self.blocks[block_id];
                block.dec_scheduling_ref_count();
                if !block.has_scheduling_refs() {
                    self.scheduling_num_free_blocks += 1;
                }
            }
        }
    }

    pub fn scheduling_num_free_blocks(&self) -> usize {
        self.scheduling_num_free_blocks
    }

    pub fn scheduling_has_free_blocks(&self, num_required: usize) -> bool {
        self.scheduling_num_free_blocks >= num_required
    }

    // ─── Allocation ──────────────────────────────────────────────────────────

    /// Reserve `num_context_blocks` fresh blocks for a new sequence, shared
    /// among beams except the trailing block, which diverges per beam once
    /// decode starts writing into it.
    pub fn add_sequence(
        &mut self,
        seq: &mut Sequence,
        num_context_blocks: usize,
    ) -> Result<(), CacheError> {
        self.check_capacity(self.blocks_required(num_context_blocks, seq.beam_width()))?;
        let shared_limit = if seq.beam_width() > 1 {
            num_context_blocks.saturating_sub(1)
        } else {
            num_context_blocks
        };
        for block_pos in 0..num_context_blocks {
            self.allocate_block(seq, block_pos < shared_limit)?;
        }
        Ok(())
    }

    /// Reserve blocks for a new single-beam sequence, recovering as many
    /// leading full blocks as the reuse tree holds.
    ///
    /// At most `input_length - 1` tokens are matched: the last prompt token
    /// must stay uncached because it drives the first decode step. Returns
    /// the number of prepopulated tokens.
    pub fn add_sequence_with_reuse(
        &mut self,
        seq: &mut Sequence,
        input_length: usize,
        num_context_blocks: usize,
        lora_task_id: LoraTaskId,
        unique_tokens: &[UniqueToken],
    ) -> Result<usize, CacheError> {
        debug_assert_eq!(seq.beam_width(), 1, "reuse requires beam width 1");
        let matchable_blocks = input_length.saturating_sub(1) / self.tokens_per_block;
        let mut keys = block_keys_of_tokens(lora_task_id, unique_tokens, self.tokens_per_block);
        keys.truncate(matchable_blocks);
        match self.load_or_allocate_blocks(seq, &keys, num_context_blocks) {
            Ok(matched_tokens) => Ok(matched_tokens),
            Err(e) => {
                // Unwind the partial admission so the failure is atomic.
                let beams: Vec<Vec<BlockId>> = seq.cache_block_ids().to_vec();
                for beam in beams {
                    for block_id in beam {
                        self.release_block_ref(block_id, false);
                    }
                }
                seq.clear_cache_blocks();
                Err(e)
            }
        }
    }

    fn load_or_allocate_blocks(
        &mut self,
        seq: &mut Sequence,
        keys: &[BlockKey],
        num_context_blocks: usize,
    ) -> Result<usize, CacheError> {
        let mut search = self.root;
        let mut on_matched_path = true;
        let mut matched_tokens = 0;

        for block_pos in 0..num_context_blocks {
            let matched_child = if on_matched_path {
                keys.get(block_pos)
                    .and_then(|key| self.blocks[search].find_matching_block(key))
            } else {
                None
            };
            match matched_child {
                Some(child) => {
                    self.onboard_block(child)?;
                    // Pin it: a free matched block leaves the queue, a block
                    // shared with a live sequence just gains a reference.
                    self.free_primary.remove(child);
                    self.add_block_to_beam(child, seq, 0);
                    self.reused_blocks += 1;
                    self.alloc_total_blocks += 1;
                    matched_tokens += self.tokens_per_block;
                    search = child;
                }
                None => {
                    on_matched_path = false;
                    self.allocate_block(seq, true)?;
                }
            }
        }
        debug!(
            matched_tokens,
            num_context_blocks, "prefix match for new sequence"
        );
        Ok(matched_tokens)
    }

    /// Append one block to the sequence: a single shared block for all beams,
    /// or one per beam. May evict or offload free cached blocks.
    pub fn allocate_block(
        &mut self,
        seq: &mut Sequence,
        share_among_beams: bool,
    ) -> Result<(), CacheError> {
        if share_among_beams {
            let block_id = self.get_free_block()?;
            for beam in 0..seq.beam_width() {
                self.add_block_to_beam(block_id, seq, beam);
            }
            self.alloc_new_blocks += 1;
            self.alloc_total_blocks += 1;
        } else {
            self.check_capacity(seq.beam_width())?;
            for beam in 0..seq.beam_width() {
                let block_id = self.get_free_block()?;
                self.add_block_to_beam(block_id, seq, beam);
                self.alloc_new_blocks += 1;
                self.alloc_total_blocks += 1;
            }
        }
        Ok(())
    }

    /// Replace a block shared by all beams with per-beam copies so beams can
    /// diverge inside it. No-op if the block is not shared.
    pub fn replace_shared_block(
        &mut self,
        seq: &mut Sequence,
        block_pos: usize,
    ) -> Result<(), CacheError> {
        let shared_id = seq.beam_block_ids(0)[block_pos];
        if !self.blocks[shared_id].is_shared() {
            return Ok(());
        }
        for beam in 0..seq.beam_width() {
            let fresh = self.get_free_block()?;
            self.pool.copy_block(
                self.blocks[shared_id].pool_index(),
                self.blocks[fresh].pool_index(),
            )?;
            self.blocks[fresh].inc_ref_count();
            seq.change_cache_block(beam, block_pos, fresh);
            self.release_block_ref(shared_id, false);
            self.alloc_new_blocks += 1;
            self.alloc_total_blocks += 1;
        }
        Ok(())
    }

    fn add_block_to_beam(&mut self, block_id: BlockId, seq: &mut Sequence, beam: usize) {
        self.blocks[block_id].inc_ref_count();
        seq.add_cache_block(beam, block_id);
    }

    fn blocks_required(&self, num_context_blocks: usize, beam_width: usize) -> usize {
        if beam_width > 1 && num_context_blocks > 0 {
            num_context_blocks - 1 + beam_width
        } else {
            num_context_blocks
        }
    }

    /// Fail an admission up front when even full eviction cannot satisfy it,
    /// leaving all state untouched.
    fn check_capacity(&self, num_required: usize) -> Result<(), CacheError> {
        let available = self.num_free_blocks();
        if available < num_required {
            return Err(CacheError::OutOfCapacity {
                requested: num_required,
                available,
            });
        }
        Ok(())
    }

    /// Claim a writable primary block, evicting or offloading the best free
    /// cached block when none is untracked.
    fn get_free_block(&mut self) -> Result<BlockId, CacheError> {
        let victim = self
            .find_best_primary_block_to_free()
            .ok_or(CacheError::OutOfCapacity {
                requested: 1,
                available: 0,
            })?;
        let stored = !self.blocks[victim].unique_tokens().is_empty();
        if stored && self.onboard_blocks && !self.free_secondary.is_empty() {
            // Demote the victim: its tree position survives, only its payload
            // moves to the secondary pool. The secondary record takes over the
            // primary slot and is handed out fresh.
            let offload = self.find_best_secondary_block_to_claim();
            self.free_secondary.remove(offload);
            self.remove_from_tree(offload);
            self.pool.copy_block(
                self.blocks[victim].pool_index(),
                self.blocks[offload].pool_index(),
            )?;
            self.swap_pool_indices(victim, offload);
            self.free_primary.remove(victim);
            self.free_secondary.push_back(victim);
            return Ok(offload);
        }
        self.free_primary.remove(victim);
        self.remove_from_tree(victim);
        Ok(victim)
    }

    /// Longest-unused free primary block that has no primary-resident
    /// descendant in the tree. Freeing a block under a primary descendant
    /// would strand the descendant's prefix, so those are skipped.
    fn find_best_primary_block_to_free(&self) -> Option<BlockId> {
        self.free_primary
            .iter()
            .find(|&id| !self.has_primary_descendant(id))
            .or_else(|| self.free_primary.front())
    }

    /// Free secondary block to overwrite: prefer a leaf so no cached chain
    /// below it is cut.
    fn find_best_secondary_block_to_claim(&self) -> BlockId {
        self.free_secondary
            .iter()
            .find(|&id| self.blocks[id].is_leaf())
            .or_else(|| self.free_secondary.front())
            .expect("caller checked the secondary queue is non-empty")
    }

    fn has_primary_descendant(&self, block_id: BlockId) -> bool {
        let mut stack: Vec<BlockId> = self.blocks[block_id].next_blocks().values().copied().collect();
        while let Some(id) = stack.pop() {
            if self.blocks[id].is_primary() {
                return true;
            }
            stack.extend(self.blocks[id].next_blocks().values().copied());
        }
        false
    }

    /// Drop a block's reuse-tree presence: detach from its parent, orphan any
    /// children (their prefix is about to be overwritten), and clear its key.
    fn remove_from_tree(&mut self, block_id: BlockId) {
        if let Some(parent) = self.blocks[block_id].prev_block() {
            let key = self.blocks[block_id].block_key().clone();
            self.blocks[parent].remove_next_block(&key);
            self.blocks[block_id].set_prev_block(None);
        }
        let children: Vec<BlockId> = self.blocks[block_id].next_blocks().values().copied().collect();
        for child in &children {
            self.blocks[*child].set_prev_block(None);
        }
        let block = &mut self.blocks[block_id];
        let keys: Vec<BlockKey> = block.next_blocks().keys().cloned().collect();
        for key in keys {
            block.remove_next_block(&key);
        }
        block.set_block_key(BlockKey::default(), false);
    }

    fn swap_pool_indices(&mut self, a: BlockId, b: BlockId) {
        let index_a = self.blocks[a].pool_index();
        let index_b = self.blocks[b].pool_index();
        self.blocks[a].set_pool_index(index_b);
        self.blocks[b].set_pool_index(index_a);
    }

    /// Bring an offloaded block back into the primary pool, reserving a
    /// primary slot and swapping indices so the block id held by sequences
    /// stays valid. No-op for primary-resident blocks.
    pub fn onboard_block(&mut self, block_id: BlockId) -> Result<(), CacheError> {
        if self.blocks[block_id].is_primary() {
            return Ok(());
        }
        // Leave the secondary queue first so the eviction below cannot pick
        // this block as its offload target.
        let was_free = self.free_secondary.remove(block_id);
        let fresh = match self.get_free_block() {
            Ok(fresh) => fresh,
            Err(e) => {
                if was_free {
                    self.free_secondary.push_front(block_id);
                }
                return Err(e);
            }
        };
        self.pool.copy_block(
            self.blocks[block_id].pool_index(),
            self.blocks[fresh].pool_index(),
        )?;
        self.swap_pool_indices(block_id, fresh);
        self.free_secondary.push_back(fresh);
        if was_free {
            self.free_primary.push_back(block_id);
        }
        Ok(())
    }

    // ─── Release ─────────────────────────────────────────────────────────────

    /// Drop all of the sequence's references. With `reuse` supplied (adapter
    /// id plus beam-0 unique tokens), full blocks are linked into the reuse
    /// tree first so later requests can recover them.
    pub fn release_blocks(
        &mut self,
        seq: &mut Sequence,
        reuse: Option<(LoraTaskId, &[UniqueToken])>,
    ) {
        if let Some((lora_task_id, unique_tokens)) = reuse {
            let num_full_blocks = seq.num_tokens() / self.tokens_per_block;
            let mut keys = block_keys_of_tokens(lora_task_id, unique_tokens, self.tokens_per_block);
            keys.truncate(num_full_blocks.min(seq.num_blocks_per_beam()));
            let block_ids: Vec<BlockId> = seq.beam_block_ids(0).to_vec();
            self.store_blocks(&keys, &block_ids);
        }
        let beams: Vec<Vec<BlockId>> = seq.cache_block_ids().to_vec();
        for beam in beams {
            for block_id in beam {
                self.release_block_ref(block_id, false);
            }
        }
        seq.clear_cache_blocks();
    }

    /// Link full blocks under the tree node their prefix leads to. If a
    /// sibling with the same key already exists the earlier block wins and
    /// the descent continues through it; the duplicate stays untracked and
    /// returns to the free queue on release.
    pub fn store_blocks(&mut self, keys: &[BlockKey], block_ids: &[BlockId]) {
        let mut search = self.root;
        for (key, &block_id) in keys.iter().zip(block_ids) {
            match self.blocks[search].find_matching_block(key) {
                Some(existing) => {
                    search = existing;
                }
                None => {
                    self.blocks[block_id].set_block_key(key.clone(), true);
                    self.blocks[block_id].set_prev_block(Some(search));
                    self.blocks[search].add_next_block(key.clone(), block_id);
                    search = block_id;
                }
            }
        }
    }

    /// Store the full blocks covering a finished context phase so they are
    /// reusable from the next step, while the sequence keeps running.
    pub fn store_context_blocks(
        &mut self,
        seq: &Sequence,
        context_length: usize,
        lora_task_id: LoraTaskId,
        unique_tokens: &[UniqueToken],
    ) {
        let num_full_blocks = context_length / self.tokens_per_block;
        let mut keys = block_keys_of_tokens(lora_task_id, unique_tokens, self.tokens_per_block);
        keys.truncate(num_full_blocks.min(seq.num_blocks_per_beam()));
        let block_ids: Vec<BlockId> = seq.beam_block_ids(0).to_vec();
        self.store_blocks(&keys, &block_ids);
    }

    /// Key of the first context block absent from the reuse tree, used to
    /// decide where KV transmission must start in disaggregated serving.
    /// `None` when every full context block is already present.
    pub fn find_new_context_block(
        &self,
        lora_task_id: LoraTaskId,
        unique_tokens: &[UniqueToken],
    ) -> Option<BlockKey> {
        let keys = block_keys_of_tokens(lora_task_id, unique_tokens, self.tokens_per_block);
        let mut search = self.root;
        for key in keys {
            match self.blocks[search].find_matching_block(&key) {
                Some(child) => search = child,
                None => return Some(key),
            }
        }
        None
    }

    /// Release the trailing block of every beam, used when rewinding
    /// speculative tokens. Freed blocks go to the queue front: their
    /// contents are dead, so they should be reused first.
    pub fn release_last_block(&mut self, seq: &mut Sequence) {
        for block_id in seq.remove_last_block() {
            self.release_block_ref(block_id, true);
        }
    }

    fn release_block_ref(&mut self, block_id: BlockId, to_front: bool) {
        let block = &mut self.blocks[block_id];
        block.dec_ref_count();
        if block.has_refs() {
            return;
        }
        let queue = if block.is_primary() {
            &mut self.free_primary
        } else {
            &mut self.free_secondary
        };
        if to_front {
            queue.push_front(block_id);
        } else {
            queue.push_back(block_id);
        }
    }

    // ─── Test support ────────────────────────────────────────────────────────

    /// Sum of refcounts over every block; equals the number of block slots
    /// held by live sequences across all beams.
    #[cfg(test)]
    pub(crate) fn total_ref_count(&self) -> u32 {
        self.blocks.iter().map(Block::ref_count).sum()
    }

    #[cfg(test)]
    pub(crate) fn tree_parent_of(&self, block_id: BlockId) -> Option<BlockId> {
        self.blocks[block_id].prev_block()
    }
}
