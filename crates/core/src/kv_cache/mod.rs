//! Paged KV cache with prefix-sharing reuse.
//!
//! [`KVCacheManager`] is the facade the serving loop drives: it owns the
//! sequence table and delegates block bookkeeping to the
//! [`BlockManager`]. One instance manages self-attention cache; a second
//! instance with [`CacheType::CrossAttn`] manages cross-attention cache for
//! encoder-decoder models.

pub mod block;
pub mod block_manager;
pub mod block_pool;
pub mod config;
pub mod error;
pub mod free_block_queue;
pub mod sequence;

pub use block::{BlockId, BlockKey, LoraTaskId, TokenExtraId, TokenId, UniqueToken};
pub use block_manager::BlockManager;
pub use block_pool::{BlockPool, KvCacheIndex};
pub use config::{CacheConfig, CacheType};
pub use error::CacheError;
pub use sequence::Sequence;

use candle_core::Tensor;
use serde::Serialize;

use crate::request::Request;

/// Counters surfaced to the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct KvCacheStats {
    pub max_num_blocks: usize,
    pub free_num_blocks: usize,
    pub used_num_blocks: usize,
    pub tokens_per_block: usize,
    pub alloc_total_blocks: usize,
    pub alloc_new_blocks: usize,
    pub reused_blocks: usize,
}

pub struct KVCacheManager {
    max_beam_width: usize,
    max_blocks_per_seq: usize,
    /// Padding that rounds the sink tokens up to a whole block.
    sink_bubble_length: usize,
    /// Cache positions per sequence including the bubble; token counts past
    /// it wrap instead of allocating.
    max_token_num: usize,
    tokens_per_block: usize,
    block_manager: BlockManager,
    sequences: Vec<Option<Sequence>>,
    enable_block_reuse: bool,
    cache_type: CacheType,
}

impl KVCacheManager {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let sink_bubble_length =
            CacheConfig::sink_bubble_length(config.sink_token_length, config.tokens_per_block);
        let one_more = if config.use_one_more_block {
            config.tokens_per_block
        } else {
            0
        };
        let max_token_num = config.max_attention_window + sink_bubble_length + one_more;
        Ok(Self {
            max_beam_width: config.max_beam_width,
            max_blocks_per_seq: max_token_num.div_ceil(config.tokens_per_block),
            sink_bubble_length,
            max_token_num,
            tokens_per_block: config.tokens_per_block,
            block_manager: BlockManager::new(config)?,
            sequences: (0..config.max_num_sequences).map(|_| None).collect(),
            enable_block_reuse: config.enable_block_reuse,
            cache_type: config.cache_type,
        })
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn max_num_blocks(&self) -> usize {
        self.block_manager.max_num_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_manager.num_free_blocks()
    }

    pub fn used_num_blocks(&self) -> usize {
        self.block_manager.num_allocated_blocks()
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn is_enable_block_reuse(&self) -> bool {
        self.enable_block_reuse
    }

    pub fn is_cross_kv(&self) -> bool {
        self.cache_type == CacheType::CrossAttn
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            max_num_blocks: self.block_manager.max_num_blocks(),
            free_num_blocks: self.block_manager.num_free_blocks(),
            used_num_blocks: self.block_manager.num_allocated_blocks(),
            tokens_per_block: self.tokens_per_block,
            alloc_total_blocks: self.block_manager.num_alloc_total_blocks(),
            alloc_new_blocks: self.block_manager.num_alloc_new_blocks(),
            reused_blocks: self.block_manager.num_reused_blocks(),
        }
    }

    /// Primary and secondary pool tensors, handed to the forward pass
    /// together with the offset tables.
    pub fn pool_tensors(&self) -> (&Tensor, Option<&Tensor>) {
        let pool = self.block_manager.pool();
        (pool.primary_pool(), pool.secondary_pool())
    }

    fn seq(&self, seq_slot: usize) -> Result<&Sequence, CacheError> {
        self.sequences
            .get(seq_slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))
    }

    pub fn get_sequence(&self, seq_slot: usize) -> Result<&Sequence, CacheError> {
        self.seq(seq_slot)
    }

    /// Token count after adding the sink bubble and capping at the attention
    /// window; this is what block demand is computed from.
    fn capped_tokens(&self, num_tokens: usize) -> usize {
        (num_tokens + self.sink_bubble_length).min(self.max_token_num)
    }

    fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        self.capped_tokens(num_tokens).div_ceil(self.tokens_per_block)
    }

    // ─── Sequence lifecycle ──────────────────────────────────────────────────

    /// Admit a sequence at `seq_slot`, reserving blocks for `input_length`
    /// tokens of context. With reuse enabled and a request supplied, leading
    /// full prompt blocks are recovered from the reuse tree and the match
    /// length is recorded on the request as its prepopulated prompt length.
    pub fn add_sequence(
        &mut self,
        seq_slot: usize,
        input_length: usize,
        beam_width: usize,
        request: Option<&mut Request>,
    ) -> Result<(), CacheError> {
        if seq_slot >= self.sequences.len() {
            return Err(CacheError::InvalidArgument(format!(
                "sequence slot {seq_slot} out of range ({} slots)",
                self.sequences.len()
            )));
        }
        if self.sequences[seq_slot].is_some() {
            return Err(CacheError::InvalidArgument(format!(
                "sequence slot {seq_slot} already occupied"
            )));
        }
        if beam_width == 0 || beam_width > self.max_beam_width {
            return Err(CacheError::InvalidArgument(format!(
                "beam width {beam_width} outside [1, {}]",
                self.max_beam_width
            )));
        }
        if input_length == 0 {
            return Err(CacheError::InvalidArgument(
                "input length must be positive".into(),
            ));
        }

        let num_context_blocks = self.blocks_for_tokens(input_length);
        let mut seq = Sequence::new(seq_slot, input_length, beam_width);
        let use_reuse = self.enable_block_reuse
            && beam_width == 1
            && self.cache_type == CacheType::SelfAttn
            && request.is_some();
        match request {
            Some(req) if use_reuse => {
                let lora_task_id = req.lora_task_id().unwrap_or(0);
                let unique_tokens = req.unique_tokens(0);
                let window = &unique_tokens[..input_length.min(unique_tokens.len())];
                let prepopulated = self.block_manager.add_sequence_with_reuse(
                    &mut seq,
                    input_length,
                    num_context_blocks,
                    lora_task_id,
                    window,
                )?;
                req.set_prepopulated_prompt_len(prepopulated);
                req.set_seq_slot(Some(seq_slot));
            }
            other => {
                self.block_manager.add_sequence(&mut seq, num_context_blocks)?;
                if let Some(req) = other {
                    req.set_seq_slot(Some(seq_slot));
                }
            }
        }
        self.sequences[seq_slot] = Some(seq);
        Ok(())
    }

    /// Account one generated position per beam, allocating a block per beam
    /// when the tail block is full. Past the attention window nothing is
    /// allocated; positions wrap into existing blocks.
    pub fn add_token(&mut self, seq_slot: usize) -> Result<(), CacheError> {
        let max_token_num = self.max_token_num;
        let sink_bubble_length = self.sink_bubble_length;
        let tokens_per_block = self.tokens_per_block;
        let seq = self
            .sequences
            .get_mut(seq_slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        seq.add_tokens(1);
        let capped = (seq.num_tokens() + sink_bubble_length).min(max_token_num);
        let needed = capped.div_ceil(tokens_per_block);
        if needed > seq.num_blocks_per_beam() {
            let share = seq.beam_width() == 1;
            self.block_manager.allocate_block(seq, share)?;
        }
        Ok(())
    }

    /// Grow the sequence by `num_tokens` context positions beyond its
    /// admission-time reservation (encoder-driven growth, sliding-window
    /// refill), allocating beam-shared blocks as needed. Chunked ingestion
    /// of an already-reserved context needs no call here; the chunk cursor
    /// lives on the request.
    pub fn add_context_tokens(
        &mut self,
        seq_slot: usize,
        num_tokens: usize,
    ) -> Result<(), CacheError> {
        let max_token_num = self.max_token_num;
        let sink_bubble_length = self.sink_bubble_length;
        let tokens_per_block = self.tokens_per_block;
        let seq = self
            .sequences
            .get_mut(seq_slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        seq.add_tokens(num_tokens);
        let capped = (seq.num_tokens() + sink_bubble_length).min(max_token_num);
        let needed = capped.div_ceil(tokens_per_block);
        while seq.num_blocks_per_beam() < needed {
            self.block_manager.allocate_block(seq, true)?;
        }
        Ok(())
    }

    /// Roll back one position per beam, releasing tail blocks as they empty.
    pub fn remove_token(&mut self, seq_slot: usize) -> Result<(), CacheError> {
        let max_token_num = self.max_token_num;
        let sink_bubble_length = self.sink_bubble_length;
        let tokens_per_block = self.tokens_per_block;
        let seq = self
            .sequences
            .get_mut(seq_slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        if seq.num_tokens() == 0 {
            return Err(CacheError::IllegalState(
                "cannot remove a token from an empty sequence".into(),
            ));
        }
        seq.remove_tokens(1);
        let capped = (seq.num_tokens() + sink_bubble_length).min(max_token_num);
        let needed = capped.div_ceil(tokens_per_block);
        while seq.num_blocks_per_beam() > needed {
            self.block_manager.release_last_block(seq);
        }
        Ok(())
    }

    /// Roll back `rewind_length` positions, used when speculative tokens are
    /// rejected.
    pub fn rewind_kv_cache(
        &mut self,
        seq_slot: usize,
        rewind_length: usize,
    ) -> Result<(), CacheError> {
        for _ in 0..rewind_length {
            self.remove_token(seq_slot)?;
        }
        Ok(())
    }

    /// Release the sequence's blocks. With reuse enabled and a request
    /// supplied, full blocks enter the reuse tree first; pass `None` on
    /// cancellation so nothing is stored.
    pub fn remove_sequence(
        &mut self,
        seq_slot: usize,
        request: Option<&Request>,
    ) -> Result<(), CacheError> {
        let mut seq = self
            .sequences
            .get_mut(seq_slot)
            .and_then(Option::take)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        let reuse = request
            .filter(|_| {
                self.enable_block_reuse
                    && seq.beam_width() == 1
                    && self.cache_type == CacheType::SelfAttn
            })
            .map(|req| (req.lora_task_id().unwrap_or(0), req.unique_tokens(0)));
        self.block_manager.release_blocks(&mut seq, reuse);
        Ok(())
    }

    /// Store the full blocks of a finished context phase so they are
    /// reusable while this sequence is still generating.
    pub fn store_context_blocks(
        &mut self,
        seq_slot: usize,
        request: &Request,
    ) -> Result<(), CacheError> {
        if !self.enable_block_reuse || self.cache_type != CacheType::SelfAttn {
            return Ok(());
        }
        let seq = self
            .sequences
            .get(seq_slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        if seq.beam_width() != 1 {
            return Ok(());
        }
        self.block_manager.store_context_blocks(
            seq,
            request.prompt_len(),
            request.lora_task_id().unwrap_or(0),
            request.unique_tokens(0),
        );
        Ok(())
    }

    /// Key of the first context block missing from the reuse tree; `None`
    /// when the whole (full-block) context is already cached.
    pub fn find_new_context_block(&self, request: &Request) -> Option<BlockKey> {
        self.block_manager.find_new_context_block(
            request.lora_task_id().unwrap_or(0),
            request.unique_tokens(0),
        )
    }

    /// Give each beam a private copy of a context block all beams share, so
    /// decode can write into it.
    pub fn replace_shared_block(
        &mut self,
        seq_slot: usize,
        block_pos: usize,
    ) -> Result<(), CacheError> {
        let seq = self
            .sequences
            .get_mut(seq_slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        self.block_manager.replace_shared_block(seq, block_pos)
    }

    // ─── Scheduling simulation ───────────────────────────────────────────────

    pub fn start_scheduling(&mut self) {
        self.block_manager.start_scheduling();
    }

    pub fn scheduling_remove_sequence(&mut self, seq_slot: usize) -> Result<(), CacheError> {
        let seq = self
            .sequences
            .get(seq_slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| CacheError::IllegalState(format!("no sequence at slot {seq_slot}")))?;
        self.block_manager.scheduling_release_blocks(seq);
        Ok(())
    }

    pub fn scheduling_has_free_blocks(&self, num_required: usize) -> bool {
        self.block_manager.scheduling_has_free_blocks(num_required)
    }

    // ─── Admission arithmetic ────────────────────────────────────────────────

    /// Blocks needed to advance the request by one iteration (or two with
    /// lookahead), before any of them are allocated.
    pub fn needed_blocks_one_step(&self, request: &Request, two_steps_look_ahead: bool) -> usize {
        if request.is_context_init_state()
            || request.is_encoder_init_state()
            || request.is_disagg_generation_init_state()
        {
            let context_tokens = request.prompt_len() + request.num_draft_tokens();
            let context_blocks = self.blocks_for_tokens(context_tokens);
            let beam_tail = if request.beam_width() > 1 {
                request.beam_width() - 1
            } else {
                0
            };
            context_blocks + beam_tail
        } else {
            let current = request.max_beam_num_tokens();
            let step = 1 + usize::from(two_steps_look_ahead) + request.num_draft_tokens();
            let crossings = self
                .blocks_for_tokens(current + step)
                .saturating_sub(self.blocks_for_tokens(current));
            crossings * request.beam_width()
        }
    }

    /// Blocks still needed to run the request to its full generation budget,
    /// excluding blocks it already holds.
    pub fn remaining_blocks_to_completion(&self, request: &Request) -> usize {
        let prompt = request.prompt_len();
        let total_tokens = prompt + request.max_new_tokens() + request.num_draft_tokens();
        let shared_context_blocks = self.capped_tokens(prompt) / self.tokens_per_block;
        let total_blocks = self.blocks_for_tokens(total_tokens);
        let per_beam_blocks = total_blocks - shared_context_blocks;
        let needed = shared_context_blocks + per_beam_blocks * request.beam_width();

        let held = request
            .seq_slot()
            .and_then(|slot| self.seq(slot).ok())
            .map(|seq| {
                let mut unique: Vec<BlockId> =
                    seq.cache_block_ids().iter().flatten().copied().collect();
                unique.sort_unstable();
                unique.dedup();
                unique.len()
            })
            .unwrap_or(0);
        needed.saturating_sub(held)
    }

    // ─── Offset tables ───────────────────────────────────────────────────────

    /// Current pool locations of the sequence's blocks, one row per beam.
    /// Entries go stale when a block is onboarded, so materialise the table
    /// after onboarding and before launching the forward pass.
    pub fn block_offsets(&self, seq_slot: usize) -> Result<Vec<Vec<KvCacheIndex>>, CacheError> {
        let seq = self.seq(seq_slot)?;
        Ok(seq
            .cache_block_ids()
            .iter()
            .map(|beam| {
                beam.iter()
                    .map(|&block_id| self.block_manager.pool_index_of(block_id))
                    .collect()
            })
            .collect())
    }

    /// Offset tables for a whole batch, indexed `[batch][beam][block]`.
    pub fn batch_block_offsets(
        &self,
        seq_slots: &[usize],
    ) -> Result<Vec<Vec<Vec<KvCacheIndex>>>, CacheError> {
        seq_slots
            .iter()
            .map(|&slot| self.block_offsets(slot))
            .collect()
    }

    /// Fill the attention kernel's page table for one sequence: K and V
    /// rows per beam, `max_blocks_per_seq` entries each. Returns the block
    /// count of the longest beam.
    pub fn copy_block_offsets(
        &self,
        output: &mut [u32],
        seq_slot: usize,
    ) -> Result<usize, CacheError> {
        let seq = self.seq(seq_slot)?;
        let stride = self.max_blocks_per_seq;
        let expected = seq.beam_width() * 2 * stride;
        if output.len() < expected {
            return Err(CacheError::InvalidArgument(format!(
                "offset table too small: {} entries, need {expected}",
                output.len()
            )));
        }
        let mut max_block_count = 0;
        for (beam, beam_ids) in seq.cache_block_ids().iter().enumerate() {
            max_block_count = max_block_count.max(beam_ids.len());
            for (block_pos, &block_id) in beam_ids.iter().enumerate() {
                let index = self.block_manager.pool_index_of(block_id);
                output[(beam * 2) * stride + block_pos] = index.k_or_v(0);
                output[(beam * 2 + 1) * stride + block_pos] = index.k_or_v(1);
            }
        }
        Ok(max_block_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, RequestOptions};

    fn test_manager(primary: usize, reuse: bool) -> KVCacheManager {
        let config = CacheConfig {
            blocks_in_primary: primary,
            enable_block_reuse: reuse,
            ..CacheConfig::for_tests()
        };
        KVCacheManager::new(&config).unwrap()
    }

    fn test_request(id: u64, tokens: Vec<u32>, max_new_tokens: usize) -> Request {
        Request::new(id, tokens, max_new_tokens, RequestOptions::default()).unwrap()
    }

    #[test]
    fn stats_conservation_invariant() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 9, 1, None).unwrap();
        let stats = mgr.stats();
        assert_eq!(
            stats.free_num_blocks + stats.used_num_blocks,
            stats.max_num_blocks
        );
        assert_eq!(stats.tokens_per_block, 4);
        mgr.remove_sequence(0, None).unwrap();
        let stats = mgr.stats();
        assert_eq!(stats.free_num_blocks, stats.max_num_blocks);
    }

    #[test]
    fn add_token_allocates_only_on_block_boundary() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 9, 1, None).unwrap();
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 3);

        // Tokens 10..12 fill the tail block; the 13th needs a fourth.
        for _ in 0..3 {
            mgr.add_token(0).unwrap();
            assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 3);
        }
        mgr.add_token(0).unwrap();
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 4);
    }

    #[test]
    fn add_token_stops_allocating_past_attention_window() {
        let config = CacheConfig {
            blocks_in_primary: 8,
            max_attention_window: 8,
            ..CacheConfig::for_tests()
        };
        let mut mgr = KVCacheManager::new(&config).unwrap();
        mgr.add_sequence(0, 8, 1, None).unwrap();
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 2);
        for _ in 0..6 {
            mgr.add_token(0).unwrap();
        }
        // Positions wrap; no third block.
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 2);
    }

    #[test]
    fn reuse_roundtrip_through_facade() {
        let mut mgr = test_manager(16, true);

        let mut req_a = test_request(1, vec![1, 2, 3, 4, 5, 6, 7, 8, 9], 4);
        mgr.add_sequence(0, req_a.prompt_len(), 1, Some(&mut req_a))
            .unwrap();
        assert_eq!(req_a.prepopulated_prompt_len(), 0);
        assert_eq!(req_a.seq_slot(), Some(0));
        for _ in 0..4 {
            req_a.add_new_token(100, 0);
            mgr.add_token(0).unwrap();
        }
        mgr.remove_sequence(0, Some(&req_a)).unwrap();

        let new_before = mgr.stats().alloc_new_blocks;
        let mut req_b = test_request(2, vec![1, 2, 3, 4, 5, 6, 7, 8, 42], 4);
        mgr.add_sequence(1, req_b.prompt_len(), 1, Some(&mut req_b))
            .unwrap();
        assert_eq!(req_b.prepopulated_prompt_len(), 8);
        // Exactly one fresh partial block beyond the two matched ones.
        assert_eq!(mgr.stats().alloc_new_blocks, new_before + 1);
        assert_eq!(mgr.stats().reused_blocks, 2);
    }

    #[test]
    fn extra_ids_prevent_reuse_through_facade() {
        let mut mgr = test_manager(16, true);

        let mut req_a = Request::new(
            1,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
            4,
            RequestOptions {
                input_token_extra_ids: Some(vec![7; 9]),
                ..RequestOptions::default()
            },
        )
        .unwrap();
        mgr.add_sequence(0, 9, 1, Some(&mut req_a)).unwrap();
        mgr.remove_sequence(0, Some(&req_a)).unwrap();

        let mut req_b = Request::new(
            2,
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
            4,
            RequestOptions {
                input_token_extra_ids: Some(vec![0; 9]),
                ..RequestOptions::default()
            },
        )
        .unwrap();
        mgr.add_sequence(1, 9, 1, Some(&mut req_b)).unwrap();
        assert_eq!(req_b.prepopulated_prompt_len(), 0);
    }

    #[test]
    fn add_context_tokens_grows_reservation() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 4, 1, None).unwrap();
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 1);
        mgr.add_context_tokens(0, 6).unwrap();
        let seq = mgr.get_sequence(0).unwrap();
        assert_eq!(seq.num_tokens(), 10);
        assert_eq!(seq.num_blocks_per_beam(), 3);
    }

    #[test]
    fn remove_token_releases_empty_tail_blocks() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 9, 1, None).unwrap();
        assert_eq!(mgr.num_free_blocks(), 13);
        // 9 tokens in 3 blocks; dropping one empties the third block.
        mgr.remove_token(0).unwrap();
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 2);
        assert_eq!(mgr.num_free_blocks(), 14);
        mgr.remove_token(0).unwrap();
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 2);
    }

    #[test]
    fn rewind_kv_cache_drops_speculative_tail() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 8, 1, None).unwrap();
        for _ in 0..5 {
            mgr.add_token(0).unwrap();
        }
        assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 4);
        mgr.rewind_kv_cache(0, 5).unwrap();
        let seq = mgr.get_sequence(0).unwrap();
        assert_eq!(seq.num_tokens(), 8);
        assert_eq!(seq.num_blocks_per_beam(), 2);
    }

    #[test]
    fn admission_failure_leaves_slot_empty() {
        let mut mgr = test_manager(2, false);
        let err = mgr.add_sequence(0, 20, 1, None).unwrap_err();
        assert!(matches!(err, CacheError::OutOfCapacity { .. }));
        assert!(mgr.get_sequence(0).is_err());
        assert_eq!(mgr.num_free_blocks(), 2);
        // The slot is reusable afterwards.
        mgr.add_sequence(0, 4, 1, None).unwrap();
    }

    #[test]
    fn duplicate_slot_rejected() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 4, 1, None).unwrap();
        assert!(matches!(
            mgr.add_sequence(0, 4, 1, None),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn copy_block_offsets_layout() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 9, 1, None).unwrap();
        let stride = mgr.max_blocks_per_seq();
        let mut table = vec![u32::MAX; 2 * stride];
        let max_blocks = mgr.copy_block_offsets(&mut table, 0).unwrap();
        assert_eq!(max_blocks, 3);

        let offsets = mgr.block_offsets(0).unwrap();
        for (pos, index) in offsets[0].iter().enumerate() {
            assert_eq!(table[pos], index.k_or_v(0));
            assert_eq!(table[stride + pos], index.k_or_v(1));
        }
        // Unused tail entries untouched.
        assert_eq!(table[3], u32::MAX);
    }

    #[test]
    fn copy_block_offsets_rejects_short_buffer() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 9, 1, None).unwrap();
        let mut table = vec![0u32; 3];
        assert!(matches!(
            mgr.copy_block_offsets(&mut table, 0),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn needed_blocks_one_step_for_context_and_decode() {
        let mut mgr = test_manager(16, false);
        let mut req = test_request(1, vec![0; 9], 8);
        // Context phase: all context blocks.
        assert_eq!(mgr.needed_blocks_one_step(&req, false), 3);

        mgr.add_sequence(0, 9, 1, Some(&mut req)).unwrap();
        req.state = crate::request::RequestState::GenerationInProgress;
        // 9 tokens held; the 10th fits into the tail block.
        assert_eq!(mgr.needed_blocks_one_step(&req, false), 0);
        for _ in 0..3 {
            req.add_new_token(1, 0);
        }
        // 12 tokens: the 13th crosses a boundary.
        assert_eq!(mgr.needed_blocks_one_step(&req, false), 1);
        assert_eq!(mgr.needed_blocks_one_step(&req, true), 1);
    }

    #[test]
    fn remaining_blocks_to_completion_excludes_held_blocks() {
        let mut mgr = test_manager(16, false);
        let mut req = test_request(1, vec![0; 9], 7);
        // 9 prompt + 7 generation = 16 tokens = 4 blocks, none held yet.
        assert_eq!(mgr.remaining_blocks_to_completion(&req), 4);
        mgr.add_sequence(0, 9, 1, Some(&mut req)).unwrap();
        // 3 context blocks held.
        assert_eq!(mgr.remaining_blocks_to_completion(&req), 1);
    }

    #[test]
    fn scheduling_simulation_through_facade() {
        let mut mgr = test_manager(16, false);
        mgr.add_sequence(0, 9, 1, None).unwrap();
        mgr.start_scheduling();
        assert!(!mgr.scheduling_has_free_blocks(16));
        mgr.scheduling_remove_sequence(0).unwrap();
        assert!(mgr.scheduling_has_free_blocks(16));
        assert_eq!(mgr.num_free_blocks(), 13);
    }

    #[test]
    fn stats_serialize_to_json() {
        let mgr = test_manager(4, false);
        let json = serde_json::to_value(mgr.stats()).unwrap();
        assert_eq!(json["max_num_blocks"], 4);
        assert_eq!(json["free_num_blocks"], 4);
        assert_eq!(json["tokens_per_block"], 4);
    }
}
