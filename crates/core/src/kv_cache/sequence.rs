//! Per-sequence block bookkeeping.
//!
//! A sequence owns one ordered block-id list per beam. Beams share the
//! prompt's blocks (the same id appears in every beam's list) and diverge
//! once generation writes per-beam state.

use super::block::BlockId;

pub struct Sequence {
    /// Slot index in the cache manager's sequence table.
    seq_slot: usize,
    /// Tokens currently occupying cache positions, across prompt and
    /// generation.
    num_tokens: usize,
    beam_width: usize,
    /// Block ids per beam, in token-position order.
    cache_block_ids: Vec<Vec<BlockId>>,
}

impl Sequence {
    pub fn new(seq_slot: usize, num_tokens: usize, beam_width: usize) -> Self {
        Self {
            seq_slot,
            num_tokens,
            beam_width,
            cache_block_ids: vec![Vec::new(); beam_width],
        }
    }

    pub fn seq_slot(&self) -> usize {
        self.seq_slot
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn add_tokens(&mut self, n: usize) {
        self.num_tokens += n;
    }

    pub fn remove_tokens(&mut self, n: usize) {
        debug_assert!(n <= self.num_tokens, "removing more tokens than stored");
        self.num_tokens -= n;
    }

    pub fn cache_block_ids(&self) -> &[Vec<BlockId>] {
        &self.cache_block_ids
    }

    pub fn beam_block_ids(&self, beam: usize) -> &[BlockId] {
        &self.cache_block_ids[beam]
    }

    /// Blocks held by beam 0; beams always hold equally long lists, so this
    /// is the per-beam block count.
    pub fn num_blocks_per_beam(&self) -> usize {
        self.cache_block_ids.first().map_or(0, Vec::len)
    }

    pub fn add_cache_block(&mut self, beam: usize, block_id: BlockId) {
        self.cache_block_ids[beam].push(block_id);
    }

    pub fn change_cache_block(&mut self, beam: usize, block_pos: usize, block_id: BlockId) {
        self.cache_block_ids[beam][block_pos] = block_id;
    }

    pub fn clear_cache_blocks(&mut self) {
        for beam in &mut self.cache_block_ids {
            beam.clear();
        }
    }

    /// Drop the trailing block of every beam, returning the dropped ids so
    /// the manager can release them.
    pub fn remove_last_block(&mut self) -> Vec<BlockId> {
        self.cache_block_ids
            .iter_mut()
            .filter_map(Vec::pop)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sequence_has_empty_beams() {
        let seq = Sequence::new(3, 10, 2);
        assert_eq!(seq.seq_slot(), 3);
        assert_eq!(seq.num_tokens(), 10);
        assert_eq!(seq.beam_width(), 2);
        assert_eq!(seq.cache_block_ids().len(), 2);
        assert_eq!(seq.num_blocks_per_beam(), 0);
    }

    #[test]
    fn token_accounting() {
        let mut seq = Sequence::new(0, 5, 1);
        seq.add_tokens(3);
        assert_eq!(seq.num_tokens(), 8);
        seq.remove_tokens(2);
        assert_eq!(seq.num_tokens(), 6);
    }

    #[test]
    fn shared_blocks_appear_in_every_beam() {
        let mut seq = Sequence::new(0, 0, 3);
        for beam in 0..3 {
            seq.add_cache_block(beam, 7);
        }
        assert!(seq
            .cache_block_ids()
            .iter()
            .all(|beam| beam == &[7usize]));
        assert_eq!(seq.num_blocks_per_beam(), 1);
    }

    #[test]
    fn change_cache_block_rewires_one_beam() {
        let mut seq = Sequence::new(0, 0, 2);
        seq.add_cache_block(0, 4);
        seq.add_cache_block(1, 4);
        seq.change_cache_block(1, 0, 9);
        assert_eq!(seq.beam_block_ids(0), &[4]);
        assert_eq!(seq.beam_block_ids(1), &[9]);
    }

    #[test]
    fn remove_last_block_pops_every_beam() {
        let mut seq = Sequence::new(0, 0, 2);
        seq.add_cache_block(0, 1);
        seq.add_cache_block(1, 2);
        seq.add_cache_block(0, 3);
        seq.add_cache_block(1, 4);
        let dropped = seq.remove_last_block();
        assert_eq!(dropped, vec![3, 4]);
        assert_eq!(seq.num_blocks_per_beam(), 1);
    }

    #[test]
    fn clear_cache_blocks_keeps_beam_count() {
        let mut seq = Sequence::new(0, 0, 2);
        seq.add_cache_block(0, 1);
        seq.add_cache_block(1, 1);
        seq.clear_cache_blocks();
        assert_eq!(seq.cache_block_ids().len(), 2);
        assert_eq!(seq.num_blocks_per_beam(), 0);
    }
}
