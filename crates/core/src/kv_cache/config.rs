use candle_core::{DType, Device};

use super::error::CacheError;

/// Whether blocks cache self-attention state for the decoder's own tokens or
/// cross-attention state over the encoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    SelfAttn,
    CrossAttn,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Cache positions per block; every block spans this many tokens in
    /// every layer.
    pub tokens_per_block: usize,
    pub blocks_in_primary: usize,
    pub blocks_in_secondary: usize,
    pub max_num_sequences: usize,
    pub max_beam_width: usize,
    /// Longest span of positions a sequence keeps cached. Token counts past
    /// it wrap into existing blocks instead of allocating.
    pub max_attention_window: usize,
    /// Leading positions pinned as attention sinks.
    pub sink_token_length: usize,
    /// Reserve one extra block per beam so generation can run a full block
    /// past the attention window before wrapping.
    pub use_one_more_block: bool,
    /// Track full blocks in the reuse tree so later requests with a shared
    /// prefix skip recomputation.
    pub enable_block_reuse: bool,
    /// Copy offload victims into the secondary pool instead of dropping
    /// their contents, and copy them back on reuse.
    pub onboard_blocks: bool,
    pub cache_type: CacheType,
    pub dtype: DType,
    pub device: Device,
    /// Device backing the secondary pool, normally host memory.
    pub secondary_device: Device,
}

impl CacheConfig {
    /// Derive primary/secondary block counts from byte budgets, keeping all
    /// other dimensions explicit.
    #[allow(clippy::too_many_arguments)]
    pub fn from_memory_budget(
        primary_budget_bytes: usize,
        secondary_budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        tokens_per_block: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        let blocks_in_primary = Self::blocks_for_budget(
            primary_budget_bytes,
            num_layers,
            num_kv_heads,
            head_dim,
            tokens_per_block,
            dtype,
        );
        let blocks_in_secondary = Self::blocks_for_budget(
            secondary_budget_bytes,
            num_layers,
            num_kv_heads,
            head_dim,
            tokens_per_block,
            dtype,
        );
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            tokens_per_block,
            blocks_in_primary,
            blocks_in_secondary,
            max_num_sequences: 1,
            max_beam_width: 1,
            max_attention_window: blocks_in_primary.max(1) * tokens_per_block,
            sink_token_length: 0,
            use_one_more_block: false,
            enable_block_reuse: false,
            onboard_blocks: true,
            cache_type: CacheType::SelfAttn,
            dtype,
            device,
            secondary_device: Device::Cpu,
        }
    }

    /// Bytes of K and V state one token occupies across all layers.
    pub fn cache_size_per_token(&self) -> usize {
        2 * self.num_layers * self.num_kv_heads * self.head_dim * self.dtype.size_in_bytes()
    }

    /// Bytes one block occupies across all layers.
    pub fn bytes_per_block(&self) -> usize {
        self.cache_size_per_token() * self.tokens_per_block
    }

    /// How many blocks a byte budget pays for.
    pub fn blocks_for_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        tokens_per_block: usize,
        dtype: DType,
    ) -> usize {
        let per_block =
            2 * num_layers * num_kv_heads * head_dim * dtype.size_in_bytes() * tokens_per_block;
        if per_block == 0 {
            0
        } else {
            budget_bytes / per_block
        }
    }

    /// Padding that rounds the sink tokens up to a whole block, so the sink
    /// block never mixes sink and rotating positions.
    pub fn sink_bubble_length(sink_token_length: usize, tokens_per_block: usize) -> usize {
        (tokens_per_block - sink_token_length % tokens_per_block) % tokens_per_block
    }

    /// Largest attention window the primary pool can serve for every beam
    /// simultaneously.
    pub fn max_attention_window_upper_bound(
        blocks_in_primary: usize,
        tokens_per_block: usize,
        max_beam_width: usize,
        sink_token_length: usize,
        use_one_more_block: bool,
    ) -> usize {
        let tokens_per_beam = (blocks_in_primary / max_beam_width) * tokens_per_block;
        let bubble = Self::sink_bubble_length(sink_token_length, tokens_per_block);
        let extra = if use_one_more_block {
            tokens_per_block
        } else {
            0
        };
        tokens_per_beam.saturating_sub(bubble + extra)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.tokens_per_block == 0 {
            return Err(CacheError::InvalidArgument(
                "tokens_per_block must be positive".into(),
            ));
        }
        if self.num_layers == 0 || self.num_kv_heads == 0 || self.head_dim == 0 {
            return Err(CacheError::InvalidArgument(
                "model dimensions must be positive".into(),
            ));
        }
        if self.max_num_sequences == 0 {
            return Err(CacheError::InvalidArgument(
                "max_num_sequences must be positive".into(),
            ));
        }
        if self.max_beam_width == 0 {
            return Err(CacheError::InvalidArgument(
                "max_beam_width must be positive".into(),
            ));
        }
        if self.max_attention_window == 0 {
            return Err(CacheError::InvalidArgument(
                "max_attention_window must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Small CPU-backed configuration shared by unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 8,
            tokens_per_block: 4,
            blocks_in_primary: 16,
            blocks_in_secondary: 0,
            max_num_sequences: 4,
            max_beam_width: 1,
            max_attention_window: 64,
            sink_token_length: 0,
            use_one_more_block: false,
            enable_block_reuse: false,
            onboard_blocks: true,
            cache_type: CacheType::SelfAttn,
            dtype: DType::F32,
            device: Device::Cpu,
            secondary_device: Device::Cpu,
        }
    }
}
