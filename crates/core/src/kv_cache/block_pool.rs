//! Memory pools backing the paged KV cache.
//!
//! Two contiguous slabs: a primary pool in fast (device) memory holding all
//! writable blocks, and an optional secondary pool in slower memory that
//! full, unreferenced blocks can be offloaded to. Each slab is one tensor of
//! shape `[num_blocks, num_layers, 2, num_kv_heads * tokens_per_block *
//! head_dim]` (K and V interleaved on dim 2), so a block is a single row and
//! onboarding is a row copy between slabs.

use candle_core::Tensor;

use super::config::CacheConfig;
use super::error::CacheError;

/// Location of a block's payload: pool choice and offset within that pool,
/// packed into 32 bits the way attention kernels consume page tables. The
/// high bit selects the secondary pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheIndex(u32);

impl KvCacheIndex {
    const SECONDARY_BIT: u32 = 1 << 31;

    pub fn primary(offset: u32) -> Self {
        debug_assert_eq!(offset & Self::SECONDARY_BIT, 0);
        Self(offset)
    }

    pub fn secondary(offset: u32) -> Self {
        debug_assert_eq!(offset & Self::SECONDARY_BIT, 0);
        Self(offset | Self::SECONDARY_BIT)
    }

    pub fn is_primary(self) -> bool {
        self.0 & Self::SECONDARY_BIT == 0
    }

    /// Row offset within the owning pool.
    pub fn pool_offset(self) -> usize {
        (self.0 & !Self::SECONDARY_BIT) as usize
    }

    /// Index of the K (`field 0`) or V (`field 1`) half of the block, with
    /// the pool bit preserved. This is what offset tables are filled with.
    pub fn k_or_v(self, field: u32) -> u32 {
        debug_assert!(field < 2);
        let flag = self.0 & Self::SECONDARY_BIT;
        flag | ((self.0 & !Self::SECONDARY_BIT) * 2 + field)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Owns the primary and secondary slabs and performs block copies between
/// them. Pure storage: which block lives where is the block manager's
/// business.
pub struct BlockPool {
    primary: Tensor,
    secondary: Option<Tensor>,
    num_primary_blocks: usize,
    num_secondary_blocks: usize,
    /// Elements per block row: `num_layers * 2 * num_kv_heads *
    /// tokens_per_block * head_dim`.
    elems_per_block: usize,
    bytes_per_block: usize,
}

impl BlockPool {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        if config.blocks_in_primary == 0 {
            return Err(CacheError::InvalidArgument(
                "primary pool must hold at least one block".into(),
            ));
        }
        let row = config.num_kv_heads * config.tokens_per_block * config.head_dim;
        let primary = Tensor::zeros(
            (config.blocks_in_primary, config.num_layers, 2, row),
            config.dtype,
            &config.device,
        )?;
        let secondary = if config.blocks_in_secondary > 0 {
            Some(Tensor::zeros(
                (config.blocks_in_secondary, config.num_layers, 2, row),
                config.dtype,
                &config.secondary_device,
            )?)
        } else {
            None
        };
        Ok(Self {
            primary,
            secondary,
            num_primary_blocks: config.blocks_in_primary,
            num_secondary_blocks: config.blocks_in_secondary,
            elems_per_block: config.num_layers * 2 * row,
            bytes_per_block: config.bytes_per_block(),
        })
    }

    pub fn num_primary_blocks(&self) -> usize {
        self.num_primary_blocks
    }

    pub fn num_secondary_blocks(&self) -> usize {
        self.num_secondary_blocks
    }

    pub fn bytes_per_block(&self) -> usize {
        self.bytes_per_block
    }

    /// Raw primary slab, handed to the forward pass together with the offset
    /// tables.
    pub fn primary_pool(&self) -> &Tensor {
        &self.primary
    }

    pub fn secondary_pool(&self) -> Option<&Tensor> {
        self.secondary.as_ref()
    }

    fn pool(&self, index: KvCacheIndex) -> Result<&Tensor, CacheError> {
        if index.is_primary() {
            Ok(&self.primary)
        } else {
            self.secondary.as_ref().ok_or_else(|| {
                CacheError::IllegalState("secondary pool index without a secondary pool".into())
            })
        }
    }

    /// Copy one block's payload (K and V, all layers) from `src` to `dst`.
    /// Used for onboarding, offloading, and beam copy-on-divergence.
    ///
    /// Both pools are flattened to `[num_blocks, elems_per_block]` and the
    /// row is written via scatter, so the operation works in place on the
    /// shared storage.
    pub fn copy_block(&self, src: KvCacheIndex, dst: KvCacheIndex) -> Result<(), CacheError> {
        let src_pool = self.pool(src)?;
        let dst_pool = self.pool(dst)?;
        let payload = src_pool
            .reshape((src_pool.dims()[0], self.elems_per_block))?
            .narrow(0, src.pool_offset(), 1)?
            .copy()?
            .to_device(dst_pool.device())?;
        let dst_flat = dst_pool.reshape((dst_pool.dims()[0], self.elems_per_block))?;
        let indices = Tensor::from_vec(
            vec![dst.pool_offset() as u32],
            (1,),
            dst_pool.device(),
        )?
        .reshape((1, 1))?
        .expand((1, self.elems_per_block))?
        .contiguous()?;
        dst_flat.scatter_set(&indices, &payload, 0)?;
        Ok(())
    }
}
