//! Core of an inference-serving runtime for autoregressive transformer
//! models: the paged KV cache manager with prefix-sharing reuse, and the
//! per-request lifecycle that drives it.
//!
//! The forward pass, sampling, tokenization, and the wire layer live
//! elsewhere; this crate hands out block-index tables and consumes generated
//! token ids.

pub mod kv_cache;
pub mod request;

pub use kv_cache::{CacheConfig, CacheError, CacheType, KVCacheManager, KvCacheStats};
pub use request::{
    FinishReason, Request, RequestError, RequestId, RequestKind, RequestOptions, RequestState,
    Response, ResponseResult,
};
