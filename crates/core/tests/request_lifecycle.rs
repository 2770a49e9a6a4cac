//! Integration tests for the request state machine driven the way the
//! serving loop drives it: chunked context ingestion, streaming with beam
//! search, pause/resume against the cache, cancellation, and sibling
//! requests.

use candle_core::{DType, Device};
use pagedkv_core::kv_cache::{CacheConfig, CacheType, KVCacheManager};
use pagedkv_core::request::{
    FinishReason, Request, RequestKind, RequestOptions, RequestState, SamplingConfig,
};

fn cache_config(blocks_in_primary: usize, enable_block_reuse: bool) -> CacheConfig {
    CacheConfig {
        num_layers: 2,
        num_kv_heads: 2,
        head_dim: 8,
        tokens_per_block: 4,
        blocks_in_primary,
        blocks_in_secondary: 0,
        max_num_sequences: 4,
        max_beam_width: 4,
        max_attention_window: 64,
        sink_token_length: 0,
        use_one_more_block: false,
        enable_block_reuse,
        onboard_blocks: true,
        cache_type: CacheType::SelfAttn,
        dtype: DType::F32,
        device: Device::Cpu,
        secondary_device: Device::Cpu,
    }
}

fn request(id: u64, tokens: Vec<u32>, max_new_tokens: usize) -> Request {
    Request::new(id, tokens, max_new_tokens, RequestOptions::default()).unwrap()
}

// ─── Chunked context ─────────────────────────────────────────────────────────

#[test]
fn chunked_context_ingestion_walks_the_prompt() {
    let mut mgr = KVCacheManager::new(&cache_config(16, false)).unwrap();
    let mut req = request(1, vec![0; 10], 4);
    mgr.add_sequence(0, req.prompt_len(), 1, Some(&mut req))
        .unwrap();

    // promptLen = 10, chunkSize = 4: cursor 0 -> 4 -> 8 -> 10, with
    // is_last_context_chunk false, false, true. Blocks for the whole context
    // were reserved at admission; each iteration stands in for one forward
    // pass over the current chunk.
    let mut cursor_trace = Vec::new();
    let mut last_trace = Vec::new();
    while req.context_remaining_length() > 0 {
        req.set_context_chunk_size(4).unwrap();
        cursor_trace.push(req.context_current_position());
        last_trace.push(req.is_last_context_chunk());
        req.move_to_next_context_chunk().unwrap();
    }
    assert_eq!(cursor_trace, vec![0, 4, 8]);
    assert_eq!(last_trace, vec![false, false, true]);
    assert_eq!(req.context_current_position(), 10);
    assert_eq!(mgr.get_sequence(0).unwrap().num_tokens(), 10);
    assert_eq!(mgr.get_sequence(0).unwrap().num_blocks_per_beam(), 3);

    // Context consumed: the loop moves the request into generation.
    req.state = RequestState::GenerationInProgress;
    assert!(req.has_reached_state(RequestState::ContextInit));
}

#[test]
fn unchunked_context_is_one_pass() {
    let mut req = request(1, vec![0; 10], 4);
    assert!(req.is_full_context_request());
    assert!(req.is_first_context_chunk() && req.is_last_context_chunk());
    req.move_to_next_context_chunk().unwrap();
    assert_eq!(req.context_remaining_length(), 0);
}

// ─── Streaming + beam search ─────────────────────────────────────────────────

#[test]
fn streaming_beam_search_returns_full_beam_snapshots() {
    let options = RequestOptions {
        streaming: true,
        return_generation_logits: true,
        sampling: SamplingConfig {
            beam_width: 3,
            random_seed: None,
        },
        ..RequestOptions::default()
    };
    let mut req = Request::new(1, vec![1, 2, 3, 4], 4, options).unwrap();
    // Forced on (and logits forced off) for streaming beam search.
    assert!(req.return_all_generated_tokens());
    assert!(!req.return_generation_logits());

    req.state = RequestState::GenerationInProgress;
    req.add_new_tokens(&[10, 20, 30]);
    let resp = req.create_response().unwrap().unwrap();
    assert_eq!(
        resp.result.output_token_ids,
        vec![vec![10], vec![20], vec![30]]
    );

    // Beam gather rewrites an earlier position; the next snapshot reflects
    // it from the prompt boundary forward.
    req.set_generated_tokens(&[vec![10, 11], vec![10, 21], vec![30, 31]]);
    let resp = req.create_response().unwrap().unwrap();
    assert_eq!(
        resp.result.output_token_ids,
        vec![vec![10, 11], vec![10, 21], vec![30, 31]]
    );
}

// ─── Pause / resume ──────────────────────────────────────────────────────────

#[test]
fn pause_and_resume_recycles_cache_blocks() {
    let mut mgr = KVCacheManager::new(&cache_config(16, false)).unwrap();
    let prompt_len = 5;
    let mut req = request(1, vec![1, 2, 3, 4, 5], 32);
    mgr.add_sequence(0, prompt_len, 1, Some(&mut req)).unwrap();
    req.state = RequestState::GenerationInProgress;

    // Seven decode steps of a 32-token budget.
    for i in 0..7 {
        req.add_new_token(100 + i, 0);
        mgr.add_token(0).unwrap();
    }
    let free_before = mgr.num_free_blocks();

    // Preemption: fold generated tokens into the prompt and release the
    // sequence's blocks.
    req.pause(prompt_len + 10);
    mgr.remove_sequence(0, None).unwrap();

    assert_eq!(req.prompt_len(), 12);
    assert_eq!(req.max_new_tokens(), 25);
    assert_eq!(req.state, RequestState::ContextInit);
    assert!(req.is_first_context_chunk());
    assert_eq!(req.seq_slot(), None);
    assert_eq!(mgr.num_free_blocks(), 16);
    assert!(mgr.num_free_blocks() > free_before);

    // Resume: re-admit with the folded prompt.
    mgr.add_sequence(0, req.prompt_len(), 1, Some(&mut req))
        .unwrap();
    assert_eq!(mgr.get_sequence(0).unwrap().num_tokens(), 12);
}

#[test]
fn pause_caps_folded_prompt_at_max_input_len() {
    let mut req = request(1, vec![0; 5], 32);
    req.state = RequestState::GenerationInProgress;
    for i in 0..20 {
        req.add_new_token(100 + i, 0);
    }
    req.pause(10);
    assert_eq!(req.prompt_len(), 10);
    assert_eq!(req.max_new_tokens(), 27);
}

// ─── Cancellation ────────────────────────────────────────────────────────────

#[test]
fn cancellation_releases_blocks_without_storing_reuse() {
    let mut mgr = KVCacheManager::new(&cache_config(16, true)).unwrap();
    let mut req = request(1, vec![1, 2, 3, 4, 5, 6, 7, 8, 9], 8);
    mgr.add_sequence(0, req.prompt_len(), 1, Some(&mut req))
        .unwrap();
    req.state = RequestState::GenerationInProgress;
    req.add_new_token(10, 0);
    mgr.add_token(0).unwrap();

    // Observed between steps: terminal state, cancelled finish reason, and
    // no reuse-tree insertion.
    req.cancel();
    mgr.remove_sequence(0, None).unwrap();
    assert!(req.is_generation_complete_state());
    assert_eq!(req.finish_reasons(), &[FinishReason::Cancelled]);

    let resp = req.create_response().unwrap().unwrap();
    assert_eq!(resp.result.finish_reasons, vec![FinishReason::Cancelled]);
    assert!(resp.result.is_final);

    // Nothing was cached for future requests.
    let mut req_b = request(2, vec![1, 2, 3, 4, 5, 6, 7, 8, 9], 8);
    mgr.add_sequence(0, req_b.prompt_len(), 1, Some(&mut req_b))
        .unwrap();
    assert_eq!(req_b.prepopulated_prompt_len(), 0);
}

// ─── Sibling requests ────────────────────────────────────────────────────────

#[test]
fn siblings_complete_independently_and_finalize_together() {
    let mut parent = Request::new(
        1,
        vec![1, 2, 3],
        4,
        RequestOptions {
            num_return_sequences: 2,
            ..RequestOptions::default()
        },
    )
    .unwrap();
    let mut child = parent.create_child_request(2).unwrap();
    assert_eq!(child.prompt_len(), parent.prompt_len());
    assert_eq!(child.sequence_index(), 1);

    parent.state = RequestState::GenerationInProgress;
    child.state = RequestState::GenerationInProgress;
    parent.add_new_token(7, 0);
    parent.set_finished_reason(FinishReason::EndId, 0);
    parent.state = RequestState::GenerationComplete;

    let resp = parent.create_response().unwrap().unwrap();
    assert!(resp.result.is_sequence_final);
    assert!(!resp.result.is_final);

    child.add_new_token(8, 0);
    child.set_finished_reason(FinishReason::Length, 0);
    child.state = RequestState::GenerationComplete;
    let resp = child.create_response().unwrap().unwrap();
    assert!(resp.result.is_final);
    // Child responses carry the parent's request id.
    assert_eq!(resp.request_id, 1);
}

// ─── Disaggregated serving ───────────────────────────────────────────────────

#[test]
fn context_only_request_hands_off_phase_params() {
    let options = RequestOptions {
        kind: RequestKind::ContextOnly,
        ..RequestOptions::default()
    };
    let mut req = Request::new(1, vec![1, 2, 3, 4], 4, options).unwrap();
    assert_eq!(req.state, RequestState::ContextInit);
    assert!(req.is_context_only_request());

    // Context phase produced the first generation token; KV transmission
    // begins.
    req.add_new_token(42, 0);
    req.state = RequestState::DisaggContextTransInProgress;
    let resp = req.create_response().unwrap().unwrap();
    assert!(resp.result.is_sequence_final);
    let params = resp.result.context_phase_params.unwrap();
    assert_eq!(params.first_gen_tokens, vec![42]);

    req.state = RequestState::DisaggContextComplete;
    assert!(req.is_finished());
    assert!(req.create_response().is_err());
}

#[test]
fn generation_only_request_skips_context_phase() {
    let options = RequestOptions {
        kind: RequestKind::GenerationOnly,
        ..RequestOptions::default()
    };
    let req = Request::new(1, vec![1, 2, 3, 4], 4, options).unwrap();
    assert_eq!(req.state, RequestState::DisaggGenerationInit);
    // Past GenerationComplete in the chronological order.
    assert!(req.has_reached_state(RequestState::GenerationComplete));
    // A generation-only request still counts as a full-context request for
    // chunking purposes.
    assert!(req.is_full_context_request());
}

// ─── Admission boundaries ────────────────────────────────────────────────────

#[test]
fn admission_validation_boundaries() {
    // Exactly max_input_len is accepted.
    let mut req = request(1, vec![0; 16], 4);
    assert!(req.validate(16, 64, 0, None, false).is_ok());

    // One over is rejected.
    let mut req = request(2, vec![0; 17], 4);
    assert!(req.validate(16, 64, 0, None, false).is_err());

    // Over-budget generation is clamped, not rejected.
    let mut req = request(3, vec![0; 8], 1000);
    req.validate(16, 32, 0, None, false).unwrap();
    assert_eq!(req.max_new_tokens(), 24);
}
