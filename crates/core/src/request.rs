//! Request lifecycle for the serving loop.
//!
//! A request carries the prompt, per-beam token accumulators, and a state
//! machine the serving loop drives through encoder, context, generation, and
//! disaggregated phases. The state enum is ordered chronologically so
//! "have we reached X" is a plain comparison. Requests never advance
//! themselves; every transition is made by the loop between steps.

use std::sync::{Arc, Mutex};

use candle_core::Tensor;
use thiserror::Error;
use tracing::warn;

use crate::kv_cache::{LoraTaskId, TokenExtraId, TokenId, UniqueToken};

pub type RequestId = u64;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

/// Lifecycle states in chronological order; the discriminant ordering is
/// load-bearing for [`Request::has_reached_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestState {
    Unknown = 0,
    /// Encoder phase starts (encoder-decoder models).
    EncoderInit = 1,
    /// Context phase starts.
    ContextInit = 2,
    GenerationInProgress = 3,
    GenerationToComplete = 4,
    GenerationComplete = 5,
    /// Disaggregated serving: generation-only request arrived at the
    /// generation executor.
    DisaggGenerationInit = 6,
    /// Disaggregated serving: context-only request transmitting its KV cache.
    DisaggContextTransInProgress = 7,
    /// Context-only request finished KV cache transmission.
    DisaggContextComplete = 8,
    DisaggGenerationTransInProgress = 9,
}

/// Which phases this request runs on this executor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    ContextAndGeneration,
    ContextOnly,
    GenerationOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    NotFinished,
    /// The end-of-sequence token was produced.
    EndId,
    /// A stop word was produced.
    StopWords,
    /// `max_new_tokens` was reached.
    Length,
    /// Cancelled between steps.
    Cancelled,
}

/// Lookahead decoding parameters. Carried through unchanged; the effect on
/// state transitions and block allocation is a no-op pending clarification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookaheadConfig {
    pub window_size: usize,
    pub ngram_size: usize,
    pub verification_set_size: usize,
}

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub beam_width: usize,
    pub random_seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            random_seed: None,
        }
    }
}

/// Handoff payload a context-only request produces for its generation-only
/// counterpart in disaggregated serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPhaseParams {
    /// First generated token of every beam, the seed input for the
    /// generation executor.
    pub first_gen_tokens: Vec<TokenId>,
}

pub const DEFAULT_PRIORITY: f32 = 0.5;

/// Optional request inputs. Everything defaults to absent; there are no
/// sentinel values.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub end_id: Option<TokenId>,
    pub pad_id: Option<TokenId>,
    pub streaming: bool,
    pub sampling: SamplingConfig,
    pub embedding_bias: Option<Tensor>,
    pub bad_words_list: Option<Tensor>,
    pub stop_words_list: Option<Tensor>,
    pub position_ids: Option<Vec<u32>>,
    pub prompt_embedding_table: Option<Tensor>,
    pub prompt_vocab_size: Option<usize>,
    pub lora_task_id: Option<LoraTaskId>,
    pub lora_weights: Option<Tensor>,
    pub lora_config: Option<Tensor>,
    pub lookahead_config: Option<LookaheadConfig>,
    pub return_log_probs: bool,
    pub return_context_logits: bool,
    pub return_generation_logits: bool,
    pub return_all_generated_tokens: bool,
    pub exclude_input_from_output: bool,
    pub draft_tokens: Vec<TokenId>,
    pub draft_logits: Option<Tensor>,
    pub encoder_input_tokens: Option<Vec<TokenId>>,
    pub encoder_input_features: Option<Tensor>,
    pub encoder_output_length: Option<usize>,
    pub return_encoder_output: bool,
    pub client_id: Option<RequestId>,
    pub priority: f32,
    pub kind: RequestKind,
    pub input_token_extra_ids: Option<Vec<TokenExtraId>>,
    pub num_return_sequences: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            end_id: None,
            pad_id: None,
            streaming: false,
            sampling: SamplingConfig::default(),
            embedding_bias: None,
            bad_words_list: None,
            stop_words_list: None,
            position_ids: None,
            prompt_embedding_table: None,
            prompt_vocab_size: None,
            lora_task_id: None,
            lora_weights: None,
            lora_config: None,
            lookahead_config: None,
            return_log_probs: false,
            return_context_logits: false,
            return_generation_logits: false,
            return_all_generated_tokens: false,
            exclude_input_from_output: false,
            draft_tokens: Vec::new(),
            draft_logits: None,
            encoder_input_tokens: None,
            encoder_input_features: None,
            encoder_output_length: None,
            return_encoder_output: false,
            client_id: None,
            priority: DEFAULT_PRIORITY,
            kind: RequestKind::ContextAndGeneration,
            input_token_extra_ids: None,
            num_return_sequences: 1,
        }
    }
}

/// Per-request result payload returned to the client.
#[derive(Debug, Clone, Default)]
pub struct ResponseResult {
    pub sequence_index: usize,
    /// This sibling finished.
    pub is_sequence_final: bool,
    /// Every sibling of the request finished.
    pub is_final: bool,
    pub output_token_ids: Vec<Vec<TokenId>>,
    pub cum_log_probs: Option<Vec<f32>>,
    pub log_probs: Option<Vec<Vec<f32>>>,
    pub context_logits: Option<Tensor>,
    pub generation_logits: Option<Tensor>,
    pub encoder_output: Option<Tensor>,
    pub finish_reasons: Vec<FinishReason>,
    pub decoding_iter: usize,
    pub context_phase_params: Option<ContextPhaseParams>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub result: ResponseResult,
}

#[derive(Debug, Clone)]
pub struct Request {
    request_id: RequestId,
    prompt_len: usize,
    orig_prompt_len: usize,
    max_new_tokens: usize,
    sampling: SamplingConfig,
    pub state: RequestState,
    end_id: Option<TokenId>,
    pad_id: Option<TokenId>,
    client_id: Option<RequestId>,
    streaming: bool,
    /// Prompt plus generated tokens, one vector per beam.
    tokens: Vec<Vec<TokenId>>,
    /// Same positions as `tokens`, paired with extra ids for cache matching.
    unique_tokens: Vec<Vec<UniqueToken>>,
    /// Tokens produced at the latest step, the next step's input.
    last_tokens: Vec<TokenId>,
    /// Tokens decoded ahead on the last pipeline rank; excluded from
    /// `num_tokens` so KV usage is not overestimated.
    num_pre_decoded_tokens: Vec<usize>,
    /// Prompt tokens whose KV state came from the reuse tree.
    prepopulated_prompt_len: usize,
    /// Watermark of tokens already sent to the client while streaming.
    max_sent_token_len: usize,
    embedding_bias: Option<Tensor>,
    bad_words_list: Option<Tensor>,
    stop_words_list: Option<Tensor>,
    position_ids: Option<Vec<u32>>,
    prompt_embedding_table: Option<Tensor>,
    prompt_vocab_size: Option<usize>,
    lora_task_id: Option<LoraTaskId>,
    lora_weights: Option<Tensor>,
    lora_config: Option<Tensor>,
    lookahead_config: Option<LookaheadConfig>,
    /// `None` means the context is not chunked.
    context_chunk_size: Option<usize>,
    context_current_position: usize,
    log_probs: Vec<Vec<f32>>,
    cum_log_probs: Vec<f32>,
    return_log_probs: bool,
    draft_tokens: Vec<TokenId>,
    draft_logits: Option<Tensor>,
    num_tokens_per_iteration: usize,
    return_all_generated_tokens: bool,
    return_context_logits: bool,
    return_generation_logits: bool,
    exclude_input_from_output: bool,
    encoder_tokens: Option<Vec<TokenId>>,
    encoder_unique_tokens: Option<Vec<UniqueToken>>,
    encoder_input_features: Option<Tensor>,
    encoder_output_length: Option<usize>,
    return_encoder_output: bool,
    encoder_output: Option<Tensor>,
    context_logits: Option<Tensor>,
    generation_logits: Option<Tensor>,
    generation_logits_fragments: Vec<Tensor>,
    decoding_iter: usize,
    priority: f32,
    finish_reasons: Vec<FinishReason>,
    kind: RequestKind,
    context_phase_params: Option<ContextPhaseParams>,
    input_token_extra_ids: Option<Vec<TokenExtraId>>,
    num_return_sequences: usize,
    sequence_index: usize,
    num_child_requests: usize,
    parent_request_id: Option<RequestId>,
    /// Completion flag per sibling, shared between a parent and its
    /// children. A response is final only when every entry is true.
    sequence_final: Arc<Mutex<Vec<bool>>>,
    seq_slot: Option<usize>,
}

impl Request {
    pub fn new(
        request_id: RequestId,
        input_tokens: Vec<TokenId>,
        max_new_tokens: usize,
        options: RequestOptions,
    ) -> Result<Self, RequestError> {
        if input_tokens.is_empty() {
            return Err(RequestError::InvalidArgument(
                "prompt must not be empty".into(),
            ));
        }
        let beam_width = options.sampling.beam_width;
        if beam_width == 0 {
            return Err(RequestError::InvalidArgument(
                "beam width must be positive".into(),
            ));
        }
        if options.num_return_sequences == 0 {
            return Err(RequestError::InvalidArgument(
                "num_return_sequences must be positive".into(),
            ));
        }
        if options.prompt_embedding_table.is_some() != options.prompt_vocab_size.is_some() {
            return Err(RequestError::InvalidArgument(
                "prompt embedding table and prompt vocab size must be provided together".into(),
            ));
        }
        if options.draft_logits.is_some() && options.draft_tokens.is_empty() {
            return Err(RequestError::InvalidArgument(
                "draft tokens must be specified when draft logits are given".into(),
            ));
        }
        if let Some(extra_ids) = &options.input_token_extra_ids {
            if extra_ids.len() != input_tokens.len() {
                return Err(RequestError::InvalidArgument(format!(
                    "input_token_extra_ids length ({}) must equal prompt length ({})",
                    extra_ids.len(),
                    input_tokens.len()
                )));
            }
        }

        let mut return_all_generated_tokens = options.return_all_generated_tokens;
        if options.streaming && beam_width > 1 && !return_all_generated_tokens {
            warn!(
                request_id,
                "forcing return_all_generated_tokens: beam search while streaming can rewrite \
                 previously streamed outputs, so every step must return the full beams"
            );
            return_all_generated_tokens = true;
        }
        let mut return_generation_logits = options.return_generation_logits;
        if options.streaming && beam_width > 1 && return_generation_logits {
            warn!(
                request_id,
                "disabling return_generation_logits: beams are gathered across steps but their \
                 logits are not, so streamed logits would arrive out of order"
            );
            return_generation_logits = false;
        }

        let has_encoder_input = options.encoder_input_tokens.is_some()
            || options.encoder_input_features.is_some();
        let state = if has_encoder_input {
            RequestState::EncoderInit
        } else if options.kind == RequestKind::GenerationOnly {
            RequestState::DisaggGenerationInit
        } else {
            RequestState::ContextInit
        };

        let prompt_len = input_tokens.len();
        let prompt_unique_tokens: Vec<UniqueToken> = match &options.input_token_extra_ids {
            Some(extra_ids) => input_tokens
                .iter()
                .zip(extra_ids)
                .map(|(&token_id, &extra_id)| UniqueToken::new(token_id, extra_id))
                .collect(),
            None => input_tokens
                .iter()
                .map(|&token_id| UniqueToken::new(token_id, 0))
                .collect(),
        };
        let encoder_unique_tokens = options.encoder_input_tokens.as_ref().map(|encoder_tokens| {
            encoder_tokens
                .iter()
                .map(|&token_id| UniqueToken::new(token_id, 0))
                .collect()
        });

        Ok(Self {
            request_id,
            prompt_len,
            orig_prompt_len: prompt_len,
            max_new_tokens,
            sampling: options.sampling,
            state,
            end_id: options.end_id,
            pad_id: options.pad_id,
            client_id: options.client_id,
            streaming: options.streaming,
            tokens: vec![input_tokens; beam_width],
            unique_tokens: vec![prompt_unique_tokens; beam_width],
            last_tokens: vec![0; beam_width],
            num_pre_decoded_tokens: vec![0; beam_width],
            prepopulated_prompt_len: 0,
            max_sent_token_len: prompt_len,
            embedding_bias: options.embedding_bias,
            bad_words_list: options.bad_words_list,
            stop_words_list: options.stop_words_list,
            position_ids: options.position_ids,
            prompt_embedding_table: options.prompt_embedding_table,
            prompt_vocab_size: options.prompt_vocab_size,
            lora_task_id: options.lora_task_id,
            lora_weights: options.lora_weights,
            lora_config: options.lora_config,
            lookahead_config: options.lookahead_config,
            context_chunk_size: None,
            context_current_position: 0,
            log_probs: vec![Vec::new(); beam_width],
            cum_log_probs: vec![0.0; beam_width],
            return_log_probs: options.return_log_probs,
            draft_tokens: options.draft_tokens,
            draft_logits: options.draft_logits,
            num_tokens_per_iteration: 1,
            return_all_generated_tokens,
            return_context_logits: options.return_context_logits,
            return_generation_logits,
            exclude_input_from_output: options.exclude_input_from_output,
            encoder_tokens: options.encoder_input_tokens,
            encoder_unique_tokens,
            encoder_input_features: options.encoder_input_features,
            encoder_output_length: options.encoder_output_length,
            return_encoder_output: options.return_encoder_output,
            encoder_output: None,
            context_logits: None,
            generation_logits: None,
            generation_logits_fragments: Vec::new(),
            decoding_iter: 0,
            priority: options.priority,
            finish_reasons: vec![FinishReason::NotFinished; beam_width],
            kind: options.kind,
            context_phase_params: None,
            input_token_extra_ids: options.input_token_extra_ids,
            num_return_sequences: options.num_return_sequences,
            sequence_index: 0,
            num_child_requests: 0,
            parent_request_id: None,
            sequence_final: Arc::new(Mutex::new(vec![false; options.num_return_sequences])),
            seq_slot: None,
        })
    }

    /// Admission checks against the executor's limits. Hard violations are
    /// rejected; overlong generation budgets are clamped with a warning.
    pub fn validate(
        &mut self,
        max_input_len: usize,
        max_sequence_len: usize,
        max_draft_len: usize,
        max_encoder_input_len: Option<usize>,
        enable_kv_cache_reuse: bool,
    ) -> Result<(), RequestError> {
        if let Some(max_encoder_len) = max_encoder_input_len {
            if let Some(encoder_len) = self.encoder_input_len() {
                if encoder_len > max_encoder_len {
                    return Err(RequestError::InvalidArgument(format!(
                        "encoder length ({encoder_len}) exceeds maximum encoder input length \
                         ({max_encoder_len})"
                    )));
                }
            }
        }
        if self.prompt_len > max_input_len {
            return Err(RequestError::InvalidArgument(format!(
                "prompt length ({}) exceeds maximum input length ({max_input_len})",
                self.prompt_len
            )));
        }

        let mut draft_len = self.draft_tokens.len();
        if draft_len > 0 {
            if draft_len > max_draft_len {
                return Err(RequestError::InvalidArgument(format!(
                    "draft tokens length ({draft_len}) exceeds maximum draft tokens length \
                     ({max_draft_len})"
                )));
            }
            if self.prompt_len + draft_len > max_input_len {
                let clamped = max_input_len - self.prompt_len;
                warn!(
                    request_id = self.request_id,
                    draft_len, clamped, "clamping draft tokens to fit maximum input length"
                );
                self.draft_tokens.truncate(clamped);
                draft_len = clamped;
            }
        }

        if self.prompt_len + self.max_new_tokens + draft_len > max_sequence_len {
            let clamped = max_sequence_len.saturating_sub(self.prompt_len + draft_len);
            warn!(
                request_id = self.request_id,
                max_new_tokens = self.max_new_tokens,
                clamped,
                "clamping max_new_tokens to fit maximum sequence length"
            );
            self.max_new_tokens = clamped;
        }

        if enable_kv_cache_reuse && self.prompt_embedding_table.is_some() {
            match &self.input_token_extra_ids {
                None => {
                    return Err(RequestError::InvalidArgument(
                        "input token extra ids must be provided when enabling kv cache reuse \
                         with a prompt table"
                            .into(),
                    ))
                }
                Some(extra_ids) if extra_ids.len() != self.orig_prompt_len => {
                    return Err(RequestError::InvalidArgument(
                        "input_token_extra_ids length must equal the prompt length".into(),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    // ─── Identity and configuration ─────────────────────────────────────────

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn client_id(&self) -> Option<RequestId> {
        self.client_id
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn beam_width(&self) -> usize {
        self.sampling.beam_width
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn end_id(&self) -> Option<TokenId> {
        self.end_id
    }

    pub fn pad_id(&self) -> Option<TokenId> {
        self.pad_id
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn orig_prompt_len(&self) -> usize {
        self.orig_prompt_len
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn seq_slot(&self) -> Option<usize> {
        self.seq_slot
    }

    pub fn set_seq_slot(&mut self, seq_slot: Option<usize>) {
        self.seq_slot = seq_slot;
    }

    pub fn lora_task_id(&self) -> Option<LoraTaskId> {
        self.lora_task_id
    }

    pub fn lora_weights(&self) -> Option<&Tensor> {
        self.lora_weights.as_ref()
    }

    pub fn lora_config(&self) -> Option<&Tensor> {
        self.lora_config.as_ref()
    }

    pub fn lookahead_config(&self) -> Option<LookaheadConfig> {
        self.lookahead_config
    }

    pub fn embedding_bias(&self) -> Option<&Tensor> {
        self.embedding_bias.as_ref()
    }

    pub fn bad_words_list(&self) -> Option<&Tensor> {
        self.bad_words_list.as_ref()
    }

    pub fn stop_words_list(&self) -> Option<&Tensor> {
        self.stop_words_list.as_ref()
    }

    pub fn position_ids(&self) -> Option<&[u32]> {
        self.position_ids.as_deref()
    }

    pub fn prompt_embedding_table(&self) -> Option<&Tensor> {
        self.prompt_embedding_table.as_ref()
    }

    pub fn prompt_vocab_size(&self) -> Option<usize> {
        self.prompt_vocab_size
    }

    pub fn return_log_probs(&self) -> bool {
        self.return_log_probs
    }

    pub fn return_context_logits(&self) -> bool {
        self.return_context_logits
    }

    pub fn return_generation_logits(&self) -> bool {
        self.return_generation_logits
    }

    pub fn return_all_generated_tokens(&self) -> bool {
        self.return_all_generated_tokens
    }

    pub fn set_return_all_generated_tokens(&mut self, value: bool) -> Result<(), RequestError> {
        if self.streaming && self.sampling.beam_width > 1 && !value {
            return Err(RequestError::InvalidArgument(
                "return_all_generated_tokens must stay true while streaming with beam search"
                    .into(),
            ));
        }
        self.return_all_generated_tokens = value;
        Ok(())
    }

    // ─── State machine ───────────────────────────────────────────────────────

    pub fn has_reached_state(&self, state: RequestState) -> bool {
        self.state >= state
    }

    pub fn is_encoder_init_state(&self) -> bool {
        self.state == RequestState::EncoderInit
    }

    pub fn is_context_init_state(&self) -> bool {
        self.state == RequestState::ContextInit
    }

    pub fn is_generation_in_progress_state(&self) -> bool {
        self.state == RequestState::GenerationInProgress
            || self.state == RequestState::GenerationToComplete
    }

    pub fn is_generation_complete_state(&self) -> bool {
        self.state == RequestState::GenerationComplete
    }

    pub fn is_disagg_generation_init_state(&self) -> bool {
        self.state == RequestState::DisaggGenerationInit
    }

    pub fn is_disagg_context_transmission_state(&self) -> bool {
        self.state == RequestState::DisaggContextTransInProgress
    }

    pub fn is_disagg_context_complete_state(&self) -> bool {
        self.state == RequestState::DisaggContextComplete
    }

    pub fn is_context_only_request(&self) -> bool {
        self.kind == RequestKind::ContextOnly
    }

    pub fn is_finished(&self) -> bool {
        self.is_generation_complete_state() || self.is_disagg_context_complete_state()
    }

    /// Mark one beam's finish reason.
    pub fn set_finished_reason(&mut self, reason: FinishReason, beam: usize) {
        self.finish_reasons[beam] = reason;
    }

    pub fn finish_reasons(&self) -> &[FinishReason] {
        &self.finish_reasons
    }

    /// Observe a cancellation between steps: every beam finishes with
    /// `Cancelled` and the request jumps to `GenerationComplete`. The caller
    /// removes the sequence without storing blocks for reuse.
    pub fn cancel(&mut self) {
        for reason in &mut self.finish_reasons {
            *reason = FinishReason::Cancelled;
        }
        self.state = RequestState::GenerationComplete;
    }

    // ─── Tokens ──────────────────────────────────────────────────────────────

    /// Tokens currently occupying KV positions on `beam` (prompt plus
    /// generated, minus pre-decoded ones).
    pub fn num_tokens(&self, beam: usize) -> usize {
        self.tokens[beam].len() - self.num_pre_decoded_tokens[beam]
    }

    pub fn max_beam_num_tokens(&self) -> usize {
        (0..self.sampling.beam_width)
            .map(|beam| self.num_tokens(beam))
            .max()
            .unwrap_or(0)
    }

    pub fn token(&self, beam: usize, pos: usize) -> TokenId {
        self.tokens[beam][pos]
    }

    pub fn tokens(&self, beam: usize) -> &[TokenId] {
        &self.tokens[beam]
    }

    pub fn all_tokens(&self) -> &[Vec<TokenId>] {
        &self.tokens
    }

    pub fn unique_tokens(&self, beam: usize) -> &[UniqueToken] {
        &self.unique_tokens[beam]
    }

    pub fn encoder_tokens(&self) -> Option<&[TokenId]> {
        self.encoder_tokens.as_deref()
    }

    pub fn encoder_unique_tokens(&self) -> Option<&[UniqueToken]> {
        self.encoder_unique_tokens.as_deref()
    }

    /// Length of the encoder input, whether tokens or features.
    pub fn encoder_input_len(&self) -> Option<usize> {
        if let Some(features) = &self.encoder_input_features {
            return features.dims().first().copied();
        }
        self.encoder_tokens.as_ref().map(Vec::len)
    }

    /// Length of the encoder output, falling back to the input length for
    /// models without downsampling.
    pub fn encoder_output_len(&self) -> Option<usize> {
        self.encoder_output_length.or_else(|| self.encoder_input_len())
    }

    pub fn encoder_input_features(&self) -> Option<&Tensor> {
        self.encoder_input_features.as_ref()
    }

    pub fn return_encoder_output(&self) -> bool {
        self.return_encoder_output
    }

    pub fn set_encoder_output(&mut self, encoder_output: Tensor) {
        self.encoder_output = Some(encoder_output);
    }

    /// Append a generated token to one beam. Generated tokens carry extra
    /// id zero.
    pub fn add_new_token(&mut self, token: TokenId, beam: usize) {
        self.last_tokens[beam] = token;
        self.tokens[beam].push(token);
        self.unique_tokens[beam].push(UniqueToken::new(token, 0));
    }

    /// Append one generated token per beam; `beam_tokens` must hold exactly
    /// `beam_width` entries.
    pub fn add_new_tokens(&mut self, beam_tokens: &[TokenId]) {
        debug_assert_eq!(beam_tokens.len(), self.sampling.beam_width);
        self.last_tokens.copy_from_slice(beam_tokens);
        for (beam, &token) in beam_tokens.iter().enumerate() {
            self.tokens[beam].push(token);
            self.unique_tokens[beam].push(UniqueToken::new(token, 0));
        }
    }

    /// Replace all generated tokens after a beam gather.
    pub fn set_generated_tokens(&mut self, generated_beam_tokens: &[Vec<TokenId>]) {
        debug_assert_eq!(generated_beam_tokens.len(), self.sampling.beam_width);
        for (beam, generated) in generated_beam_tokens.iter().enumerate() {
            self.tokens[beam].truncate(self.prompt_len);
            self.tokens[beam].extend_from_slice(generated);
            self.unique_tokens[beam].truncate(self.prompt_len);
            self.unique_tokens[beam]
                .extend(generated.iter().map(|&token| UniqueToken::new(token, 0)));
        }
    }

    pub fn last_tokens(&self) -> &[TokenId] {
        &self.last_tokens
    }

    pub fn last_token(&self, beam: usize) -> TokenId {
        self.last_tokens[beam]
    }

    pub fn set_num_pre_decoded_tokens(&mut self, num_tokens: usize, beam: usize) {
        self.num_pre_decoded_tokens[beam] = num_tokens;
    }

    /// Generated-token count of the longest beam.
    pub fn max_num_generated_tokens(&self) -> usize {
        self.max_beam_num_tokens() - self.prompt_len
    }

    pub fn prepopulated_prompt_len(&self) -> usize {
        self.prepopulated_prompt_len
    }

    pub fn set_prepopulated_prompt_len(&mut self, prepopulated_prompt_len: usize) {
        self.prepopulated_prompt_len = prepopulated_prompt_len;
    }

    // ─── Draft tokens (speculative decoding) ─────────────────────────────────

    pub fn draft_tokens(&self) -> &[TokenId] {
        &self.draft_tokens
    }

    pub fn has_draft_tokens(&self) -> bool {
        !self.draft_tokens.is_empty()
    }

    pub fn num_draft_tokens(&self) -> usize {
        self.draft_tokens.len()
    }

    pub fn set_draft_tokens(&mut self, draft_tokens: Vec<TokenId>) {
        self.draft_tokens = draft_tokens;
    }

    pub fn draft_logits(&self) -> Option<&Tensor> {
        self.draft_logits.as_ref()
    }

    pub fn set_draft_logits(&mut self, draft_logits: Option<Tensor>) {
        self.draft_logits = draft_logits;
    }

    /// Drop rejected draft tokens from the back.
    pub fn discard_draft_tokens(&mut self, num_tokens: usize) -> Result<(), RequestError> {
        if num_tokens == 0 {
            return Err(RequestError::InvalidArgument(
                "can only discard a positive number of draft tokens".into(),
            ));
        }
        if num_tokens > self.draft_tokens.len() {
            return Err(RequestError::InvalidArgument(format!(
                "cannot discard {} draft tokens, only {} exist",
                num_tokens,
                self.draft_tokens.len()
            )));
        }
        self.draft_tokens.truncate(self.draft_tokens.len() - num_tokens);
        Ok(())
    }

    pub fn num_tokens_per_iteration(&self) -> usize {
        self.num_tokens_per_iteration
    }

    pub fn set_num_tokens_per_iteration(&mut self, num_tokens_per_iteration: usize) {
        self.num_tokens_per_iteration = num_tokens_per_iteration.max(1);
    }

    // ─── Decoding iterations ─────────────────────────────────────────────────

    pub fn decoding_iter(&self) -> usize {
        self.decoding_iter
    }

    pub fn advance_decoding_iter(&mut self) {
        self.decoding_iter += 1;
    }

    /// Average tokens decoded per iteration; above 1.0 when speculative
    /// decoding accepts draft tokens.
    pub fn avg_decoded_tokens_per_iter(&self) -> f32 {
        if self.decoding_iter == 0 {
            return 0.0;
        }
        self.max_num_generated_tokens() as f32 / self.decoding_iter as f32
    }

    // ─── Log probs and logits ────────────────────────────────────────────────

    pub fn log_probs(&self, beam: usize) -> &[f32] {
        &self.log_probs[beam]
    }

    pub fn set_log_probs(&mut self, log_probs: &[f32], beam: usize) {
        self.log_probs[beam].truncate(self.prompt_len - self.orig_prompt_len);
        self.log_probs[beam].extend_from_slice(log_probs);
    }

    pub fn cum_log_probs(&self) -> &[f32] {
        &self.cum_log_probs
    }

    pub fn set_cum_log_prob(&mut self, cum_log_prob: f32, beam: usize) {
        self.cum_log_probs[beam] = cum_log_prob;
    }

    pub fn context_logits(&self) -> Option<&Tensor> {
        self.context_logits.as_ref()
    }

    pub fn set_context_logits(&mut self, context_logits: Tensor) {
        self.context_logits = Some(context_logits);
    }

    pub fn generation_logits(&self) -> Option<&Tensor> {
        self.generation_logits.as_ref()
    }

    pub fn set_generation_logits(&mut self, generation_logits: Tensor) {
        self.generation_logits = Some(generation_logits);
    }

    pub fn add_generation_logits_fragment(&mut self, fragment: Tensor) {
        self.generation_logits_fragments.push(fragment);
    }

    pub fn generation_logits_fragments(&self) -> &[Tensor] {
        &self.generation_logits_fragments
    }

    pub fn clear_generation_logits_fragments(&mut self) {
        self.generation_logits_fragments.clear();
    }

    // ─── Chunked context ─────────────────────────────────────────────────────

    /// True while the whole remaining context goes into one forward pass.
    /// A context chunked into a single piece is still chunked.
    pub fn is_full_context_request(&self) -> bool {
        (self.is_context_init_state() || self.is_disagg_generation_init_state())
            && self.context_chunk_size.is_none()
    }

    pub fn context_current_position(&self) -> usize {
        self.context_current_position
    }

    pub fn context_remaining_length(&self) -> usize {
        self.prompt_len - self.context_current_position
    }

    /// Size of the chunk the next context step ingests. Only valid while
    /// chunking during the context phase.
    pub fn context_chunk_size(&self) -> Result<usize, RequestError> {
        if !self.is_context_init_state() || self.context_chunk_size.is_none() {
            return Err(RequestError::IllegalState(
                "request is not in the context chunking state".into(),
            ));
        }
        Ok(self.context_chunk_size.unwrap_or_default())
    }

    /// Set the next chunk size, clamped to the remaining context length.
    pub fn set_context_chunk_size(&mut self, size: usize) -> Result<(), RequestError> {
        if !self.is_context_init_state() {
            return Err(RequestError::IllegalState(
                "chunking is only possible during the context phase".into(),
            ));
        }
        self.context_chunk_size = Some(size.min(self.context_remaining_length()));
        Ok(())
    }

    /// Whether the next chunk reaches the end of the context. True for
    /// unchunked contexts.
    pub fn is_last_context_chunk(&self) -> bool {
        self.is_full_context_request()
            || (self.is_context_init_state()
                && self.context_current_position + self.context_chunk_size.unwrap_or_default()
                    == self.prompt_len)
    }

    /// Whether the cursor sits at the start of the context. True for
    /// unchunked contexts.
    pub fn is_first_context_chunk(&self) -> bool {
        self.is_full_context_request() || self.context_current_position == 0
    }

    /// Advance the cursor by the stored chunk size and zero it; unchunked
    /// contexts jump to the end.
    pub fn move_to_next_context_chunk(&mut self) -> Result<(), RequestError> {
        if !self.is_context_init_state() {
            return Err(RequestError::IllegalState(
                "chunking is only possible during the context phase".into(),
            ));
        }
        match self.context_chunk_size {
            Some(chunk_size) => {
                self.context_current_position += chunk_size;
                self.set_context_chunk_size(0)?;
            }
            None => {
                if self.context_current_position != 0 {
                    return Err(RequestError::IllegalState(
                        "full context out of bounds".into(),
                    ));
                }
                self.context_current_position = self.prompt_len;
            }
        }
        Ok(())
    }

    // ─── Pause / resume ──────────────────────────────────────────────────────

    /// Pause the request by folding generated tokens into the prompt (capped
    /// at `max_input_len`) and resetting to the context phase; the caller
    /// clears the sequence's cache blocks. Beam search cannot fold beams
    /// back, so its generated tokens are discarded instead.
    pub fn pause(&mut self, max_input_len: usize) {
        if self.sampling.beam_width > 1 {
            for beam in 0..self.sampling.beam_width {
                self.tokens[beam].truncate(self.prompt_len);
                self.unique_tokens[beam].truncate(self.prompt_len);
                if self.return_log_probs {
                    self.log_probs[beam].clear();
                }
            }
        } else {
            let new_prompt_len =
                max_input_len.min(self.prompt_len + self.max_num_generated_tokens());
            for beam in 0..self.sampling.beam_width {
                self.tokens[beam].truncate(new_prompt_len);
                self.unique_tokens[beam].truncate(new_prompt_len);
                if self.return_log_probs {
                    self.log_probs[beam].truncate(new_prompt_len - self.prompt_len);
                }
            }
            self.max_new_tokens -= new_prompt_len - self.prompt_len;
            self.prompt_len = new_prompt_len;
        }

        self.state = if self.encoder_tokens.is_some() || self.encoder_input_features.is_some() {
            RequestState::EncoderInit
        } else {
            RequestState::ContextInit
        };
        self.context_current_position = 0;
        self.context_chunk_size = None;
        self.seq_slot = None;
    }

    pub fn max_sent_token_len(&self) -> usize {
        self.max_sent_token_len
    }

    pub fn set_max_sent_token_len(&mut self, max_sent_token_len: usize) {
        self.max_sent_token_len = max_sent_token_len;
    }

    // ─── Child requests ──────────────────────────────────────────────────────

    pub fn num_return_sequences(&self) -> usize {
        self.num_return_sequences
    }

    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    pub fn is_child(&self) -> bool {
        self.sequence_index > 0
    }

    pub fn parent_request_id(&self) -> Option<RequestId> {
        self.parent_request_id
    }

    pub fn num_child_requests(&self) -> usize {
        self.num_child_requests
    }

    pub fn set_num_return_sequences(&mut self, num_return_sequences: usize) -> Result<(), RequestError> {
        if self.is_child() {
            return Err(RequestError::IllegalState(
                "a child request cannot change num_return_sequences".into(),
            ));
        }
        if num_return_sequences == 0 {
            return Err(RequestError::InvalidArgument(
                "num_return_sequences must be positive".into(),
            ));
        }
        if self.num_child_requests > num_return_sequences {
            return Err(RequestError::IllegalState(format!(
                "cannot set num_return_sequences {} below the {} child requests already created",
                num_return_sequences, self.num_child_requests
            )));
        }
        self.num_return_sequences = num_return_sequences;
        self.sequence_final_mut(|finals| finals.resize(num_return_sequences, false));
        Ok(())
    }

    /// Spawn a sibling for `num_return_sequences > 1`. The child shares the
    /// parent's completion vector and gets a seed offset by its sequence
    /// index so siblings sample differently.
    pub fn create_child_request(
        &mut self,
        child_request_id: RequestId,
    ) -> Result<Request, RequestError> {
        if self.is_child() {
            return Err(RequestError::IllegalState(
                "a child request cannot create its own child".into(),
            ));
        }
        if self.num_child_requests + 1 >= self.num_return_sequences {
            return Err(RequestError::IllegalState(format!(
                "cannot create more child requests than num_return_sequences ({})",
                self.num_return_sequences
            )));
        }
        let mut child = self.clone();
        child.request_id = child_request_id;
        child.sequence_index = self.num_child_requests + 1;
        child.parent_request_id = Some(self.request_id);
        child.sequence_final = Arc::clone(&self.sequence_final);
        child.num_child_requests = 0;
        child.seq_slot = None;

        let base_seed = self.sampling.random_seed.unwrap_or(0);
        if self.sampling.random_seed.is_none() {
            self.sampling.random_seed = Some(base_seed);
        }
        child.sampling.random_seed = Some(base_seed + child.sequence_index as u64);

        self.num_child_requests += 1;
        Ok(child)
    }

    fn sequence_final_mut<R>(&self, f: impl FnOnce(&mut Vec<bool>) -> R) -> R {
        let mut finals = self
            .sequence_final
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut finals)
    }

    // ─── Responses ───────────────────────────────────────────────────────────

    pub fn context_phase_params(&self) -> Option<&ContextPhaseParams> {
        self.context_phase_params.as_ref()
    }

    pub fn set_context_phase_params(&mut self, params: ContextPhaseParams) {
        self.context_phase_params = Some(params);
    }

    /// Assemble a response from the current state, or `None` when there is
    /// nothing new to send. Streaming requests respond every step past the
    /// sent-token watermark; non-streaming ones only at completion.
    pub fn create_response(&mut self) -> Result<Option<Response>, RequestError> {
        if self.is_disagg_context_complete_state() {
            return Err(RequestError::IllegalState(
                "a context-complete request has nothing left to respond".into(),
            ));
        }
        let eligible = self.is_generation_complete_state()
            || (self.streaming && self.is_generation_in_progress_state())
            || self.is_disagg_context_transmission_state();
        if !eligible {
            return Ok(None);
        }

        let is_sequence_final =
            self.is_generation_complete_state() || self.is_disagg_context_transmission_state();
        let is_final = self.sequence_final_mut(|finals| {
            finals[self.sequence_index] = is_sequence_final;
            finals.iter().all(|&done| done)
        });

        let streaming = self.streaming;
        let return_all = self.return_all_generated_tokens;
        let exclude_input = self.exclude_input_from_output;
        let orig_prompt_len = self.orig_prompt_len;
        let max_sent = self.max_sent_token_len;
        let tokens_out = move |total: usize| -> usize {
            if !streaming {
                total - if exclude_input { orig_prompt_len } else { 0 }
            } else if return_all {
                total - orig_prompt_len
            } else {
                total.saturating_sub(max_sent)
            }
        };

        let max_nb_tokens = self.max_beam_num_tokens();
        let should_send = self.is_generation_complete_state()
            || (streaming && max_nb_tokens > max_sent)
            || self.is_disagg_context_transmission_state();
        if !should_send {
            return Ok(None);
        }

        let mut result = ResponseResult {
            sequence_index: self.sequence_index,
            is_sequence_final,
            is_final,
            ..ResponseResult::default()
        };

        if self.is_disagg_context_transmission_state() && self.is_context_only_request() {
            result.context_phase_params = Some(ContextPhaseParams {
                first_gen_tokens: self
                    .tokens
                    .iter()
                    .map(|beam| *beam.last().unwrap_or(&0))
                    .collect(),
            });
        }

        let start_token_pos = max_nb_tokens - tokens_out(max_nb_tokens);
        result.output_token_ids = self
            .tokens
            .iter()
            .map(|beam| {
                let nb_out = tokens_out(beam.len());
                if nb_out > 0 {
                    beam[start_token_pos..start_token_pos + nb_out].to_vec()
                } else {
                    Vec::new()
                }
            })
            .collect();

        if self.return_log_probs {
            result.cum_log_probs = Some(self.cum_log_probs.clone());
            result.log_probs = Some(self.log_probs.clone());
        }
        if self.return_context_logits {
            result.context_logits = self.context_logits.clone();
        }
        if self.return_generation_logits {
            result.generation_logits = self.generation_logits.clone();
        }
        if self.return_encoder_output {
            result.encoder_output = self.encoder_output.clone();
        }
        result.finish_reasons = self.finish_reasons.clone();
        result.decoding_iter = self.decoding_iter;

        self.max_sent_token_len = max_nb_tokens;

        let request_id = self.parent_request_id.unwrap_or(self.request_id);
        Ok(Some(Response { request_id, result }))
    }
}
