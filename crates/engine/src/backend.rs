//! Collaborator interfaces consumed by the scheduler
//!
//! The scheduler never touches weights, tokenizer tables or sampling math
//! directly. Everything model-specific is injected through the traits below.

use batchloop_common::{BatchLoopError, GenerationParams};
use thiserror::Error;

/// Vocabulary token identifier
pub type TokenId = u32;

/// Decoder cache sequence identifier
pub type SeqId = u32;

/// Position of a token within its sequence
pub type Pos = usize;

/// One token of a decode call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: Pos,
    pub seq_id: SeqId,
    /// Whether the engine must keep logits for this entry
    pub logits: bool,
}

/// Decode failure reported by the engine
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Retryable with a smaller batch (cache pressure)
    #[error("transient decode failure (code {0})")]
    Transient(i32),

    /// Unrecoverable
    #[error("fatal decode failure (code {0})")]
    Fatal(i32),
}

/// Tokenizer rejected its input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TokenizationError(pub String);

/// Sampler construction or sampling failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SamplingError(pub String);

impl From<TokenizationError> for BatchLoopError {
    fn from(err: TokenizationError) -> Self {
        BatchLoopError::tokenization(err.0)
    }
}

impl From<SamplingError> for BatchLoopError {
    fn from(err: SamplingError) -> Self {
        BatchLoopError::sampling(err.0)
    }
}

/// Autoregressive decoder owning the shared KV cache
pub trait DecodeEngine {
    /// Maximum positions per sequence
    fn context_length(&self) -> usize;

    /// Number of per-request sequences (`1..=seq_capacity`); sequence 0 is
    /// always available in addition
    fn seq_capacity(&self) -> usize;

    /// Largest batch a single `decode` call accepts
    fn max_batch_size(&self) -> usize;

    /// Append `batch` to the cache
    ///
    /// A failed call leaves the cache unchanged.
    fn decode(&mut self, batch: &[BatchEntry]) -> Result<(), DecodeError>;

    /// Logits of entry `index` of the most recent successful `decode`
    fn logits(&self, index: usize) -> Option<&[f32]>;

    /// Make `dst` share the cache contents of `src`
    fn copy_sequence(&mut self, src: SeqId, dst: SeqId);

    /// Drop positions `from..to` of `seq` (`to = None` means to the end)
    fn evict_sequence(&mut self, seq: SeqId, from: Pos, to: Option<Pos>);

    /// Drop every sequence
    fn clear_all(&mut self);
}

/// Text to token conversion
pub trait Tokenizer {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, TokenizationError>;
}

/// Token metadata and detokenization
pub trait Vocabulary {
    /// The canonical end-of-sequence token
    fn end_of_sequence(&self) -> TokenId;

    /// Whether `token` terminates generation (superset of end-of-sequence)
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes of one token; may be a partial UTF-8 sequence
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;
}

/// Stateful token sampler bound to one sequence
pub trait Sampler {
    /// Pick the next token from `logits`
    fn sample(&mut self, logits: &[f32]) -> Result<TokenId, SamplingError>;

    /// Record `token` in the sampler history (repeat penalty bookkeeping)
    fn accept(&mut self, token: TokenId);
}

/// Builds one sampler per slot
pub trait SamplerFactory {
    type Sampler: Sampler;

    fn new_sampler(&self, params: &GenerationParams, seed: u64) -> Result<Self::Sampler, SamplingError>;
}
