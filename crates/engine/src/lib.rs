//! BatchLoop Engine
//!
//! Continuous-batching parallel text generation over a single shared decoder.
//! Prompts are multiplexed onto a bounded pool of KV-cache sequences, decoded
//! together in chunked batches, and returned as cleaned completions.

pub mod backend;
pub mod chunker;
pub mod cleaner;
pub mod output;
pub mod prefix;
pub mod sampling;
pub mod scheduler;
pub mod slot;
pub mod testing;

pub use backend::{
    BatchEntry, DecodeEngine, DecodeError, Pos, Sampler, SamplerFactory, SamplingError, SeqId,
    TokenId, TokenizationError, Tokenizer, Vocabulary,
};
pub use chunker::{BatchChunker, ChunkOutcome};
pub use cleaner::ResponseCleaner;
pub use output::{Completion, FinishReason, GenerationStats, ParallelOutput, Progress, ERROR_PREFIX};
pub use prefix::shared_prefix_len;
pub use sampling::{LogitsSampler, LogitsSamplerFactory};
pub use scheduler::{ParallelGenerator, SHARED_PREFIX_SEQ};
pub use slot::{Slot, SlotState, StopCriteria};
