//! Per-request generation slot
//!
//! A slot binds one prompt to one decoder cache sequence for the duration of
//! its generation, then is recycled for the next pending prompt.

use crate::backend::{BatchEntry, Pos, Sampler, SamplingError, SeqId, TokenId, Vocabulary};
use crate::output::FinishReason;
use tracing::trace;

/// Slot lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    /// No prompt bound
    Empty,
    /// Prompt ingested, no token generated yet
    Assigned,
    /// Producing tokens
    Generating,
    /// Stopped normally
    Finished(FinishReason),
    /// Stopped on error
    Failed(String),
}

/// Stop conditions checked after every generated token
#[derive(Debug, Clone)]
pub struct StopCriteria {
    max_tokens: u32,
    min_tokens: u32,
    sequences: Vec<Vec<u8>>,
    longest: usize,
}

impl StopCriteria {
    /// `max_tokens = 0` means unbounded; stop sequences are only looked for
    /// once `min_tokens` tokens have been generated
    pub fn new(max_tokens: u32, min_tokens: u32, sequences: &[String]) -> Self {
        let sequences: Vec<Vec<u8>> = sequences
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
            .collect();
        let longest = sequences.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            max_tokens,
            min_tokens,
            sequences,
            longest,
        }
    }

    /// Whether a stop sequence ends within the last `piece_len` bytes of
    /// `response`, or anywhere when `full_scan` is set
    fn matches_tail(&self, response: &[u8], piece_len: usize, full_scan: bool) -> bool {
        if self.sequences.is_empty() {
            return false;
        }
        let window = if full_scan {
            response
        } else {
            let start = response.len().saturating_sub(self.longest + piece_len);
            &response[start..]
        };
        self.sequences
            .iter()
            .any(|seq| window.windows(seq.len()).any(|w| w == seq.as_slice()))
    }
}

/// What a slot hands back when released
#[derive(Debug, Clone, PartialEq)]
pub struct SlotResult {
    pub global_index: usize,
    pub prompt_len: usize,
    pub generated_tokens: usize,
    pub response: Vec<u8>,
    pub finish_reason: FinishReason,
}

/// A generation slot bound to one cache sequence
#[derive(Debug)]
pub struct Slot<S> {
    seq_id: SeqId,
    state: SlotState,
    global_index: usize,
    prompt_len: usize,
    n_past: Pos,
    n_decoded: usize,
    sampled: TokenId,
    i_batch: Option<usize>,
    response: Vec<u8>,
    sampler: Option<S>,
}

impl<S> Slot<S> {
    pub fn new(seq_id: SeqId) -> Self {
        Self {
            seq_id,
            state: SlotState::Empty,
            global_index: 0,
            prompt_len: 0,
            n_past: 0,
            n_decoded: 0,
            sampled: 0,
            i_batch: None,
            response: Vec::new(),
            sampler: None,
        }
    }

    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    pub fn n_decoded(&self) -> usize {
        self.n_decoded
    }

    pub fn is_empty(&self) -> bool {
        self.state == SlotState::Empty
    }

    /// Assigned or generating
    pub fn is_active(&self) -> bool {
        matches!(self.state, SlotState::Assigned | SlotState::Generating)
    }

    /// Finished or failed, waiting to be released
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SlotState::Finished(_) | SlotState::Failed(_))
    }

    /// Bind a prompt whose tokens up to (not including) the last are in the cache
    ///
    /// `prompt` must not be empty.
    pub fn assign(&mut self, global_index: usize, prompt: &[TokenId], sampler: S) {
        debug_assert!(self.is_empty(), "slot {} reassigned while busy", self.seq_id);
        debug_assert!(!prompt.is_empty());

        self.state = SlotState::Assigned;
        self.global_index = global_index;
        self.prompt_len = prompt.len();
        self.n_past = prompt.len().saturating_sub(1);
        self.n_decoded = 0;
        // The last prompt token is the first generation input
        self.sampled = prompt.last().copied().unwrap_or_default();
        self.i_batch = None;
        self.response.clear();
        self.sampler = Some(sampler);
    }

    /// Entry this slot contributes to the next generation batch at `index`
    ///
    /// Finishes the slot with `ContextFull` instead when its next position
    /// does not fit in the context.
    pub fn next_entry(&mut self, index: usize, context_length: usize) -> Option<BatchEntry> {
        if !self.is_active() {
            return None;
        }
        if self.state == SlotState::Assigned {
            self.state = SlotState::Generating;
        }

        let pos = self.n_past + self.n_decoded;
        if pos >= context_length {
            self.finish(FinishReason::ContextFull);
            return None;
        }

        self.i_batch = Some(index);
        Some(BatchEntry {
            token: self.sampled,
            pos,
            seq_id: self.seq_id,
            logits: true,
        })
    }

    /// Batch index recorded by the last `next_entry`, if still pending
    pub fn batch_index(&self) -> Option<usize> {
        self.i_batch
    }

    /// Apply a sampled token and run the stop checks
    pub fn advance<V: Vocabulary + ?Sized>(
        &mut self,
        token: TokenId,
        vocab: &V,
        stop: &StopCriteria,
    ) -> Option<&FinishReason> {
        if token == vocab.end_of_sequence() || vocab.is_end_of_generation(token) {
            self.finish(FinishReason::EndOfGeneration);
            return self.finish_reason();
        }

        let piece = vocab.token_to_piece(token);
        self.response.extend_from_slice(&piece);
        self.sampled = token;
        self.n_decoded += 1;
        trace!(seq_id = self.seq_id, token, n_decoded = self.n_decoded, "token");

        if stop.max_tokens > 0 && self.n_decoded >= stop.max_tokens as usize {
            self.finish(FinishReason::MaxTokens);
        } else if self.n_decoded >= stop.min_tokens as usize {
            let full_scan = self.n_decoded == stop.min_tokens as usize;
            if stop.matches_tail(&self.response, piece.len(), full_scan) {
                self.finish(FinishReason::StopSequence);
            }
        }
        self.finish_reason()
    }

    pub fn finish(&mut self, reason: FinishReason) {
        self.i_batch = None;
        self.state = match reason {
            FinishReason::Failed(msg) => SlotState::Failed(msg),
            reason => SlotState::Finished(reason),
        };
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.finish(FinishReason::Failed(message.into()));
    }

    fn finish_reason(&self) -> Option<&FinishReason> {
        match &self.state {
            SlotState::Finished(reason) => Some(reason),
            _ => None,
        }
    }

    /// Drop the sampler, reset to `Empty` and hand back the result
    ///
    /// Returns `None` when the slot was not terminal.
    pub fn release(&mut self) -> Option<SlotResult> {
        let finish_reason = match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Finished(reason) => reason,
            SlotState::Failed(msg) => FinishReason::Failed(msg),
            other => {
                self.state = other;
                return None;
            }
        };

        self.sampler = None;
        self.i_batch = None;
        Some(SlotResult {
            global_index: self.global_index,
            prompt_len: self.prompt_len,
            generated_tokens: self.n_decoded,
            response: std::mem::take(&mut self.response),
            finish_reason,
        })
    }
}

impl<S: Sampler> Slot<S> {
    /// Sample the next token from this slot's logits and record it in the
    /// sampler history
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, SamplingError> {
        self.i_batch = None;
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| SamplingError("slot has no sampler".to_string()))?;
        let token = sampler.sample(logits)?;
        sampler.accept(token);
        Ok(token)
    }
}
