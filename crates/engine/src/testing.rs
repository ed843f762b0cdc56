//! In-memory decoder and byte vocabulary for tests and benches
//!
//! `MockEngine` keeps every sequence as a plain token list and checks the
//! cache discipline the scheduler must follow: tokens are appended at the
//! next free position only, and a sequence is copied into only when empty.
//! Logits are a deterministic function of the sequence's own history, so any
//! leakage between sequences changes the generated text.

use crate::backend::{
    BatchEntry, DecodeEngine, DecodeError, Pos, SeqId, TokenId, TokenizationError, Tokenizer,
    Vocabulary,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Beginning-of-sequence token
pub const BOS: TokenId = 1;
/// End-of-sequence token, rendered as `</s>`
pub const EOS: TokenId = 2;
/// End-of-turn token, flagged end-of-generation, rendered as `<|eot_id|>`
pub const EOT: TokenId = 3;

const BYTE_OFFSET: TokenId = 4;

/// Vocabulary size of `ByteVocab`
pub const VOCAB_SIZE: usize = 256 + BYTE_OFFSET as usize;

/// Token id of a raw byte
pub fn byte_token(byte: u8) -> TokenId {
    byte as TokenId + BYTE_OFFSET
}

/// Byte-level tokenizer: one token per UTF-8 byte, optional BOS
#[derive(Debug, Clone, Default)]
pub struct ByteVocab;

impl ByteVocab {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteVocab {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, TokenizationError> {
        if text.contains('\0') {
            return Err(TokenizationError("embedded NUL byte".to_string()));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(byte_token));
        Ok(tokens)
    }
}

impl Vocabulary for ByteVocab {
    fn end_of_sequence(&self) -> TokenId {
        EOS
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS || token == EOT
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        match token {
            BOS => b"<s>".to_vec(),
            EOS => b"</s>".to_vec(),
            EOT => b"<|eot_id|>".to_vec(),
            t if t >= BYTE_OFFSET && (t as usize) < VOCAB_SIZE => vec![(t - BYTE_OFFSET) as u8],
            _ => Vec::new(),
        }
    }
}

/// Cache operation recorded by `MockEngine`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Decode { seq_id: SeqId, pos: Pos },
    Copy { src: SeqId, dst: SeqId },
    Evict { seq_id: SeqId },
    Clear,
}

/// Observations shared with the test after the engine has been moved
#[derive(Debug, Default)]
pub struct MockStats {
    pub decode_calls: usize,
    pub failed_calls: usize,
    pub events: Vec<CacheEvent>,
    /// Most request sequences (id != 0) holding tokens at the same time
    pub peak_live_sequences: usize,
    /// Discipline violations; a correct scheduler leaves this empty
    pub violations: Vec<String>,
}

impl MockStats {
    /// Tokens decoded into `seq_id` over the engine's lifetime
    pub fn tokens_decoded(&self, seq_id: SeqId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, CacheEvent::Decode { seq_id: s, .. } if *s == seq_id))
            .count()
    }

    pub fn copies(&self) -> Vec<(SeqId, SeqId)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                CacheEvent::Copy { src, dst } => Some((*src, *dst)),
                _ => None,
            })
            .collect()
    }
}

type Script = Box<dyn Fn(&[TokenId]) -> TokenId + Send>;
type Fault = Box<dyn FnMut(&[BatchEntry]) -> Option<DecodeError> + Send>;

/// Deterministic decoder over an in-memory cache
pub struct MockEngine {
    context_length: usize,
    seq_capacity: usize,
    max_batch_size: usize,
    sequences: HashMap<SeqId, Vec<TokenId>>,
    logits: Vec<Option<Vec<f32>>>,
    script: Script,
    fault: Option<Fault>,
    poisoned: Vec<SeqId>,
    stats: Arc<Mutex<MockStats>>,
}

impl MockEngine {
    /// Engine with the default script: the next letter depends on the whole
    /// sequence history and EOS is never preferred
    pub fn new(context_length: usize, seq_capacity: usize) -> Self {
        Self {
            context_length,
            seq_capacity,
            max_batch_size: 512,
            sequences: HashMap::new(),
            logits: Vec::new(),
            script: Box::new(history_letter),
            fault: None,
            poisoned: Vec::new(),
            stats: Arc::new(Mutex::new(MockStats::default())),
        }
    }

    /// Replace the preferred-next-token function
    pub fn with_script(mut self, script: impl Fn(&[TokenId]) -> TokenId + Send + 'static) -> Self {
        self.script = Box::new(script);
        self
    }

    /// Inject failures: consulted before every decode call
    pub fn with_fault(
        mut self,
        fault: impl FnMut(&[BatchEntry]) -> Option<DecodeError> + Send + 'static,
    ) -> Self {
        self.fault = Some(Box::new(fault));
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Produce NaN logits for `seq_id`
    pub fn with_poisoned_sequence(mut self, seq_id: SeqId) -> Self {
        self.poisoned.push(seq_id);
        self
    }

    /// Handle to the recorded statistics
    pub fn stats(&self) -> Arc<Mutex<MockStats>> {
        Arc::clone(&self.stats)
    }

    /// Tokens currently resident in `seq_id`
    pub fn sequence_len(&self, seq_id: SeqId) -> usize {
        self.sequences.get(&seq_id).map_or(0, Vec::len)
    }

    /// Sequences currently holding tokens, sequence 0 included
    pub fn live_sequences(&self) -> usize {
        self.sequences.values().filter(|s| !s.is_empty()).count()
    }

    fn make_logits(&self, seq_id: SeqId, history: &[TokenId]) -> Vec<f32> {
        if self.poisoned.contains(&seq_id) {
            return vec![f32::NAN; VOCAB_SIZE];
        }

        let hash = fnv1a(history);
        let preferred = (self.script)(history) as usize;
        (0..VOCAB_SIZE)
            .map(|t| {
                let noise = (fnv1a_mix(hash, t as u64) % 1000) as f32 / 500.0;
                if t == preferred {
                    noise + 8.0
                } else {
                    noise
                }
            })
            .collect()
    }
}

impl DecodeEngine for MockEngine {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn seq_capacity(&self) -> usize {
        self.seq_capacity
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn decode(&mut self, batch: &[BatchEntry]) -> Result<(), DecodeError> {
        let mut stats = self.stats.lock();
        stats.decode_calls += 1;

        if let Some(fault) = self.fault.as_mut() {
            if let Some(err) = fault(batch) {
                stats.failed_calls += 1;
                return Err(err);
            }
        }

        if batch.is_empty() || batch.len() > self.max_batch_size {
            stats.violations.push(format!("batch of {} entries", batch.len()));
            return Err(DecodeError::Fatal(-1));
        }

        // Validate the whole batch before touching the cache
        let mut next_pos: HashMap<SeqId, Pos> = HashMap::new();
        for entry in batch {
            if entry.seq_id as usize > self.seq_capacity {
                stats.violations.push(format!("sequence {} out of range", entry.seq_id));
                return Err(DecodeError::Fatal(-2));
            }
            let expected = next_pos
                .entry(entry.seq_id)
                .or_insert_with(|| self.sequences.get(&entry.seq_id).map_or(0, Vec::len));
            if entry.pos != *expected || entry.pos >= self.context_length {
                stats.violations.push(format!(
                    "sequence {}: token at position {}, expected {}",
                    entry.seq_id, entry.pos, expected
                ));
                return Err(DecodeError::Fatal(-2));
            }
            *expected += 1;
        }

        let mut logits = Vec::with_capacity(batch.len());
        for entry in batch {
            let seq = self.sequences.entry(entry.seq_id).or_default();
            seq.push(entry.token);
            stats.events.push(CacheEvent::Decode {
                seq_id: entry.seq_id,
                pos: entry.pos,
            });
            let history = seq.clone();
            logits.push(entry.logits.then(|| self.make_logits(entry.seq_id, &history)));
        }
        self.logits = logits;

        let live = self
            .sequences
            .iter()
            .filter(|(id, s)| **id != 0 && !s.is_empty())
            .count();
        stats.peak_live_sequences = stats.peak_live_sequences.max(live);
        Ok(())
    }

    fn logits(&self, index: usize) -> Option<&[f32]> {
        self.logits.get(index)?.as_deref()
    }

    fn copy_sequence(&mut self, src: SeqId, dst: SeqId) {
        let mut stats = self.stats.lock();
        if self.sequence_len(dst) != 0 {
            stats
                .violations
                .push(format!("copy into non-empty sequence {}", dst));
        }
        let tokens = self.sequences.get(&src).cloned().unwrap_or_default();
        self.sequences.insert(dst, tokens);
        stats.events.push(CacheEvent::Copy { src, dst });
    }

    fn evict_sequence(&mut self, seq: SeqId, from: Pos, to: Option<Pos>) {
        if let Some(tokens) = self.sequences.get_mut(&seq) {
            let end = to.unwrap_or(tokens.len()).min(tokens.len());
            if from < end {
                tokens.drain(from..end);
            }
        }
        self.stats.lock().events.push(CacheEvent::Evict { seq_id: seq });
    }

    fn clear_all(&mut self) {
        self.sequences.clear();
        self.logits.clear();
        self.stats.lock().events.push(CacheEvent::Clear);
    }
}

/// Default script: a lowercase letter chosen from the token sum of the history
pub fn history_letter(history: &[TokenId]) -> TokenId {
    let sum: u64 = history.iter().map(|&t| t as u64).sum();
    byte_token(b'a' + (sum % 26) as u8)
}

/// Script that spells `text` after a prompt of `prompt_len` tokens, then
/// prefers `tail` forever
pub fn spell(text: &str, prompt_len: usize, tail: TokenId) -> impl Fn(&[TokenId]) -> TokenId {
    let bytes = text.as_bytes().to_vec();
    move |history| {
        let generated = history.len().saturating_sub(prompt_len);
        bytes.get(generated).map_or(tail, |&b| byte_token(b))
    }
}

fn fnv1a(tokens: &[TokenId]) -> u64 {
    tokens
        .iter()
        .fold(0xcbf2_9ce4_8422_2325, |h, &t| fnv1a_mix(h, t as u64))
}

fn fnv1a_mix(hash: u64, value: u64) -> u64 {
    (hash ^ value).wrapping_mul(0x0000_0100_0000_01b3)
}
