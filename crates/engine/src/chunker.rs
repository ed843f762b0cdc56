//! Chunked decoding with adaptive shrink on cache pressure
//!
//! A logical batch can be larger than what the decoder accepts in one call, and
//! the decoder's free cache capacity is not known up front. The chunker splits
//! the batch into runs no longer than its ceiling and, when the engine reports
//! a transient failure, halves the run length and retries from the same offset.

use crate::backend::{BatchEntry, DecodeEngine, DecodeError};
use batchloop_common::metrics::LatencyTimer;
use batchloop_common::{BatchLoopError, MetricsRegistry, Result};
use std::ops::{ControlFlow, Range};
use tracing::{trace, warn};

/// Result of decoding one run of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Entries in `range` are in the cache; their logits are readable now
    Decoded(Range<usize>),

    /// The entry in `range` kept failing transiently at chunk size 1
    Exhausted { range: Range<usize>, code: i32 },
}

/// Splits batches into decoder-sized chunks
#[derive(Debug, Clone)]
pub struct BatchChunker {
    ceiling: usize,
    cache_misses: u64,
    decode_calls: u64,
    metrics: Option<&'static MetricsRegistry>,
}

impl BatchChunker {
    /// Create a chunker; a zero ceiling is treated as 1
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            cache_misses: 0,
            decode_calls: 0,
            metrics: None,
        }
    }

    /// Record decode calls, batch sizes and cache misses in `metrics`
    pub fn with_metrics(mut self, metrics: Option<&'static MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Transient failures seen so far
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses
    }

    /// Decode calls issued so far, failed ones included
    pub fn decode_calls(&self) -> u64 {
        self.decode_calls
    }

    /// Decode `batch` chunk by chunk, reporting each chunk to `on_chunk`
    ///
    /// The callback runs right after its chunk, before the next decode call
    /// overwrites the engine's logits; returning `ControlFlow::Break` stops
    /// decoding the rest of the batch. A fatal engine error aborts with
    /// `BatchLoopError::Decode` tagged with `stage`.
    pub fn decode<E, F>(
        &mut self,
        engine: &mut E,
        batch: &[BatchEntry],
        stage: &'static str,
        mut on_chunk: F,
    ) -> Result<()>
    where
        E: DecodeEngine + ?Sized,
        F: FnMut(&E, ChunkOutcome) -> ControlFlow<()>,
    {
        let mut limit = self.ceiling;
        let mut offset = 0;

        while offset < batch.len() {
            let n_tokens = limit.min(batch.len() - offset);
            let range = offset..offset + n_tokens;

            self.decode_calls += 1;
            let chunk = &batch[range.clone()];
            let result = match self.metrics {
                Some(metrics) => {
                    metrics.decode.decode_calls_total.inc();
                    metrics.decode.batch_size.observe(n_tokens as f64);
                    metrics.decode.decode_duration.time(|| engine.decode(chunk))
                }
                None => engine.decode(chunk),
            };

            match result {
                Ok(()) => {
                    trace!("{}: decoded entries {:?}", stage, range);
                    if on_chunk(&*engine, ChunkOutcome::Decoded(range)).is_break() {
                        return Ok(());
                    }
                    offset += n_tokens;
                }
                Err(DecodeError::Transient(code)) => {
                    self.cache_misses += 1;
                    if let Some(metrics) = self.metrics {
                        metrics.decode.cache_misses_total.inc();
                    }

                    if n_tokens == 1 {
                        warn!(
                            "{}: entry {} still failing at chunk size 1 (code {}), giving up on it",
                            stage, offset, code
                        );
                        if on_chunk(&*engine, ChunkOutcome::Exhausted { range, code }).is_break() {
                            return Ok(());
                        }
                        offset += 1;
                    } else {
                        limit = (n_tokens / 2).max(1);
                        warn!(
                            "{}: transient decode failure (code {}), retrying with chunk size {}",
                            stage, code, limit
                        );
                    }
                }
                Err(DecodeError::Fatal(code)) => {
                    return Err(BatchLoopError::decode(stage, code));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;

    fn entries(n: usize) -> Vec<BatchEntry> {
        (0..n)
            .map(|i| BatchEntry {
                token: 10 + i as u32,
                pos: i,
                seq_id: 1,
                logits: i + 1 == n,
            })
            .collect()
    }

    #[test]
    fn test_splits_at_ceiling() {
        let mut engine = MockEngine::new(256, 4);
        let mut chunker = BatchChunker::new(4);
        let mut ranges = Vec::new();

        chunker
            .decode(&mut engine, &entries(10), "test", |_, outcome| {
                ranges.push(outcome);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(
            ranges,
            vec![
                ChunkOutcome::Decoded(0..4),
                ChunkOutcome::Decoded(4..8),
                ChunkOutcome::Decoded(8..10),
            ]
        );
        assert_eq!(chunker.decode_calls(), 3);
        assert_eq!(chunker.cache_misses(), 0);
        assert_eq!(engine.sequence_len(1), 10);
    }

    #[test]
    fn test_shrinks_on_transient_failure() {
        let mut engine = MockEngine::new(256, 4)
            .with_fault(|chunk| (chunk.len() > 3).then_some(DecodeError::Transient(1)));
        let mut chunker = BatchChunker::new(8);
        let mut ranges = Vec::new();

        chunker
            .decode(&mut engine, &entries(8), "test", |_, outcome| {
                ranges.push(outcome);
                ControlFlow::Continue(())
            })
            .unwrap();

        // 8 fails, 4 fails, then runs of 2
        assert_eq!(chunker.cache_misses(), 2);
        assert_eq!(
            ranges,
            vec![
                ChunkOutcome::Decoded(0..2),
                ChunkOutcome::Decoded(2..4),
                ChunkOutcome::Decoded(4..6),
                ChunkOutcome::Decoded(6..8),
            ]
        );
        assert_eq!(engine.sequence_len(1), 8);
    }

    #[test]
    fn test_exhausted_entry_is_skipped() {
        let mut engine = MockEngine::new(256, 4)
            .with_fault(|chunk| chunk.iter().any(|e| e.seq_id == 2).then_some(DecodeError::Transient(1)));
        let mut chunker = BatchChunker::new(2);
        let batch = vec![
            BatchEntry { token: 5, pos: 0, seq_id: 1, logits: true },
            BatchEntry { token: 6, pos: 0, seq_id: 2, logits: true },
            BatchEntry { token: 7, pos: 0, seq_id: 3, logits: true },
        ];
        let mut outcomes = Vec::new();

        chunker
            .decode(&mut engine, &batch, "test", |_, outcome| {
                outcomes.push(outcome);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                ChunkOutcome::Decoded(0..1),
                ChunkOutcome::Exhausted { range: 1..2, code: 1 },
                ChunkOutcome::Decoded(2..3),
            ]
        );
        assert_eq!(engine.sequence_len(2), 0);
        assert_eq!(engine.sequence_len(3), 1);
    }

    #[test]
    fn test_break_stops_decoding() {
        let mut engine = MockEngine::new(256, 4);
        let mut chunker = BatchChunker::new(2);
        let mut calls = 0;

        chunker
            .decode(&mut engine, &entries(6), "test", |_, _| {
                calls += 1;
                ControlFlow::Break(())
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(engine.sequence_len(1), 2);
    }

    #[test]
    fn test_fatal_failure_aborts() {
        let mut engine = MockEngine::new(256, 4)
            .with_fault(|_| Some(DecodeError::Fatal(-1)));
        let mut chunker = BatchChunker::new(4);
        let mut called = false;

        let err = chunker
            .decode(&mut engine, &entries(3), "prompt", |_, _| {
                called = true;
                ControlFlow::Continue(())
            })
            .unwrap_err();

        assert!(matches!(err, BatchLoopError::Decode { stage: "prompt", code: -1 }));
        assert!(!called);
    }

    #[test]
    fn test_logits_visible_in_callback() {
        let mut engine = MockEngine::new(256, 4);
        let mut chunker = BatchChunker::new(2);
        let mut seen = Vec::new();

        chunker
            .decode(&mut engine, &entries(4), "test", |engine, outcome| {
                if let ChunkOutcome::Decoded(range) = outcome {
                    for i in 0..range.len() {
                        seen.push(engine.logits(i).is_some());
                    }
                }
                ControlFlow::Continue(())
            })
            .unwrap();

        // Only the last entry asked for logits
        assert_eq!(seen, vec![false, false, false, true]);
    }

    #[test]
    fn test_metrics_recorded_only_when_attached() {
        let registry: &'static MetricsRegistry = Box::leak(Box::new(MetricsRegistry::new()));
        let faulty = || {
            MockEngine::new(256, 4)
                .with_fault(|chunk| (chunk.len() > 2).then_some(DecodeError::Transient(1)))
        };

        let mut detached = BatchChunker::new(4);
        detached
            .decode(&mut faulty(), &entries(4), "test", |_, _| ControlFlow::Continue(()))
            .unwrap();
        assert_eq!(detached.decode_calls(), 3);
        assert_eq!(registry.decode.decode_calls_total.get(), 0);

        let mut attached = BatchChunker::new(4).with_metrics(Some(registry));
        attached
            .decode(&mut faulty(), &entries(4), "test", |_, _| ControlFlow::Continue(()))
            .unwrap();
        assert_eq!(registry.decode.decode_calls_total.get(), 3);
        assert_eq!(registry.decode.cache_misses_total.get(), 1);
        assert_eq!(registry.decode.batch_size.get_sample_count(), 3);
    }
}
