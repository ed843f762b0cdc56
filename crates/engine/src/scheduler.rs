//! Continuous-batching scheduler
//!
//! Multiplexes many prompts onto one decoder and its KV cache. A fixed pool of
//! slots, each bound to its own cache sequence, advances in lockstep: every
//! iteration decodes one token per active slot in a single batch, samples each
//! slot from its own logits, and recycles finished slots for pending prompts.
//! A prompt prefix shared by every prompt is decoded once into sequence 0 and
//! copied into each slot.

use crate::backend::{
    BatchEntry, DecodeEngine, Sampler, SamplerFactory, SeqId, TokenId, Tokenizer, Vocabulary,
};
use crate::chunker::{BatchChunker, ChunkOutcome};
use crate::cleaner::ResponseCleaner;
use crate::output::{Completion, GenerationStats, ParallelOutput, Progress};
use crate::prefix::shared_prefix_len;
use crate::slot::{Slot, SlotResult, StopCriteria};
use batchloop_common::metrics::GenerationMetrics;
use batchloop_common::{
    BatchLoopConfig, BatchLoopError, GenerationParams, MetricsRegistry, Result, SchedulerConfig,
    METRICS,
};
use crossbeam::channel::Sender;
use std::ops::{ControlFlow, Range};
use std::time::Instant;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Cache sequence holding the shared prompt prefix
pub const SHARED_PREFIX_SEQ: SeqId = 0;

/// Parallel text generator over one decode engine
///
/// The generator owns its engine; `generate_parallel` takes `&mut self`, so
/// at most one run uses the cache at a time.
pub struct ParallelGenerator<E, M, F> {
    engine: E,
    model: M,
    samplers: F,
    config: BatchLoopConfig,
    metrics: Option<&'static MetricsRegistry>,
}

impl<E, M, F> ParallelGenerator<E, M, F>
where
    E: DecodeEngine,
    M: Tokenizer + Vocabulary,
    F: SamplerFactory,
{
    /// Create a generator
    ///
    /// Fails when the configuration is invalid or the engine cannot hold a
    /// single request sequence.
    pub fn new(engine: E, model: M, samplers: F, config: &BatchLoopConfig) -> Result<Self> {
        config.validate()?;
        if engine.seq_capacity() == 0 {
            return Err(BatchLoopError::config(
                "decode engine must support at least one sequence",
            ));
        }

        Ok(Self {
            engine,
            model,
            samplers,
            config: config.clone(),
            metrics: config.metrics_enabled().then_some(&*METRICS),
        })
    }

    /// Record into `registry` instead of the global one; ignored when the
    /// configuration disables metrics
    pub fn with_metrics_registry(mut self, registry: &'static MetricsRegistry) -> Self {
        if self.metrics.is_some() {
            self.metrics = Some(registry);
        }
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn config(&self) -> &BatchLoopConfig {
        &self.config
    }

    /// Generate with the configured generation parameters and no progress sink
    pub fn generate<S: AsRef<str>>(&mut self, prompts: &[S]) -> Result<ParallelOutput> {
        let params = self.config.generation.clone();
        self.generate_parallel(prompts, &params, None)
    }

    /// Generate one continuation per prompt
    ///
    /// The output is aligned with `prompts`. Prompts that cannot be served
    /// come back as failed completions; only fatal decode errors and invalid
    /// input fail the whole call. Every cache sequence is evicted before
    /// returning, on success and on error.
    pub fn generate_parallel<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        params: &GenerationParams,
        progress: Option<&Sender<Progress>>,
    ) -> Result<ParallelOutput> {
        if prompts.is_empty() {
            return Err(BatchLoopError::invalid_input("no prompts given"));
        }
        params.validate()?;

        let run_id = Uuid::new_v4();
        let span = info_span!("generate_parallel", run_id = %run_id, prompts = prompts.len());
        let _guard = span.enter();

        let start = Instant::now();
        let metrics = self.metrics;
        if let Some(metrics) = metrics {
            metrics.generation.prompts_total.inc_by(prompts.len() as u64);
        }

        self.engine.clear_all();
        let seed = params.resolve_seed();
        debug!("Resolved seed {}", seed);

        let ceiling = self
            .config
            .scheduler
            .max_batch_size
            .min(self.engine.max_batch_size());

        let mut run = Run {
            engine: &mut self.engine,
            model: &self.model,
            samplers: &self.samplers,
            params,
            scheduler: &self.config.scheduler,
            seed,
            stop: StopCriteria::new(
                params.max_tokens,
                self.config.scheduler.stop_check_min_tokens,
                &params.stop_sequences,
            ),
            cleaner: ResponseCleaner::new(&self.config.cleaner, &params.stop_sequences),
            chunker: BatchChunker::new(ceiling).with_metrics(metrics),
            metrics,
            progress: if params.show_progress { progress } else { None },
            tokens: vec![Vec::new(); prompts.len()],
            admitted: Vec::new(),
            next_prompt: 0,
            prefix: Vec::new(),
            slots: Vec::new(),
            completions: vec![None; prompts.len()],
            completed: 0,
            stats: GenerationStats::default(),
        };

        let result = run.execute(prompts);
        run.teardown();
        if let Some(metrics) = metrics {
            metrics.generation.active_slots.set(0);
            metrics
                .generation
                .run_duration
                .observe(start.elapsed().as_secs_f64());
        }

        if let Err(e) = result {
            warn!("Run aborted: {}", e);
            return Err(e);
        }

        let output = run.into_output(start);
        info!(
            "Run complete: {} prompts ({} failed), {} prompt tokens ({:.1} tok/s), \
             {} generated tokens ({:.1} tok/s) in {:.2?}, {} decode calls, {} cache misses",
            output.completions.len(),
            output.failed(),
            output.stats.prompt_tokens,
            output.stats.prompt_throughput(),
            output.stats.generated_tokens,
            output.stats.generation_throughput(),
            output.stats.elapsed,
            output.stats.decode_calls,
            output.stats.cache_misses,
        );
        Ok(output)
    }
}

/// State of one `generate_parallel` call
struct Run<'a, E, M, F: SamplerFactory> {
    engine: &'a mut E,
    model: &'a M,
    samplers: &'a F,
    params: &'a GenerationParams,
    scheduler: &'a SchedulerConfig,
    seed: u64,
    stop: StopCriteria,
    cleaner: ResponseCleaner,
    chunker: BatchChunker,
    metrics: Option<&'static MetricsRegistry>,
    progress: Option<&'a Sender<Progress>>,

    /// Tokens per prompt, empty for rejected prompts
    tokens: Vec<Vec<TokenId>>,
    /// Global indices of admitted prompts, in input order
    admitted: Vec<usize>,
    /// Cursor into `admitted`
    next_prompt: usize,
    /// Tokens resident in the shared prefix sequence, empty when not sharing
    prefix: Vec<TokenId>,
    slots: Vec<Slot<F::Sampler>>,
    completions: Vec<Option<Completion>>,
    completed: usize,
    stats: GenerationStats,
}

impl<'a, E, M, F> Run<'a, E, M, F>
where
    E: DecodeEngine,
    M: Tokenizer + Vocabulary,
    F: SamplerFactory,
{
    fn execute<S: AsRef<str>>(&mut self, prompts: &[S]) -> Result<()> {
        self.admit_prompts(prompts);
        if self.admitted.is_empty() {
            warn!("No prompt passed admission");
            return Ok(());
        }

        self.prepare_shared_prefix()?;

        let max_slots = match self.scheduler.max_slots {
            0 => usize::MAX,
            n => n,
        };
        let pool = self
            .engine
            .seq_capacity()
            .min(max_slots)
            .min(self.admitted.len());
        self.slots = (0..pool).map(|i| Slot::new(i as SeqId + 1)).collect();
        debug!("Slot pool of {} for {} admitted prompts", pool, self.admitted.len());

        for index in 0..pool {
            self.assign(index)?;
        }

        loop {
            let active = self.slots.iter().filter(|s| s.is_active()).count();
            if active == 0 {
                break;
            }
            self.stats.peak_active_slots = self.stats.peak_active_slots.max(active);
            self.record_metric(|g| g.active_slots.set(active as i64));

            self.step()?;
            self.finalize_and_refill()?;
        }

        Ok(())
    }

    /// Tokenize every prompt and reject the ones that cannot be served
    fn admit_prompts<S: AsRef<str>>(&mut self, prompts: &[S]) {
        let context_length = self.engine.context_length();
        let limit = context_length.saturating_sub(self.scheduler.reserved_context);

        for (index, prompt) in prompts.iter().enumerate() {
            let rejection = match self.model.tokenize(prompt.as_ref(), true) {
                Err(e) => Some((0, BatchLoopError::from(e).to_string())),
                Ok(tokens) if tokens.is_empty() => Some((0, "Prompt produced no tokens".to_string())),
                Ok(tokens) if tokens.len() > limit => Some((
                    tokens.len(),
                    format!(
                        "Prompt too long: {} tokens exceeds the limit of {} (context {}, reserved {})",
                        tokens.len(),
                        limit,
                        context_length,
                        self.scheduler.reserved_context
                    ),
                )),
                Ok(tokens) => {
                    self.tokens[index] = tokens;
                    None
                }
            };

            match rejection {
                Some((prompt_tokens, message)) => {
                    warn!("Rejecting prompt {}: {}", index, message);
                    self.record_metric(|g| g.prompts_rejected.inc());
                    self.record(index, Completion::failed(prompt_tokens, message));
                }
                None => self.admitted.push(index),
            }
        }

        debug!(
            "Admitted {} of {} prompts",
            self.admitted.len(),
            prompts.len()
        );
    }

    /// Decode the prefix common to every admitted prompt into sequence 0
    fn prepare_shared_prefix(&mut self) -> Result<()> {
        if !self.scheduler.share_prefix || self.admitted.len() < 2 {
            return Ok(());
        }

        let admitted: Vec<&[TokenId]> = self
            .admitted
            .iter()
            .map(|&i| self.tokens[i].as_slice())
            .collect();
        let min_len = admitted.iter().map(|t| t.len()).min().unwrap_or(0);
        // Every prompt keeps its last token out of the prefix
        let len = shared_prefix_len(&admitted).min(min_len.saturating_sub(1));
        if len == 0 {
            debug!("No shared prefix");
            return Ok(());
        }

        let prefix = admitted[0][..len].to_vec();
        let batch: Vec<BatchEntry> = prefix
            .iter()
            .enumerate()
            .map(|(pos, &token)| BatchEntry {
                token,
                pos,
                seq_id: SHARED_PREFIX_SEQ,
                logits: false,
            })
            .collect();

        let mut exhausted = None;
        self.chunker
            .decode(&mut *self.engine, &batch, "prefix", |_, outcome| match outcome {
                ChunkOutcome::Decoded(_) => ControlFlow::Continue(()),
                ChunkOutcome::Exhausted { code, .. } => {
                    exhausted = Some(code);
                    ControlFlow::Break(())
                }
            })?;

        if let Some(code) = exhausted {
            warn!(
                "Shared prefix of {} tokens could not be decoded (code {}), continuing without sharing",
                len, code
            );
            self.engine.evict_sequence(SHARED_PREFIX_SEQ, 0, None);
            return Ok(());
        }

        info!("Decoded shared prefix of {} tokens once", len);
        self.stats.shared_prefix_len = len;
        self.stats.prompt_tokens += len;
        self.record_metric(|g| g.prompt_tokens_total.inc_by(len as u64));
        self.prefix = prefix;
        Ok(())
    }

    /// Bind the next pending prompt that can be ingested to slot `index`
    ///
    /// Prompts failing sampler construction or ingestion are recorded as
    /// failures and skipped. The slot stays empty when the queue runs out.
    fn assign(&mut self, index: usize) -> Result<()> {
        while let Some(&global) = self.admitted.get(self.next_prompt) {
            self.next_prompt += 1;
            let tokens = std::mem::take(&mut self.tokens[global]);

            let sampler = match self.samplers.new_sampler(self.params, self.seed) {
                Ok(sampler) => sampler,
                Err(e) => {
                    warn!("Prompt {}: sampler construction failed: {}", global, e);
                    self.fail_prompt(global, tokens.len(), format!("Sampling failed: {}", e));
                    continue;
                }
            };

            let seq_id = self.slots[index].seq_id();
            let shared = if !self.prefix.is_empty() && tokens.starts_with(&self.prefix) {
                self.engine.copy_sequence(SHARED_PREFIX_SEQ, seq_id);
                self.prefix.len()
            } else {
                0
            };

            // The last prompt token is fed as the first generation input
            let suffix: Vec<BatchEntry> = tokens[shared..tokens.len() - 1]
                .iter()
                .enumerate()
                .map(|(i, &token)| BatchEntry {
                    token,
                    pos: shared + i,
                    seq_id,
                    logits: false,
                })
                .collect();

            let mut exhausted = None;
            if !suffix.is_empty() {
                self.chunker
                    .decode(&mut *self.engine, &suffix, "prompt", |_, outcome| match outcome {
                        ChunkOutcome::Decoded(_) => ControlFlow::Continue(()),
                        ChunkOutcome::Exhausted { code, .. } => {
                            exhausted = Some(code);
                            ControlFlow::Break(())
                        }
                    })?;
            }

            if let Some(code) = exhausted {
                self.engine.evict_sequence(seq_id, 0, None);
                self.fail_prompt(
                    global,
                    tokens.len(),
                    format!("Prompt ingestion failed under cache pressure (code {})", code),
                );
                continue;
            }

            let ingested = tokens.len() - shared;
            self.stats.prompt_tokens += ingested;
            self.record_metric(|g| g.prompt_tokens_total.inc_by(ingested as u64));

            debug!(
                "Prompt {} -> sequence {} ({} tokens, {} shared)",
                global,
                seq_id,
                tokens.len(),
                shared
            );
            self.slots[index].assign(global, &tokens, sampler);
            return Ok(());
        }

        Ok(())
    }

    /// Decode one token for every active slot and sample the next ones
    fn step(&mut self) -> Result<()> {
        let context_length = self.engine.context_length();

        let mut batch = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot.next_entry(batch.len(), context_length) {
                batch.push(entry);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let slots = &mut self.slots;
        let model = self.model;
        let stop = &self.stop;
        self.chunker
            .decode(&mut *self.engine, &batch, "generate", |engine, outcome| {
                match outcome {
                    ChunkOutcome::Decoded(range) => sample_chunk(engine, slots, model, stop, range),
                    ChunkOutcome::Exhausted { range, code } => {
                        for slot in slots_in(slots, &range) {
                            slot.fail(format!("Decode failed under cache pressure (code {})", code));
                        }
                    }
                }
                ControlFlow::Continue(())
            })
    }

    /// Evict, record and recycle every slot that stopped this iteration
    fn finalize_and_refill(&mut self) -> Result<()> {
        for index in 0..self.slots.len() {
            if !self.slots[index].is_terminal() {
                continue;
            }

            let seq_id = self.slots[index].seq_id();
            self.engine.evict_sequence(seq_id, 0, None);
            if let Some(result) = self.slots[index].release() {
                self.complete(result);
            }

            self.assign(index)?;
        }
        Ok(())
    }

    fn complete(&mut self, result: SlotResult) {
        self.stats.generated_tokens += result.generated_tokens;
        self.record_metric(|g| g.tokens_generated_total.inc_by(result.generated_tokens as u64));

        let text = if result.finish_reason.is_failure() {
            self.record_metric(|g| g.prompts_failed.inc());
            warn!("Prompt {} failed: {}", result.global_index, result.finish_reason);
            String::new()
        } else {
            self.record_metric(|g| g.prompts_completed.inc());
            debug!(
                "Prompt {} finished ({}) after {} tokens",
                result.global_index, result.finish_reason, result.generated_tokens
            );
            self.cleaner.clean_bytes(&result.response)
        };

        self.record(
            result.global_index,
            Completion {
                text,
                prompt_tokens: result.prompt_len,
                generated_tokens: result.generated_tokens,
                finish_reason: result.finish_reason,
            },
        );
    }

    fn record_metric(&self, update: impl FnOnce(&GenerationMetrics)) {
        if let Some(metrics) = self.metrics {
            update(&metrics.generation);
        }
    }

    fn fail_prompt(&mut self, global: usize, prompt_tokens: usize, message: String) {
        self.record_metric(|g| g.prompts_failed.inc());
        self.record(global, Completion::failed(prompt_tokens, message));
    }

    fn record(&mut self, global: usize, completion: Completion) {
        self.completions[global] = Some(completion);
        self.completed += 1;

        if self.params.show_progress {
            let update = Progress {
                completed: self.completed,
                total: self.completions.len(),
            };
            info!("Progress: {}/{} prompts", update.completed, update.total);
            if let Some(tx) = self.progress {
                // A dropped receiver only loses progress updates
                let _ = tx.send(update);
            }
        }
    }

    /// Evict every slot sequence and the shared prefix
    fn teardown(&mut self) {
        for slot in &self.slots {
            self.engine.evict_sequence(slot.seq_id(), 0, None);
        }
        self.engine.evict_sequence(SHARED_PREFIX_SEQ, 0, None);
    }

    fn into_output(self, start: Instant) -> ParallelOutput {
        let completions = self
            .completions
            .into_iter()
            .map(|c| c.unwrap_or_else(|| Completion::failed(0, "Prompt was never scheduled")))
            .collect();

        ParallelOutput {
            completions,
            stats: GenerationStats {
                cache_misses: self.chunker.cache_misses(),
                decode_calls: self.chunker.decode_calls(),
                elapsed: start.elapsed(),
                ..self.stats
            },
        }
    }
}

fn slots_in<'s, S: Sampler>(
    slots: &'s mut [Slot<S>],
    range: &'s Range<usize>,
) -> impl Iterator<Item = &'s mut Slot<S>> + 's {
    slots
        .iter_mut()
        .filter(move |slot| slot.batch_index().map_or(false, |i| range.contains(&i)))
}

/// Sample every slot whose entry landed in the decoded `range`
fn sample_chunk<E, V, S>(
    engine: &E,
    slots: &mut [Slot<S>],
    vocab: &V,
    stop: &StopCriteria,
    range: Range<usize>,
) where
    E: DecodeEngine + ?Sized,
    V: Vocabulary + ?Sized,
    S: Sampler,
{
    for slot in slots_in(slots, &range) {
        let Some(i_batch) = slot.batch_index() else {
            continue;
        };

        let Some(logits) = engine.logits(i_batch - range.start) else {
            slot.fail(format!("Sampling failed: no logits for batch entry {}", i_batch));
            continue;
        };

        match slot.sample(logits) {
            Ok(token) => {
                slot.advance(token, vocab, stop);
            }
            Err(e) => {
                warn!("Sequence {}: sampling failed: {}", slot.seq_id(), e);
                slot.fail(format!("Sampling failed: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::LogitsSamplerFactory;
    use crate::testing::{ByteVocab, CacheEvent, MockEngine};
    use batchloop_common::config::ObservabilityConfig;

    fn generator(engine: MockEngine) -> ParallelGenerator<MockEngine, ByteVocab, LogitsSamplerFactory> {
        let mut config = BatchLoopConfig::default();
        config.generation.seed = 11;
        config.generation.temperature = 0.0;
        config.generation.max_tokens = 4;
        ParallelGenerator::new(engine, ByteVocab::new(), LogitsSamplerFactory, &config).unwrap()
    }

    #[test]
    fn test_rejects_zero_capacity_engine() {
        let result = ParallelGenerator::new(
            MockEngine::new(64, 0),
            ByteVocab::new(),
            LogitsSamplerFactory,
            &BatchLoopConfig::default(),
        );
        assert!(matches!(result, Err(BatchLoopError::Config(_))));
    }

    #[test]
    fn test_empty_prompt_list_is_invalid() {
        let mut gen = generator(MockEngine::new(256, 2));
        let prompts: Vec<String> = Vec::new();
        assert!(matches!(
            gen.generate(&prompts),
            Err(BatchLoopError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut gen = generator(MockEngine::new(256, 2));
        let params = GenerationParams {
            top_p: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            gen.generate_parallel(&["hi"], &params, None),
            Err(BatchLoopError::Config(_))
        ));
    }

    #[test]
    fn test_bridge_token_decoded_once() {
        let engine = MockEngine::new(256, 1);
        let stats = engine.stats();
        let mut gen = generator(engine);

        let output = gen.generate(&["abc"]).unwrap();

        // BOS a b c, then 4 generated tokens of which the last is never fed back
        let completion = &output.completions[0];
        assert_eq!(completion.prompt_tokens, 4);
        assert_eq!(completion.generated_tokens, 4);
        assert_eq!(stats.lock().tokens_decoded(1), 4 + 3);
        assert!(stats.lock().violations.is_empty());
    }

    #[test]
    fn test_prefix_not_shared_for_single_prompt() {
        let engine = MockEngine::new(256, 2);
        let stats = engine.stats();
        let mut gen = generator(engine);

        let output = gen.generate(&["same prefix"]).unwrap();

        assert_eq!(output.stats.shared_prefix_len, 0);
        assert_eq!(stats.lock().tokens_decoded(SHARED_PREFIX_SEQ), 0);
    }

    #[test]
    fn test_teardown_evicts_everything() {
        let engine = MockEngine::new(256, 3);
        let stats = engine.stats();
        let mut gen = generator(engine);

        gen.generate(&["shared one", "shared two", "shared three"]).unwrap();

        assert_eq!(gen.engine().live_sequences(), 0);
        let stats = stats.lock();
        assert_eq!(stats.events.first(), Some(&CacheEvent::Clear));
        assert!(stats
            .events
            .iter()
            .any(|e| *e == CacheEvent::Evict { seq_id: SHARED_PREFIX_SEQ }));
    }

    #[test]
    fn test_metrics_follow_config() {
        let prompts = ["count me", "count me too"];

        let enabled: &'static MetricsRegistry = Box::leak(Box::new(MetricsRegistry::new()));
        let mut gen = generator(MockEngine::new(256, 2)).with_metrics_registry(enabled);
        let output = gen.generate(&prompts).unwrap();
        assert_eq!(enabled.generation.prompts_total.get(), 2);
        assert_eq!(enabled.generation.prompts_completed.get(), 2);
        assert_eq!(
            enabled.generation.tokens_generated_total.get(),
            output.stats.generated_tokens as u64
        );
        assert!(enabled.decode.decode_calls_total.get() > 0);
        assert_eq!(enabled.generation.active_slots.get(), 0);

        let disabled: &'static MetricsRegistry = Box::leak(Box::new(MetricsRegistry::new()));
        let mut config = BatchLoopConfig::default();
        config.observability = Some(ObservabilityConfig {
            enable_metrics: false,
            ..Default::default()
        });
        let mut gen = ParallelGenerator::new(
            MockEngine::new(256, 2),
            ByteVocab::new(),
            LogitsSamplerFactory,
            &config,
        )
        .unwrap()
        .with_metrics_registry(disabled);
        gen.generate(&prompts).unwrap();
        assert_eq!(disabled.generation.prompts_total.get(), 0);
        assert_eq!(disabled.generation.tokens_generated_total.get(), 0);
        assert_eq!(disabled.decode.decode_calls_total.get(), 0);
        assert_eq!(disabled.decode.batch_size.get_sample_count(), 0);
    }
}
