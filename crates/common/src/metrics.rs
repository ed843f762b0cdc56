//! Metrics collection for BatchLoop
//!
//! This module provides Prometheus metrics for observability.
//! All metrics are plain counters/gauges so the per-token hot path stays cheap.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for BatchLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub generation: GenerationMetrics,
    pub decode: DecodeMetrics,
}

/// Per-prompt and per-run metrics
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    /// Total number of prompts submitted
    pub prompts_total: IntCounter,

    /// Prompts rejected at admission (empty, too long, untokenizable)
    pub prompts_rejected: IntCounter,

    /// Prompts that failed after admission
    pub prompts_failed: IntCounter,

    /// Prompts that completed normally
    pub prompts_completed: IntCounter,

    /// Prompt tokens ingested
    pub prompt_tokens_total: IntCounter,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Current active slots
    pub active_slots: IntGauge,

    /// Whole-run duration
    pub run_duration: Histogram,
}

/// Decoder interaction metrics
#[derive(Debug, Clone)]
pub struct DecodeMetrics {
    /// Decode calls issued
    pub decode_calls_total: IntCounter,

    /// Transient decode failures (chunk shrink events)
    pub cache_misses_total: IntCounter,

    /// Tokens per decode call
    pub batch_size: Histogram,

    /// Decode call duration
    pub decode_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let prompts_total = IntCounter::new(
            "batchloop_prompts_total",
            "Total number of prompts submitted"
        ).unwrap();

        let prompts_rejected = IntCounter::new(
            "batchloop_prompts_rejected_total",
            "Prompts rejected before a slot was assigned"
        ).unwrap();

        let prompts_failed = IntCounter::new(
            "batchloop_prompts_failed_total",
            "Prompts that failed after admission"
        ).unwrap();

        let prompts_completed = IntCounter::new(
            "batchloop_prompts_completed_total",
            "Prompts that finished generation"
        ).unwrap();

        let prompt_tokens_total = IntCounter::new(
            "batchloop_prompt_tokens_total",
            "Prompt tokens ingested"
        ).unwrap();

        let tokens_generated_total = IntCounter::new(
            "batchloop_tokens_generated_total",
            "Total number of tokens generated"
        ).unwrap();

        let active_slots = IntGauge::new(
            "batchloop_active_slots",
            "Slots currently bound to a prompt"
        ).unwrap();

        let run_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "batchloop_run_duration_seconds",
                "Parallel generation run duration in seconds"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
        ).unwrap();

        let decode_calls_total = IntCounter::new(
            "batchloop_decode_calls_total",
            "Decode calls issued to the engine"
        ).unwrap();

        let cache_misses_total = IntCounter::new(
            "batchloop_cache_misses_total",
            "Transient decode failures that shrank the chunk size"
        ).unwrap();

        let batch_size = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "batchloop_decode_batch_size",
                "Tokens per decode call"
            ).buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0])
        ).unwrap();

        let decode_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "batchloop_decode_duration_seconds",
                "Decode call duration in seconds"
            ).buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5])
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(prompts_total.clone())).unwrap();
        registry.register(Box::new(prompts_rejected.clone())).unwrap();
        registry.register(Box::new(prompts_failed.clone())).unwrap();
        registry.register(Box::new(prompts_completed.clone())).unwrap();
        registry.register(Box::new(prompt_tokens_total.clone())).unwrap();
        registry.register(Box::new(tokens_generated_total.clone())).unwrap();
        registry.register(Box::new(active_slots.clone())).unwrap();
        registry.register(Box::new(run_duration.clone())).unwrap();

        registry.register(Box::new(decode_calls_total.clone())).unwrap();
        registry.register(Box::new(cache_misses_total.clone())).unwrap();
        registry.register(Box::new(batch_size.clone())).unwrap();
        registry.register(Box::new(decode_duration.clone())).unwrap();

        let generation = GenerationMetrics {
            prompts_total,
            prompts_rejected,
            prompts_failed,
            prompts_completed,
            prompt_tokens_total,
            tokens_generated_total,
            active_slots,
            run_duration,
        };

        let decode = DecodeMetrics {
            decode_calls_total,
            cache_misses_total,
            batch_size,
            decode_duration,
        };

        MetricsRegistry {
            registry,
            generation,
            decode,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
