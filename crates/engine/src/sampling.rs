//! Reference token sampler
//!
//! Repeat penalty, then top-k, temperature and top-p over a seeded RNG. One
//! instance per slot; instances never share state.

use crate::backend::{Sampler, SamplerFactory, SamplingError, TokenId};
use batchloop_common::GenerationParams;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Token sampler with configurable parameters
#[derive(Debug, Clone)]
pub struct LogitsSampler {
    rng: StdRng,
    top_k: usize,
    top_p: f32,
    temperature: f32,
    penalty_window: usize,
    penalty: f32,
    history: VecDeque<TokenId>,
}

impl LogitsSampler {
    pub fn new(params: &GenerationParams, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            top_k: params.top_k.max(0) as usize,
            top_p: params.top_p,
            temperature: params.temperature,
            penalty_window: params.repeat_penalty_window,
            penalty: params.repeat_penalty_strength,
            history: VecDeque::with_capacity(params.repeat_penalty_window),
        }
    }

    fn apply_repeat_penalty(&self, logits: &mut [f32]) {
        if self.penalty == 1.0 {
            return;
        }
        let mut seen = self.history.iter().copied().collect::<Vec<_>>();
        seen.sort_unstable();
        seen.dedup();
        for token in seen {
            if let Some(logit) = logits.get_mut(token as usize) {
                if *logit > 0.0 {
                    *logit /= self.penalty;
                } else {
                    *logit *= self.penalty;
                }
            }
        }
    }

    fn pick(&mut self, candidates: &[(usize, f32)]) -> usize {
        // candidates sorted by descending logit, non-empty
        let max = candidates[0].1;
        let mut probs: Vec<(usize, f32)> = candidates
            .iter()
            .map(|&(idx, logit)| (idx, ((logit - max) / self.temperature).exp()))
            .collect();
        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        for (_, p) in probs.iter_mut() {
            *p /= sum;
        }

        if self.top_p < 1.0 {
            let mut cumsum = 0.0;
            let mut cutoff = probs.len();
            for (i, (_, p)) in probs.iter().enumerate() {
                cumsum += p;
                if cumsum >= self.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            probs.truncate(cutoff.max(1));
        }

        let total: f32 = probs.iter().map(|(_, p)| p).sum();
        let r: f32 = self.rng.gen::<f32>() * total;
        let mut cumsum = 0.0;
        for &(idx, p) in &probs {
            cumsum += p;
            if cumsum >= r {
                return idx;
            }
        }
        probs[probs.len() - 1].0
    }
}

impl Sampler for LogitsSampler {
    fn sample(&mut self, logits: &[f32]) -> Result<TokenId, SamplingError> {
        if logits.is_empty() {
            return Err(SamplingError("empty logits".to_string()));
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError("logits contain NaN".to_string()));
        }

        let mut logits = logits.to_vec();
        self.apply_repeat_penalty(&mut logits);

        let mut candidates: Vec<(usize, f32)> = logits.into_iter().enumerate().collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        // Greedy
        if self.temperature <= 0.0 {
            return Ok(candidates[0].0 as TokenId);
        }

        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        Ok(self.pick(&candidates) as TokenId)
    }

    fn accept(&mut self, token: TokenId) {
        if self.penalty_window == 0 {
            return;
        }
        if self.history.len() == self.penalty_window {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }
}

/// Builds a `LogitsSampler` per slot
#[derive(Debug, Clone, Copy, Default)]
pub struct LogitsSamplerFactory;

impl SamplerFactory for LogitsSamplerFactory {
    type Sampler = LogitsSampler;

    fn new_sampler(&self, params: &GenerationParams, seed: u64) -> Result<LogitsSampler, SamplingError> {
        if !params.temperature.is_finite() || params.temperature < 0.0 {
            return Err(SamplingError(format!("invalid temperature {}", params.temperature)));
        }
        if !(0.0..=1.0).contains(&params.top_p) {
            return Err(SamplingError(format!("invalid top_p {}", params.top_p)));
        }
        Ok(LogitsSampler::new(params, seed))
    }
}
