//! Results of a parallel generation run

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Prefix of the response string of a failed prompt
pub const ERROR_PREFIX: &str = "[ERROR] ";

/// Why a prompt stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    EndOfGeneration,
    /// `max_tokens` reached
    MaxTokens,
    /// A conversational stop sequence appeared in the response
    StopSequence,
    /// The slot ran out of context positions
    ContextFull,
    /// Rejected at admission or failed while generating
    Failed(String),
}

impl FinishReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, FinishReason::Failed(_))
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::EndOfGeneration => write!(f, "end of generation"),
            FinishReason::MaxTokens => write!(f, "max tokens"),
            FinishReason::StopSequence => write!(f, "stop sequence"),
            FinishReason::ContextFull => write!(f, "context full"),
            FinishReason::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Result for one prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    /// Cleaned response text, empty for failures
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub finish_reason: FinishReason,
}

impl Completion {
    pub(crate) fn failed(prompt_tokens: usize, message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            prompt_tokens,
            generated_tokens: 0,
            finish_reason: FinishReason::Failed(message.into()),
        }
    }

    /// The response string: the text, or `"[ERROR] <diagnostic>"` on failure
    pub fn response(&self) -> String {
        match &self.finish_reason {
            FinishReason::Failed(msg) => format!("{}{}", ERROR_PREFIX, msg),
            _ => self.text.clone(),
        }
    }
}

/// Counters collected over one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    /// Prompt tokens ingested, shared prefix counted once
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    /// Transient decode failures absorbed by shrinking the chunk size
    pub cache_misses: u64,
    pub decode_calls: u64,
    pub shared_prefix_len: usize,
    pub peak_active_slots: usize,
    pub elapsed: Duration,
}

impl GenerationStats {
    /// Generated tokens per second over the whole run
    pub fn generation_throughput(&self) -> f64 {
        per_second(self.generated_tokens, self.elapsed)
    }

    /// Prompt tokens per second over the whole run
    pub fn prompt_throughput(&self) -> f64 {
        per_second(self.prompt_tokens, self.elapsed)
    }
}

fn per_second(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Output of `ParallelGenerator::generate_parallel`, aligned with the input prompts
#[derive(Debug, Clone, Serialize)]
pub struct ParallelOutput {
    pub completions: Vec<Completion>,
    pub stats: GenerationStats,
}

impl ParallelOutput {
    /// One response string per prompt
    pub fn responses(&self) -> Vec<String> {
        self.completions.iter().map(Completion::response).collect()
    }

    pub fn failed(&self) -> usize {
        self.completions
            .iter()
            .filter(|c| c.finish_reason.is_failure())
            .count()
    }
}

/// Progress update sent as prompts finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_response_is_prefixed() {
        let completion = Completion::failed(0, "Prompt too long");
        assert_eq!(completion.response(), "[ERROR] Prompt too long");
        assert!(completion.text.is_empty());
    }

    #[test]
    fn test_responses_align() {
        let output = ParallelOutput {
            completions: vec![
                Completion {
                    text: "hi".to_string(),
                    prompt_tokens: 3,
                    generated_tokens: 2,
                    finish_reason: FinishReason::MaxTokens,
                },
                Completion::failed(0, "boom"),
            ],
            stats: GenerationStats::default(),
        };
        assert_eq!(output.responses(), vec!["hi".to_string(), "[ERROR] boom".to_string()]);
        assert_eq!(output.failed(), 1);
    }

    #[test]
    fn test_throughput() {
        let stats = GenerationStats {
            generated_tokens: 100,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(stats.generation_throughput(), 50.0);
        assert_eq!(GenerationStats::default().prompt_throughput(), 0.0);
    }
}
