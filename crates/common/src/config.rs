//! Configuration structures for BatchLoop
//!
//! This module defines the sampling, scheduling and cleaning parameters of a
//! parallel generation run. Configurations are loaded from YAML (or JSON) files
//! and can be overridden by environment variables.

use crate::error::{BatchLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Top-level configuration for BatchLoop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchLoopConfig {
    /// Per-run sampling and stopping parameters
    #[serde(default)]
    pub generation: GenerationParams,

    /// Slot pool and batching configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Response post-processing
    #[serde(default)]
    pub cleaner: CleanerConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Sampling and stopping parameters shared by every prompt of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    /// Maximum generated tokens per prompt (0 = bounded only by natural stop)
    #[serde(default)]
    pub max_tokens: u32,

    /// Top-k cutoff (<= 0 disables)
    #[serde(default = "default_top_k")]
    pub top_k: i32,

    /// Nucleus probability mass in [0, 1]
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Softmax temperature (0 = greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Number of recent tokens the repeat penalty looks at
    #[serde(default = "default_repeat_penalty_window")]
    pub repeat_penalty_window: usize,

    /// Repeat penalty strength (1.0 = off)
    #[serde(default = "default_repeat_penalty_strength")]
    pub repeat_penalty_strength: f32,

    /// RNG seed; negative derives one from the wall clock
    #[serde(default = "default_seed")]
    pub seed: i64,

    /// Emit progress updates as prompts complete
    #[serde(default)]
    pub show_progress: bool,

    /// Conversational turn markers that end generation
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,
}

/// Slot pool and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Ceiling on tokens per decode call (further capped by the engine)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Context positions kept free for generation when admitting a prompt
    #[serde(default = "default_reserved_context")]
    pub reserved_context: usize,

    /// Maximum concurrent slots (0 = engine sequence capacity)
    #[serde(default)]
    pub max_slots: usize,

    /// Decode the common prompt prefix once and copy it into every slot
    #[serde(default = "default_share_prefix")]
    pub share_prefix: bool,

    /// Tokens a slot must generate before stop sequences are checked
    #[serde(default = "default_stop_check_min_tokens")]
    pub stop_check_min_tokens: u32,
}

/// Response cleaner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanerConfig {
    /// Literal chat-template markers removed from every response
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Enable structured logging
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,
}

/// Default value functions
fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_temperature() -> f32 {
    0.8
}

fn default_repeat_penalty_window() -> usize {
    64
}

fn default_repeat_penalty_strength() -> f32 {
    1.1
}

fn default_seed() -> i64 {
    -1
}

fn default_stop_sequences() -> Vec<String> {
    vec!["\n\nUser:".to_string(), "\n\nHuman:".to_string()]
}

fn default_max_batch_size() -> usize {
    512
}

fn default_reserved_context() -> usize {
    64
}

fn default_share_prefix() -> bool {
    true
}

fn default_stop_check_min_tokens() -> u32 {
    6
}

fn default_markers() -> Vec<String> {
    [
        "<|im_end|>",
        "<|im_start|>",
        "<end_of_turn>",
        "<start_of_turn>",
        "</s>",
        "<s>",
        "<|endoftext|>",
        "<|end|>",
        "<|start|>",
        "<eos>",
        "<bos>",
        "<|eot_id|>",
        "<|start_header_id|>",
        "<|end_header_id|>",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

fn default_structured_logging() -> bool {
    false
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            repeat_penalty_window: default_repeat_penalty_window(),
            repeat_penalty_strength: default_repeat_penalty_strength(),
            seed: default_seed(),
            show_progress: false,
            stop_sequences: default_stop_sequences(),
        }
    }
}

impl GenerationParams {
    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(BatchLoopError::config(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(BatchLoopError::config(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !self.repeat_penalty_strength.is_finite() || self.repeat_penalty_strength <= 0.0 {
            return Err(BatchLoopError::config(format!(
                "repeat_penalty_strength must be > 0, got {}",
                self.repeat_penalty_strength
            )));
        }
        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(BatchLoopError::config("stop sequences must not be empty"));
        }
        Ok(())
    }

    /// Seed for this run: the configured one, or wall-clock seconds when negative
    pub fn resolve_seed(&self) -> u64 {
        if self.seed >= 0 {
            return self.seed as u64;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            reserved_context: default_reserved_context(),
            max_slots: 0,
            share_prefix: default_share_prefix(),
            stop_check_min_tokens: default_stop_check_min_tokens(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler limits
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(BatchLoopError::config("max_batch_size must be > 0"));
        }
        Ok(())
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: default_structured_logging(),
        }
    }
}

impl BatchLoopConfig {
    /// Load configuration from a YAML or JSON file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BatchLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: BatchLoopConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content).map_err(|e| {
                BatchLoopError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            })?
        };

        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `BATCHLOOP_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(seed) = std::env::var("BATCHLOOP_SEED") {
            self.generation.seed = seed
                .parse()
                .map_err(|_| BatchLoopError::config(format!("Invalid BATCHLOOP_SEED: {}", seed)))?;
        }
        if let Ok(max_tokens) = std::env::var("BATCHLOOP_MAX_TOKENS") {
            self.generation.max_tokens = max_tokens.parse().map_err(|_| {
                BatchLoopError::config(format!("Invalid BATCHLOOP_MAX_TOKENS: {}", max_tokens))
            })?;
        }
        if let Ok(level) = std::env::var("BATCHLOOP_LOG_LEVEL") {
            self.observability
                .get_or_insert_with(ObservabilityConfig::default)
                .log_level = level;
        }
        self.validate()?;
        Ok(self)
    }

    /// Whether Prometheus metrics are recorded; on unless disabled explicitly
    pub fn metrics_enabled(&self) -> bool {
        self.observability
            .as_ref()
            .map_or(true, |o| o.enable_metrics)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.generation.validate()?;
        self.scheduler.validate()?;
        if self.cleaner.markers.iter().any(|m| m.is_empty()) {
            return Err(BatchLoopError::config("cleaner markers must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BatchLoopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_batch_size, 512);
        assert_eq!(config.scheduler.reserved_context, 64);
        assert_eq!(config.generation.seed, -1);
    }

    #[test]
    fn test_config_validation_rejects_bad_top_p() {
        let mut config = BatchLoopConfig::default();
        config.generation.top_p = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_zero_batch() {
        let mut config = BatchLoopConfig::default();
        config.scheduler.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_switch() {
        let mut config = BatchLoopConfig::default();
        assert!(config.metrics_enabled());

        config.observability = Some(ObservabilityConfig {
            enable_metrics: false,
            ..Default::default()
        });
        assert!(!config.metrics_enabled());
    }

    #[test]
    fn test_resolve_seed() {
        let params = GenerationParams {
            seed: 1234,
            ..Default::default()
        };
        assert_eq!(params.resolve_seed(), 1234);

        let params = GenerationParams::default();
        assert!(params.resolve_seed() > 0);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "generation:\n  max_tokens: 32\n  seed: 7\n  temperature: 0.0\nscheduler:\n  max_slots: 4\n"
        )
        .unwrap();

        let config = BatchLoopConfig::from_file(file.path()).unwrap();
        assert_eq!(config.generation.max_tokens, 32);
        assert_eq!(config.generation.seed, 7);
        assert_eq!(config.generation.top_k, 40);
        assert_eq!(config.scheduler.max_slots, 4);
        assert!(config.scheduler.share_prefix);
        assert_eq!(config.generation.stop_sequences.len(), 2);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"generation": {{"top_p": 0.5}}, "cleaner": {{"markers": ["<eos>"]}}}}"#).unwrap();

        let config = BatchLoopConfig::from_file(file.path()).unwrap();
        assert_eq!(config.generation.top_p, 0.5);
        assert_eq!(config.cleaner.markers, vec!["<eos>".to_string()]);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "generation:\n  temperature: -1.0\n").unwrap();

        assert!(BatchLoopConfig::from_file(file.path()).is_err());
    }
}
