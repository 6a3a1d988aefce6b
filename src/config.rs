use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ai::{CausalLmConfig, GenerationConfig, ObjectiveConfig};
use crate::checkpoint::CheckpointManagerConfig;
use crate::data::VOCAB_SIZE;
use crate::error::ConfigError;
use crate::training::{PpoConfig, TrainerConfig};

/// Language model shape and pretrained weight locations.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub n_embd: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub d_ff: usize,
    pub max_seq_len: usize,
    /// Starting weights for the policy; random init when unset.
    pub policy_weights: Option<PathBuf>,
    /// Frozen reference model; a copy of the initial policy when unset.
    pub sft_weights: Option<PathBuf>,
    pub reward_weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            n_embd: 128,
            n_heads: 4,
            n_layers: 2,
            d_ff: 512,
            max_seq_len: 256,
            policy_weights: None,
            sft_weights: None,
            reward_weights: None,
        }
    }
}

impl ModelConfig {
    /// Architecture config shared by the policy, reference and reward models.
    pub fn lm_config(&self) -> CausalLmConfig {
        CausalLmConfig::new(VOCAB_SIZE)
            .with_n_embd(self.n_embd)
            .with_n_heads(self.n_heads)
            .with_n_layers(self.n_layers)
            .with_d_ff(self.d_ff)
            .with_max_seq_len(self.max_seq_len)
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub objective: ObjectiveConfig,
    pub ppo: PpoConfig,
    pub training: TrainerConfig,
    pub checkpoint: CheckpointManagerConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.model;
        if m.n_embd == 0 || m.n_heads == 0 || m.n_layers == 0 || m.d_ff == 0 {
            return Err(invalid("model dimensions must be > 0"));
        }
        if m.n_embd % m.n_heads != 0 {
            return Err(invalid("model.n_embd must be divisible by model.n_heads"));
        }

        let g = &self.generation;
        if g.max_new_tokens == 0 {
            return Err(invalid("generation.max_new_tokens must be > 0"));
        }
        if g.temperature < 0.0 {
            return Err(invalid("generation.temperature must be >= 0"));
        }
        let vocab = VOCAB_SIZE as i64;
        if !(0..vocab).contains(&g.pad_token_id) {
            return Err(invalid("generation.pad_token_id is outside the vocabulary"));
        }
        if g.eos_token_id.is_some_and(|eos| !(0..vocab).contains(&eos)) {
            return Err(invalid("generation.eos_token_id is outside the vocabulary"));
        }

        if self.objective.beta < 0.0 {
            return Err(invalid("objective.beta must be >= 0"));
        }
        if self.objective.gamma < 0.0 {
            return Err(invalid("objective.gamma must be >= 0"));
        }

        let p = &self.ppo;
        if p.learning_rate <= 0.0 {
            return Err(invalid("ppo.learning_rate must be > 0"));
        }
        if !(0.0..=1.0).contains(&p.discount) {
            return Err(invalid("ppo.discount must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&p.gae_lambda) {
            return Err(invalid("ppo.gae_lambda must be in [0, 1]"));
        }
        if p.clip_epsilon <= 0.0 {
            return Err(invalid("ppo.clip_epsilon must be > 0"));
        }
        if p.ppo_epochs == 0 {
            return Err(invalid("ppo.ppo_epochs must be > 0"));
        }
        if p.entropy_coeff < 0.0 {
            return Err(invalid("ppo.entropy_coeff must be >= 0"));
        }
        if p.value_coeff < 0.0 {
            return Err(invalid("ppo.value_coeff must be >= 0"));
        }
        if p.max_grad_norm <= 0.0 {
            return Err(invalid("ppo.max_grad_norm must be > 0"));
        }

        let t = &self.training;
        if t.num_epochs == 0 {
            return Err(invalid("training.num_epochs must be > 0"));
        }
        if t.batch_size == 0 {
            return Err(invalid("training.batch_size must be > 0"));
        }
        if t.max_prompt_len == 0 {
            return Err(invalid("training.max_prompt_len must be > 0"));
        }
        if t.log_interval == 0 {
            return Err(invalid("training.log_interval must be > 0"));
        }
        if t.max_prompt_len + g.max_new_tokens > m.max_seq_len {
            return Err(ConfigError::Validation(format!(
                "training.max_prompt_len + generation.max_new_tokens ({}) exceeds model.max_seq_len ({})",
                t.max_prompt_len + g.max_new_tokens,
                m.max_seq_len
            )));
        }

        if self.checkpoint.keep_last_n == 0 {
            return Err(invalid("checkpoint.keep_last_n must be >= 1"));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&AppConfig::default())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Validation(msg.into())
}
