use serde::{Deserialize, Serialize};

use crate::ai::{GenerationConfig, ObjectiveConfig};
use crate::training::PpoConfig;

/// Metrics snapshot at checkpoint time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub mean_reward: f32,
    pub mean_kl: f32,
    pub objective: f32,
    pub current_loss: f32,
    pub training_steps: usize,
}

/// Hyperparameters recorded in checkpoint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHyperparameters {
    pub learning_rate: f64,
    pub discount: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    pub ppo_epochs: usize,
    pub beta: f32,
    pub gamma: f32,
    pub max_new_tokens: usize,
}

/// Top-level checkpoint metadata written to metadata.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: usize,
    pub timestamp: u64,
    pub algorithm: String,
    pub metrics: CheckpointMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<CheckpointHyperparameters>,
}

/// Training state written to training_state.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlhfTrainingState {
    pub step_count: usize,
    pub ppo: PpoConfig,
    pub objective: ObjectiveConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}
