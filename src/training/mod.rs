//! Training infrastructure: reward shaping and GAE, the PPO-driven
//! `LitAgent`, the epoch/batch trainer and rolling metrics.

pub mod advantage;
pub mod lit_agent;
pub mod metrics;
pub mod trainer;

pub use lit_agent::{LitAgent, PpoConfig, StepMetrics};
pub use metrics::TrainingMetrics;
pub use trainer::{Trainer, TrainerConfig};
