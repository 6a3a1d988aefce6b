mod agent;
pub mod generation;
mod loss;
pub mod networks;
mod objective;

pub use agent::{
    masked_mean, prompt_log_likelihood, token_log_probs, ActionEvaluation, Agent, AgentOutput,
};
pub use generation::{generate, GenerationConfig, Rollout};
pub use loss::{AgentLoss, LossInput, LossOutput};
pub use networks::{CausalLm, CausalLmConfig, RewardModel, RewardModelConfig, ValueNetwork};
pub use objective::{AgentObjective, ObjectiveConfig, ObjectiveOutput};
