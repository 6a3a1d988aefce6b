mod causal_lm;
mod reward_model;
mod value_network;

pub use causal_lm::{position_ids, CausalLm, CausalLmConfig, LmOutput};
pub use reward_model::{RewardModel, RewardModelConfig};
pub use value_network::{ValueNetwork, ValueNetworkConfig};
