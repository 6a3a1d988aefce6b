use burn::prelude::*;
use rand::Rng;

use crate::ai::agent::{prompt_log_likelihood, token_log_probs, Agent};
use crate::ai::generation::{generate, GenerationConfig, Rollout};
use crate::ai::networks::{CausalLm, RewardModel};
use crate::error::TrainingError;

/// Coefficients of the RLHF objective.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ObjectiveConfig {
    /// Weight of the coherence (input log-likelihood) term.
    pub gamma: f32,
    /// Weight of the log ratio against the SFT model.
    pub beta: f32,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        ObjectiveConfig {
            gamma: 0.01,
            beta: 0.02,
        }
    }
}

/// KL-regularised RLHF objective:
///
/// ```text
/// objective = mean(r(x, y) - beta * log(pi(y|x) / pi_sft(y|x))) + gamma * mean(log pi(x))
/// ```
///
/// `y` is a response sampled from the policy, `r` the reward model score and
/// the last term the log-likelihood (coherence) of the input text under the
/// policy.
pub struct AgentObjective<B: Backend> {
    pub model: Agent<B>,
    pub sft_model: CausalLm<B>,
    pub reward_model: RewardModel<B>,
    pub gamma: f32,
    pub beta: f32,
    pub generation: GenerationConfig,
}

/// Objective value and its parts for one batch.
#[derive(Debug, Clone)]
pub struct ObjectiveOutput<B: Backend> {
    /// [1]
    pub objective: Tensor<B, 1>,
    /// Reward model score per sequence: [batch]
    pub reward: Tensor<B, 1>,
    /// Summed per-token log ratio against the SFT model: [batch]
    pub kl: Tensor<B, 1>,
    /// [1]
    pub coherence: Tensor<B, 1>,
    /// SFT log-prob of each response token: [batch, response_len]
    pub sft_log_probs: Tensor<B, 2>,
}

impl<B: Backend> AgentObjective<B> {
    pub fn new(
        model: Agent<B>,
        sft_model: CausalLm<B>,
        reward_model: RewardModel<B>,
        gamma: f32,
        beta: f32,
    ) -> Self {
        AgentObjective {
            model,
            sft_model,
            reward_model,
            gamma,
            beta,
            generation: GenerationConfig::default(),
        }
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Generate responses to the prompts with the policy and score them.
    pub fn forward<R: Rng>(
        &self,
        input_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2>,
        rng: &mut R,
    ) -> Result<ObjectiveOutput<B>, TrainingError> {
        let rollout = generate(&self.model, input_ids, attention_mask, &self.generation, rng)?;
        Ok(self.score(&rollout))
    }

    /// Score an already generated rollout. Gradients flow through the policy
    /// terms only; SFT and reward outputs are detached.
    pub fn score(&self, rollout: &Rollout<B>) -> ObjectiveOutput<B> {
        let input_ids = rollout.input_ids.clone();
        let attention_mask = rollout.attention_mask.clone();
        let (prompt_len, response_len) = (rollout.prompt_len, rollout.response_len);
        let batch_size = rollout.batch_size();
        let device = input_ids.device();

        let policy_logits = self
            .model
            .policy_network()
            .forward(input_ids.clone(), attention_mask.clone())
            .logits;
        let policy_log_probs =
            token_log_probs(policy_logits.clone(), input_ids.clone(), prompt_len, response_len);

        let sft_log_probs = token_log_probs(
            self.sft_model
                .forward(input_ids.clone(), attention_mask.clone())
                .logits,
            input_ids.clone(),
            prompt_len,
            response_len,
        )
        .detach();

        let reward = self
            .reward_model
            .forward(input_ids.clone(), attention_mask.clone())
            .detach();

        let response_mask = rollout.response_mask_tensor::<B>(&device);
        let kl = ((policy_log_probs - sft_log_probs.clone()) * response_mask)
            .sum_dim(1)
            .reshape([batch_size]);

        let coherence = prompt_log_likelihood(policy_logits, input_ids, attention_mask, prompt_len);

        let objective = (reward.clone() - kl.clone().mul_scalar(self.beta)).mean()
            + coherence.clone().mul_scalar(self.gamma);

        ObjectiveOutput {
            objective,
            reward,
            kl,
            coherence,
            sft_log_probs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::networks::{CausalLmConfig, RewardModelConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::GradientsParams;
    use burn::tensor::TensorData;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn lm_config() -> CausalLmConfig {
        CausalLmConfig::new(24)
            .with_n_embd(16)
            .with_n_heads(2)
            .with_n_layers(1)
            .with_d_ff(32)
            .with_max_seq_len(16)
    }

    fn prompts() -> (Tensor<TestBackend, 2, Int>, Tensor<TestBackend, 2>) {
        let device = Default::default();
        let ids = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::from([0i64, 1, 2, 1, 3, 4].as_slice()),
            &device,
        )
        .reshape([2, 3]);
        let mask = Tensor::<TestBackend, 1>::from_data(
            TensorData::from([0.0f32, 1.0, 1.0, 1.0, 1.0, 1.0].as_slice()),
            &device,
        )
        .reshape([2, 3]);
        (ids, mask)
    }

    fn objective(gamma: f32, beta: f32, share_sft: bool) -> AgentObjective<TestBackend> {
        let device = Default::default();
        let agent = Agent::new(lm_config().init::<TestBackend>(&device), &device);
        let sft = if share_sft {
            agent.policy_network().clone()
        } else {
            lm_config().init::<TestBackend>(&device)
        };
        let reward = RewardModelConfig::new(lm_config()).init::<TestBackend>(&device);
        AgentObjective::new(agent, sft, reward, gamma, beta).with_generation(GenerationConfig {
            max_new_tokens: 3,
            eos_token_id: None,
            ..Default::default()
        })
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_objective_output_shapes() {
        let objective = objective(0.1, 0.02, false);
        let (ids, mask) = prompts();
        let mut rng = StdRng::seed_from_u64(1);

        let out = objective.forward(ids, mask, &mut rng).unwrap();
        assert_eq!(out.objective.dims(), [1]);
        assert_eq!(out.reward.dims(), [2]);
        assert_eq!(out.kl.dims(), [2]);
        assert_eq!(out.coherence.dims(), [1]);
        assert_eq!(out.sft_log_probs.dims(), [2, 3]);
    }

    #[test]
    fn test_kl_vanishes_against_identical_reference() {
        let objective = objective(0.0, 1.0, true);
        let (ids, mask) = prompts();
        let mut rng = StdRng::seed_from_u64(2);

        let out = objective.forward(ids, mask, &mut rng).unwrap();
        let kl: Vec<f32> = out.kl.into_data().to_vec().unwrap();
        assert!(kl.iter().all(|k| k.abs() < 1e-4), "kl = {kl:?}");
    }

    #[test]
    fn test_objective_combines_reward_kl_and_coherence() {
        let (gamma, beta) = (0.5, 0.1);
        let objective = objective(gamma, beta, false);
        let (ids, mask) = prompts();
        let mut rng = StdRng::seed_from_u64(3);

        let out = objective.forward(ids, mask, &mut rng).unwrap();
        let reward: Vec<f32> = out.reward.into_data().to_vec().unwrap();
        let kl: Vec<f32> = out.kl.into_data().to_vec().unwrap();
        let coherence = scalar(out.coherence);

        let expected = (reward[0] - beta * kl[0] + reward[1] - beta * kl[1]) / 2.0 + gamma * coherence;
        assert!((scalar(out.objective) - expected).abs() < 1e-4);
        assert!(coherence <= 0.0);
    }

    #[test]
    fn test_gradients_reach_only_the_policy() {
        type AdBackend = Autodiff<NdArray<f32>>;
        let device = Default::default();
        let agent = Agent::new(lm_config().init::<AdBackend>(&device), &device);
        let sft = lm_config().init::<AdBackend>(&device);
        let reward = RewardModelConfig::new(lm_config()).init::<AdBackend>(&device);
        let objective = AgentObjective::new(agent, sft, reward, 0.5, 0.1).with_generation(
            GenerationConfig {
                max_new_tokens: 3,
                eos_token_id: None,
                ..Default::default()
            },
        );

        let (ids, mask) = prompts();
        let ids = Tensor::<AdBackend, 2, Int>::from_data(ids.into_data(), &device);
        let mask = Tensor::<AdBackend, 2>::from_data(mask.into_data(), &device);
        let mut rng = StdRng::seed_from_u64(4);
        let rollout = generate(&objective.model, ids, mask, &objective.generation, &mut rng).unwrap();

        let grads = objective.score(&rollout).objective.backward();
        let policy_grads = GradientsParams::from_grads(grads, &objective.model);
        assert!(policy_grads.len() > 0);

        let grads = objective.score(&rollout).objective.backward();
        assert_eq!(GradientsParams::from_grads(grads, &objective.reward_model).len(), 0);

        let grads = objective.score(&rollout).kl.sum().backward();
        assert_eq!(GradientsParams::from_grads(grads, &objective.sft_model).len(), 0);
    }
}
