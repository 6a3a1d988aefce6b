use std::path::Path;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::DefaultRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::ai::networks::{CausalLm, RewardModel};
use crate::ai::{
    generate, Agent, AgentLoss, AgentObjective, GenerationConfig, LossInput, ObjectiveConfig,
};
use crate::checkpoint::{
    CheckpointHyperparameters, CheckpointMetadata, CheckpointMetrics, Checkpointable,
    RlhfTrainingState,
};
use crate::data::PromptBatch;
use crate::error::{tensor_data_error, CheckpointError, TrainingError};
use crate::training::advantage::{compute_gae, shaped_rewards};

const WEIGHTS_FILE: &str = "agent";

/// PPO hyperparameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub learning_rate: f64,
    /// Per-token discount used by GAE.
    pub discount: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    pub entropy_coeff: f32,
    pub value_coeff: f32,
    pub ppo_epochs: usize,
    /// L2 norm cap applied to each parameter's gradient tensor separately.
    pub max_grad_norm: f32,
}

impl Default for PpoConfig {
    fn default() -> Self {
        PpoConfig {
            learning_rate: 1e-5,
            discount: 1.0,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            entropy_coeff: 0.0,
            value_coeff: 0.5,
            ppo_epochs: 4,
            max_grad_norm: 1.0,
        }
    }
}

/// Scalars reported by one training step.
#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    pub loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub approx_kl: f32,
    pub clip_fraction: f32,
    pub mean_reward: f32,
    pub mean_kl: f32,
    pub objective: f32,
    pub coherence: f32,
    pub response_len: f32,
    /// Policy entropy over generated tokens during the rollout.
    pub rollout_entropy: f32,
}

/// Trains an [`Agent`] against the RLHF objective with PPO.
///
/// Rollouts and scoring run on the inner (non-autodiff) backend through
/// [`AgentObjective`], whose policy snapshot is refreshed before every step.
pub struct LitAgent<B: AutodiffBackend> {
    agent: Agent<B>,
    objective: AgentObjective<B::InnerBackend>,
    optimizer: OptimizerAdaptor<Adam, Agent<B>, B>,
    config: PpoConfig,
    device: B::Device,
    step_count: usize,
    rng: StdRng,
}

impl<B: AutodiffBackend> LitAgent<B> {
    pub fn new(
        agent: Agent<B>,
        sft_model: CausalLm<B::InnerBackend>,
        reward_model: RewardModel<B::InnerBackend>,
        config: PpoConfig,
        device: B::Device,
    ) -> Self {
        let objective_config = ObjectiveConfig::default();
        let objective = AgentObjective::new(
            agent.valid(),
            sft_model,
            reward_model,
            objective_config.gamma,
            objective_config.beta,
        );
        let optimizer = build_optimizer(&config);

        LitAgent {
            agent,
            objective,
            optimizer,
            config,
            device,
            step_count: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_objective(mut self, objective: ObjectiveConfig) -> Self {
        self.objective.gamma = objective.gamma;
        self.objective.beta = objective.beta;
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.objective.generation = generation;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    /// Override the learning rate, e.g. after restoring a checkpoint.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.config.learning_rate = learning_rate;
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.objective.generation
    }

    /// Detached copy of the current agent.
    pub fn inference_agent(&self) -> Agent<B::InnerBackend> {
        self.agent.valid()
    }

    /// One RLHF step on a batch of prompts: generate, score, then run
    /// `ppo_epochs` optimisation epochs on the rollout.
    pub fn training_step(
        &mut self,
        batch: &PromptBatch,
        batch_idx: usize,
    ) -> Result<StepMetrics, TrainingError> {
        if batch.batch_size == 0 {
            return Err(TrainingError::EmptyBatch);
        }
        self.objective.model = self.agent.valid();

        let (ids, mask) = batch.to_tensors::<B::InnerBackend>(&self.device);
        let rollout = generate(
            &self.objective.model,
            ids,
            mask,
            &self.objective.generation,
            &mut self.rng,
        )?;
        let scored = self.objective.score(&rollout);

        let (batch_size, prompt_len, response_len) =
            (rollout.batch_size(), rollout.prompt_len, rollout.response_len);

        let scores: Vec<f32> = scored.reward.clone().into_data().to_vec().map_err(tensor_data_error)?;
        let sft_log_probs: Vec<f32> = scored
            .sft_log_probs
            .into_data()
            .to_vec()
            .map_err(tensor_data_error)?;
        let rewards = shaped_rewards(
            &scores,
            &rollout.log_probs,
            &sft_log_probs,
            &rollout.response_mask,
            response_len,
            self.objective.beta,
        );
        let (advantages, returns) = compute_gae(
            &rewards,
            &rollout.values,
            &rollout.response_mask,
            response_len,
            self.config.discount,
            self.config.gae_lambda,
        );

        // Move the rollout onto the autodiff backend; these are constants.
        let input_ids =
            Tensor::<B, 2, Int>::from_data(rollout.input_ids.clone().into_data(), &self.device);
        let attention_mask =
            Tensor::<B, 2>::from_data(rollout.attention_mask.clone().into_data(), &self.device);
        let per_token = |values: &[f32]| {
            Tensor::<B, 1>::from_data(TensorData::from(values), &self.device)
                .reshape([batch_size, response_len])
        };
        let old_log_probs = per_token(&rollout.log_probs);
        let advantages = per_token(&advantages);
        let returns = per_token(&returns);
        let response_mask = per_token(&rollout.response_mask);

        let loss_func = AgentLoss {
            clip_epsilon: self.config.clip_epsilon,
            value_coeff: self.config.value_coeff,
            entropy_coeff: self.config.entropy_coeff,
            ptx_coeff: self.objective.gamma,
        };

        let mut metrics = StepMetrics {
            mean_reward: mean(&scores),
            mean_kl: scalar(scored.kl.mean())?,
            objective: scalar(scored.objective)?,
            coherence: scalar(scored.coherence)?,
            response_len: rollout.mean_response_length(),
            rollout_entropy: rollout.mean_entropy(),
            ..Default::default()
        };

        for _epoch in 0..self.config.ppo_epochs {
            let evaluation = self.agent.evaluate_actions(
                input_ids.clone(),
                attention_mask.clone(),
                prompt_len,
                response_len,
            );
            let output = loss_func.forward(LossInput {
                log_probs: evaluation.log_probs,
                old_log_probs: old_log_probs.clone(),
                advantages: advantages.clone(),
                returns: returns.clone(),
                values: evaluation.values,
                entropy: evaluation.entropy,
                response_mask: response_mask.clone(),
                prompt_log_likelihood: evaluation.prompt_log_likelihood,
            });

            metrics.loss = scalar(output.loss.clone())?;
            metrics.policy_loss = scalar(output.policy_loss)?;
            metrics.value_loss = scalar(output.value_loss)?;
            metrics.entropy = scalar(output.entropy)?;
            metrics.approx_kl = scalar(output.approx_kl)?;
            metrics.clip_fraction = scalar(output.clip_fraction)?;

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.agent);
            self.agent = self
                .optimizer
                .step(self.config.learning_rate, self.agent.clone(), grads);
        }

        self.step_count += 1;
        debug!(
            step = self.step_count,
            batch_idx,
            loss = metrics.loss,
            reward = metrics.mean_reward,
            kl = metrics.mean_kl,
            approx_kl = metrics.approx_kl,
            response_len = metrics.response_len,
            rollout_entropy = metrics.rollout_entropy,
            "ppo step"
        );

        Ok(metrics)
    }

    /// Load agent weights written by [`Checkpointable::save_weights_to_dir`].
    pub fn load_weights_from_dir(&mut self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        self.agent = self
            .agent
            .clone()
            .load_file(dir.join(WEIGHTS_FILE), &recorder, &self.device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;
        self.objective.model = self.agent.valid();
        Ok(())
    }

    /// Export current training state for checkpointing.
    pub fn training_state(&self) -> RlhfTrainingState {
        RlhfTrainingState {
            step_count: self.step_count,
            ppo: self.config.clone(),
            objective: ObjectiveConfig {
                gamma: self.objective.gamma,
                beta: self.objective.beta,
            },
            generation: self.objective.generation.clone(),
        }
    }

    /// Restore training state from a checkpoint. The optimizer is rebuilt
    /// since its moments are not persisted.
    pub fn restore_training_state(&mut self, state: &RlhfTrainingState) {
        self.step_count = state.step_count;
        self.config = state.ppo.clone();
        self.objective.gamma = state.objective.gamma;
        self.objective.beta = state.objective.beta;
        self.objective.generation = state.generation.clone();
        self.optimizer = build_optimizer(&self.config);
    }

    pub fn restore_training_state_json(&mut self, json: &str) -> Result<(), CheckpointError> {
        let state: RlhfTrainingState = serde_json::from_str(json)?;
        self.restore_training_state(&state);
        Ok(())
    }
}

impl<B: AutodiffBackend> Checkpointable for LitAgent<B> {
    fn save_weights_to_dir(&self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        self.agent
            .clone()
            .valid()
            .save_file(dir.join(WEIGHTS_FILE), &recorder)
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))
    }

    fn training_state_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string_pretty(&self.training_state())?)
    }

    fn build_checkpoint_metadata(
        &self,
        metrics: &CheckpointMetrics,
        step: usize,
        timestamp: u64,
    ) -> CheckpointMetadata {
        CheckpointMetadata {
            step,
            timestamp,
            algorithm: "PPO-RLHF".to_string(),
            metrics: metrics.clone(),
            hyperparameters: Some(CheckpointHyperparameters {
                learning_rate: self.config.learning_rate,
                discount: self.config.discount,
                gae_lambda: self.config.gae_lambda,
                clip_epsilon: self.config.clip_epsilon,
                ppo_epochs: self.config.ppo_epochs,
                beta: self.objective.beta,
                gamma: self.objective.gamma,
                max_new_tokens: self.objective.generation.max_new_tokens,
            }),
        }
    }
}

fn build_optimizer<B: AutodiffBackend>(
    config: &PpoConfig,
) -> OptimizerAdaptor<Adam, Agent<B>, B> {
    AdamConfig::new()
        .with_grad_clipping(Some(gradient_clipping(config)))
        .init()
}

/// Per-parameter norm clipping: every gradient tensor is rescaled on its own.
fn gradient_clipping(config: &PpoConfig) -> GradientClippingConfig {
    GradientClippingConfig::Norm(config.max_grad_norm)
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> Result<f32, TrainingError> {
    let values: Vec<f32> = t.into_data().to_vec().map_err(tensor_data_error)?;
    Ok(values.first().copied().unwrap_or(0.0))
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}
