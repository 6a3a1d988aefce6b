use std::time::Instant;

use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointManagerConfig, CheckpointMetrics};
use crate::data::PromptDataset;
use crate::error::TrainingError;
use crate::training::lit_agent::LitAgent;
use crate::training::metrics::TrainingMetrics;

/// Trainer configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub max_prompt_len: usize,
    pub log_interval: usize,
    pub checkpoint_interval: usize,
    /// Seeds prompt shuffling and sampling; OS entropy when unset.
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            num_epochs: 1,
            batch_size: 8,
            max_prompt_len: 64,
            log_interval: 10,
            checkpoint_interval: 100,
            seed: None,
        }
    }
}

/// Runs RLHF training over a prompt dataset.
pub struct Trainer {
    config: TrainerConfig,
    checkpoint_manager: CheckpointManager,
}

impl Trainer {
    pub fn new(config: TrainerConfig, checkpoint: CheckpointManagerConfig) -> Self {
        Trainer {
            config,
            checkpoint_manager: CheckpointManager::new(checkpoint),
        }
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    /// Run `num_epochs` passes over shuffled prompt batches.
    pub fn train<B: AutodiffBackend>(
        &self,
        lit_agent: &mut LitAgent<B>,
        dataset: &PromptDataset,
    ) -> Result<TrainingMetrics, TrainingError> {
        let mut metrics = TrainingMetrics::new();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let window = self.config.log_interval.max(1);
        let mut last_checkpoint = None;

        info!(
            prompts = dataset.len(),
            epochs = self.config.num_epochs,
            batch_size = self.config.batch_size,
            start_step = lit_agent.step_count(),
            checkpoint_dir = %self.checkpoint_manager.checkpoint_dir().display(),
            "starting RLHF training"
        );

        for epoch in 1..=self.config.num_epochs {
            let batches = dataset.batches(self.config.batch_size, Some(&mut rng))?;

            for (batch_idx, batch) in batches.iter().enumerate() {
                let step_metrics = lit_agent.training_step(batch, batch_idx)?;
                metrics.record_step(step_metrics);
                let step = lit_agent.step_count();

                if step % window == 0 {
                    info!(
                        epoch,
                        step,
                        reward = metrics.average_reward(window),
                        kl = metrics.average_kl(window),
                        objective = metrics.average_objective(window),
                        loss = metrics.average_loss(window),
                        response_len = metrics.average_response_len(window),
                        entropy = metrics.average_rollout_entropy(window),
                        steps_per_sec = metrics.steps_per_sec(),
                        "training progress"
                    );
                    metrics.reset_window();
                }

                if self.config.checkpoint_interval > 0 && step % self.config.checkpoint_interval == 0 {
                    let started = Instant::now();
                    self.checkpoint(lit_agent, &metrics, step);
                    metrics.record_overhead(started.elapsed());
                    last_checkpoint = Some(step);
                }
            }
        }

        let final_step = lit_agent.step_count();
        if metrics.total_steps() > 0 && last_checkpoint != Some(final_step) {
            self.checkpoint(lit_agent, &metrics, final_step);
        }

        info!(
            total_steps = metrics.total_steps(),
            reward = metrics.average_reward(window),
            kl = metrics.average_kl(window),
            "training complete"
        );
        Ok(metrics)
    }

    /// Save a checkpoint; failures are logged and training continues.
    fn checkpoint<B: AutodiffBackend>(
        &self,
        lit_agent: &LitAgent<B>,
        metrics: &TrainingMetrics,
        step: usize,
    ) {
        let window = self.config.log_interval.max(1);
        let ckpt_metrics = CheckpointMetrics {
            mean_reward: metrics.average_reward(window),
            mean_kl: metrics.average_kl(window),
            objective: metrics.average_objective(window),
            current_loss: metrics.average_loss(window),
            training_steps: step,
        };
        match self
            .checkpoint_manager
            .save_checkpoint(lit_agent, &ckpt_metrics, step)
        {
            Ok(path) => info!(path = %path.display(), step, "checkpoint saved"),
            Err(e) => warn!(error = %e, step, "checkpoint failed"),
        }
    }
}
