#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use instruct_goose::ai::networks::RewardModelConfig;
use instruct_goose::ai::{generate, Agent, GenerationConfig};
use instruct_goose::checkpoint::CheckpointManager;
use instruct_goose::config::AppConfig;
use instruct_goose::data::{ByteTokenizer, PromptBatch, PromptDataset};
use instruct_goose::training::{LitAgent, Trainer};

/// Fine-tune a causal language model against a reward model with PPO.
#[derive(Parser)]
#[command(name = "train", about = "RLHF training with PPO")]
struct Cli {
    /// JSONL file with one {"prompt": "..."} object per line
    #[arg(long)]
    prompts: PathBuf,

    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Resume training from the latest checkpoint. PPO, objective and
    /// generation settings are taken from the checkpoint; `--lr` still applies.
    #[arg(long)]
    resume: bool,

    /// Override number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Seed for shuffling and sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Train on the CPU (NdArray) instead of the GPU (Wgpu)
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    if let Some(epochs) = cli.epochs {
        app_config.training.num_epochs = epochs;
    }
    if let Some(lr) = cli.lr {
        app_config.ppo.learning_rate = lr;
    }
    if cli.seed.is_some() {
        app_config.training.seed = cli.seed;
    }
    app_config.validate().context("invalid configuration")?;

    if cli.cpu {
        run::<Autodiff<NdArray<f32>>>(&cli, &app_config)
    } else {
        run::<Autodiff<Wgpu<f32, i32>>>(&cli, &app_config)
    }
}

fn run<B: AutodiffBackend>(cli: &Cli, config: &AppConfig) -> Result<()> {
    let device = B::Device::default();
    let tokenizer = ByteTokenizer::new();
    let lm_config = config.model.lm_config();

    let mut policy = lm_config.init::<B>(&device);
    if let Some(path) = &config.model.policy_weights {
        policy = policy
            .load_pretrained(path, &device)
            .map_err(|e| anyhow::anyhow!("loading policy weights from {}: {e}", path.display()))?;
        info!(path = %path.display(), "loaded policy weights");
    }
    let agent = Agent::new(policy, &device);

    let sft_model = match &config.model.sft_weights {
        Some(path) => lm_config
            .init::<B::InnerBackend>(&device)
            .load_pretrained(path, &device)
            .map_err(|e| anyhow::anyhow!("loading SFT weights from {}: {e}", path.display()))?,
        None => agent.policy_network().valid(),
    };

    let mut reward_model = RewardModelConfig::new(lm_config.clone()).init::<B::InnerBackend>(&device);
    match &config.model.reward_weights {
        Some(path) => {
            reward_model = reward_model.load_pretrained(path, &device).map_err(|e| {
                anyhow::anyhow!("loading reward model from {}: {e}", path.display())
            })?;
        }
        None => warn!("no reward model weights configured; scores come from a random model"),
    }

    let mut lit_agent = LitAgent::new(agent, sft_model, reward_model, config.ppo.clone(), device.clone())
        .with_objective(config.objective.clone())
        .with_generation(config.generation.clone());
    if let Some(seed) = config.training.seed {
        lit_agent = lit_agent.with_seed(seed);
    }

    if cli.resume {
        resume(&mut lit_agent, config)?;
        if let Some(lr) = cli.lr {
            lit_agent.set_learning_rate(lr);
        }
    }

    let dataset = PromptDataset::load(&cli.prompts, &tokenizer, config.training.max_prompt_len)
        .with_context(|| format!("loading prompts from {}", cli.prompts.display()))?;

    let trainer = Trainer::new(config.training.clone(), config.checkpoint.clone());
    trainer.train(&mut lit_agent, &dataset).context("training failed")?;

    // Greedy sample from the trained policy
    let batch = dataset.batches(1, None)?.remove(0);
    let prompt = tokenizer.decode(&batch.input_ids);
    let response = sample_response(&lit_agent, &batch, &device)?;
    info!(%prompt, %response, "sample");

    Ok(())
}

/// Resume from the latest checkpoint if there is one.
fn resume<B: AutodiffBackend>(lit_agent: &mut LitAgent<B>, config: &AppConfig) -> Result<()> {
    let manager = CheckpointManager::new(config.checkpoint.clone());
    match manager.load_latest() {
        Ok(data) => {
            lit_agent
                .load_weights_from_dir(&data.path)
                .context("loading checkpoint weights")?;
            lit_agent
                .restore_training_state_json(&data.training_state_json)
                .context("restoring training state")?;
            info!(step = data.metadata.step, "resumed from checkpoint");
        }
        Err(e) => warn!(error = %e, "no checkpoint found, starting fresh"),
    }
    Ok(())
}

fn sample_response<B: AutodiffBackend>(
    lit_agent: &LitAgent<B>,
    batch: &PromptBatch,
    device: &B::Device,
) -> Result<String> {
    let (ids, mask) = batch.to_tensors::<B::InnerBackend>(device);
    let config = GenerationConfig {
        do_sample: false,
        ..lit_agent.generation_config().clone()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let rollout = generate(&lit_agent.inference_agent(), ids, mask, &config, &mut rng)?;
    let tokens = &rollout.response_tokens[..rollout.response_len];
    Ok(ByteTokenizer::new().decode(tokens))
}
