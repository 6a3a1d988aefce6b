use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;

use crate::ai::agent::Agent;
use crate::data::{EOS_TOKEN, PAD_TOKEN};
use crate::error::{tensor_data_error, TrainingError};

/// Sampling settings for response generation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub do_sample: bool,
    pub eos_token_id: Option<i64>,
    pub pad_token_id: i64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_new_tokens: 32,
            temperature: 1.0,
            do_sample: true,
            eos_token_id: Some(EOS_TOKEN),
            pad_token_id: PAD_TOKEN,
        }
    }
}

/// A batch of prompts extended with policy-generated responses.
///
/// Per-token vectors are row-major `[batch, response_len]`. Positions after a
/// row emitted EOS hold the pad token with mask 0.
#[derive(Debug, Clone)]
pub struct Rollout<B: Backend> {
    /// Prompt followed by response: [batch, prompt_len + response_len]
    pub input_ids: Tensor<B, 2, Int>,
    pub attention_mask: Tensor<B, 2>,
    pub prompt_len: usize,
    pub response_len: usize,
    pub response_tokens: Vec<i64>,
    pub response_mask: Vec<f32>,
    /// Untempered policy log-prob of each generated token.
    pub log_probs: Vec<f32>,
    pub values: Vec<f32>,
    pub entropy: Vec<f32>,
}

impl<B: Backend> Rollout<B> {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    /// Response mask as a tensor on any backend: [batch, response_len].
    pub fn response_mask_tensor<B2: Backend>(&self, device: &B2::Device) -> Tensor<B2, 2> {
        Tensor::<B2, 1>::from_data(TensorData::from(self.response_mask.as_slice()), device)
            .reshape([self.batch_size(), self.response_len])
    }

    /// Mean number of real response tokens per row.
    pub fn mean_response_length(&self) -> f32 {
        let total: f32 = self.response_mask.iter().sum();
        total / self.batch_size().max(1) as f32
    }

    /// Policy entropy averaged over real response tokens.
    pub fn mean_entropy(&self) -> f32 {
        let count: f32 = self.response_mask.iter().sum();
        if count == 0.0 {
            return 0.0;
        }
        let total: f32 = self
            .entropy
            .iter()
            .zip(&self.response_mask)
            .map(|(e, m)| e * m)
            .sum();
        total / count
    }
}

/// Data recorded for one generation step, one entry per row.
struct StepRecord {
    tokens: Vec<i64>,
    mask: Vec<f32>,
    log_probs: Vec<f32>,
    values: Vec<f32>,
    entropy: Vec<f32>,
}

/// Autoregressively extend left-padded prompts with the agent's policy.
pub fn generate<B: Backend, R: Rng>(
    agent: &Agent<B>,
    input_ids: Tensor<B, 2, Int>,
    attention_mask: Tensor<B, 2>,
    config: &GenerationConfig,
    rng: &mut R,
) -> Result<Rollout<B>, TrainingError> {
    let [batch_size, prompt_len] = input_ids.dims();
    if batch_size == 0 {
        return Err(TrainingError::EmptyBatch);
    }
    if prompt_len == 0 {
        return Err(TrainingError::PromptTooShort(prompt_len));
    }
    if config.max_new_tokens == 0 {
        return Err(TrainingError::NoNewTokens);
    }
    let max_len = agent.policy_network().max_seq_len();
    if prompt_len + config.max_new_tokens > max_len {
        return Err(TrainingError::SequenceTooLong {
            len: prompt_len + config.max_new_tokens,
            max: max_len,
        });
    }

    let device = input_ids.device();
    let vocab_size = agent.policy_network().vocab_size();

    let mut ids = input_ids;
    let mut mask = attention_mask;
    let mut finished = vec![false; batch_size];
    let mut steps: Vec<StepRecord> = Vec::with_capacity(config.max_new_tokens);

    for _ in 0..config.max_new_tokens {
        if finished.iter().all(|&f| f) {
            break;
        }

        let output = agent.forward(ids.clone(), mask.clone());
        let logits: Vec<f32> = output.logits.into_data().to_vec().map_err(tensor_data_error)?;
        let log_probs: Vec<f32> = output
            .log_probs
            .into_data()
            .to_vec()
            .map_err(tensor_data_error)?;
        let values: Vec<f32> = output.value.into_data().to_vec().map_err(tensor_data_error)?;
        let entropy: Vec<f32> = output.entropy.into_data().to_vec().map_err(tensor_data_error)?;

        let mut step = StepRecord {
            tokens: vec![config.pad_token_id; batch_size],
            mask: vec![0.0; batch_size],
            log_probs: vec![0.0; batch_size],
            values: vec![0.0; batch_size],
            entropy: vec![0.0; batch_size],
        };

        for row in 0..batch_size {
            if finished[row] {
                continue;
            }
            let row_logits = &logits[row * vocab_size..(row + 1) * vocab_size];
            let token = if config.do_sample && config.temperature > 0.0 {
                sample_categorical(&softmax_with_temperature(row_logits, config.temperature), rng)
            } else {
                argmax(row_logits)
            };

            step.tokens[row] = token as i64;
            step.mask[row] = 1.0;
            step.log_probs[row] = log_probs[row * vocab_size + token];
            step.values[row] = values[row];
            step.entropy[row] = entropy[row];

            if config.eos_token_id == Some(token as i64) {
                finished[row] = true;
            }
        }

        let token_tensor =
            Tensor::<B, 1, Int>::from_data(TensorData::from(step.tokens.as_slice()), &device)
                .reshape([batch_size, 1]);
        let mask_tensor = Tensor::<B, 1>::from_data(TensorData::from(step.mask.as_slice()), &device)
            .reshape([batch_size, 1]);
        ids = Tensor::cat(vec![ids, token_tensor], 1);
        mask = Tensor::cat(vec![mask, mask_tensor], 1);

        steps.push(step);
    }

    let response_len = steps.len();
    let gather = |field: fn(&StepRecord) -> &Vec<f32>| -> Vec<f32> {
        (0..batch_size)
            .flat_map(|row| steps.iter().map(move |s| field(s)[row]))
            .collect()
    };
    let response_tokens: Vec<i64> = (0..batch_size)
        .flat_map(|row| steps.iter().map(move |s| s.tokens[row]))
        .collect();

    Ok(Rollout {
        input_ids: ids,
        attention_mask: mask,
        prompt_len,
        response_len,
        response_tokens,
        response_mask: gather(|s| &s.mask),
        log_probs: gather(|s| &s.log_probs),
        values: gather(|s| &s.values),
        entropy: gather(|s| &s.entropy),
    })
}

/// Numerically stable softmax of `logits / temperature`.
fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max_val) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }
    probs
}

/// Sample an index from a categorical distribution defined by probs.
fn sample_categorical<R: Rng>(probs: &[f32], rng: &mut R) -> usize {
    let r: f32 = rng.random_range(0.0..1.0);
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    // Rounding left r above the cumulative sum
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::networks::CausalLmConfig;
    use burn::backend::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn agent(max_seq_len: usize) -> Agent<TestBackend> {
        let device = Default::default();
        let lm = CausalLmConfig::new(24)
            .with_n_embd(16)
            .with_n_heads(2)
            .with_n_layers(1)
            .with_d_ff(32)
            .with_max_seq_len(max_seq_len)
            .init::<TestBackend>(&device);
        Agent::new(lm, &device)
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

    #[test]
    fn test_generate_without_eos_fills_all_tokens() {
        let agent = agent(16);
        let (ids, mask) = prompts();
        let config = GenerationConfig {
            max_new_tokens: 4,
            eos_token_id: None,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);

        let rollout = generate(&agent, ids, mask, &config, &mut rng).unwrap();
        assert_eq!(rollout.prompt_len, 3);
        assert_eq!(rollout.response_len, 4);
        assert_eq!(rollout.input_ids.dims(), [2, 7]);
        assert_eq!(rollout.attention_mask.dims(), [2, 7]);
        assert_eq!(rollout.response_tokens.len(), 8);
        assert!(rollout.response_mask.iter().all(|&m| m == 1.0));
        assert!(rollout.log_probs.iter().all(|&lp| lp <= 0.0));
        assert!(rollout.values.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!((rollout.mean_response_length() - 4.0).abs() < 1e-6);
        assert!(rollout.entropy.iter().all(|&e| e >= 0.0));
        let plain_mean = rollout.entropy.iter().sum::<f32>() / 8.0;
        assert!((rollout.mean_entropy() - plain_mean).abs() < 1e-5);
    }

    fn greedy_first_token(agent: &Agent<TestBackend>, ids: &[i64]) -> i64 {
        let device = Default::default();
        let input = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from(ids), &device)
            .reshape([1, ids.len()]);
        let logits: Vec<f32> = agent
            .forward(input, Tensor::ones([1, ids.len()], &device))
            .logits
            .into_data()
            .to_vec()
            .unwrap();
        argmax(&logits) as i64
    }

    #[test]
    fn test_generate_stops_when_every_row_emits_eos() {
        let agent = agent(16);
        let device = Default::default();
        // Identical rows pick the same greedy token.
        let ids = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::from([5i64, 6, 7, 5, 6, 7].as_slice()),
            &device,
        )
        .reshape([2, 3]);
        let mask = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let eos = greedy_first_token(&agent, &[5, 6, 7]);

        let config = GenerationConfig {
            max_new_tokens: 5,
            do_sample: false,
            eos_token_id: Some(eos),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let rollout = generate(&agent, ids, mask, &config, &mut rng).unwrap();

        assert_eq!(rollout.response_len, 1);
        assert_eq!(rollout.input_ids.dims(), [2, 4]);
        assert_eq!(rollout.response_tokens, vec![eos, eos]);
        assert_eq!(rollout.response_mask, vec![1.0, 1.0]);
    }

    #[test]
    fn test_finished_row_is_padded_while_others_continue() {
        let agent = agent(16);
        let device = Default::default();
        let eos = greedy_first_token(&agent, &[5, 6, 7]);
        // A second prompt whose greedy first token is not EOS keeps generating.
        let other = (0..24i64)
            .map(|t| [5, 6, t])
            .find(|p| greedy_first_token(&agent, p) != eos)
            .expect("some prompt avoids the EOS token");

        let ids = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::from([5i64, 6, 7, other[0], other[1], other[2]].as_slice()),
            &device,
        )
        .reshape([2, 3]);
        let mask = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let config = GenerationConfig {
            max_new_tokens: 4,
            do_sample: false,
            eos_token_id: Some(eos),
            pad_token_id: 23,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let rollout = generate(&agent, ids, mask, &config, &mut rng).unwrap();

        let len = rollout.response_len;
        assert!(len >= 2);
        assert_eq!(rollout.response_tokens[0], eos);
        assert_eq!(rollout.response_mask[0], 1.0);
        assert!(rollout.response_tokens[1..len].iter().all(|&t| t == 23));
        assert!(rollout.response_mask[1..len].iter().all(|&m| m == 0.0));
        assert_eq!(rollout.response_mask[len], 1.0);

        // Padded positions do not count toward the entropy average.
        let live: Vec<f32> = rollout
            .entropy
            .iter()
            .zip(&rollout.response_mask)
            .filter(|(_, &m)| m == 1.0)
            .map(|(&e, _)| e)
            .collect();
        let expected = live.iter().sum::<f32>() / live.len() as f32;
        assert!((rollout.mean_entropy() - expected).abs() < 1e-5);

        let full_mask: Vec<f32> = rollout.attention_mask.into_data().to_vec().unwrap();
        assert!(full_mask[4..3 + len].iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_generate_rejects_overlong_sequences() {
        let agent = agent(5);
        let (ids, mask) = prompts();
        let config = GenerationConfig {
            max_new_tokens: 4,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = generate(&agent, ids, mask, &config, &mut rng).unwrap_err();
        assert!(matches!(err, TrainingError::SequenceTooLong { len: 7, max: 5 }));
    }

    #[test]
    fn test_softmax_with_temperature_sharpens() {
        let logits = [1.0, 2.0, 3.0];
        let warm = softmax_with_temperature(&logits, 1.0);
        let cold = softmax_with_temperature(&logits, 0.1);
        assert!((warm.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(cold[2] > warm[2]);
    }

    #[test]
    fn test_sample_categorical_respects_zero_probability() {
        let mut rng = StdRng::seed_from_u64(3);
        let probs = [0.0, 0.5, 0.0, 0.5];
        for _ in 0..100 {
            let i = sample_categorical(&probs, &mut rng);
            assert!(i == 1 || i == 3);
        }
    }
}
