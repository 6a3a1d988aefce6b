use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use crate::ai::networks::{CausalLm, ValueNetwork, ValueNetworkConfig};

/// RLHF agent: a pretrained causal LM as the policy network plus a value
/// network reading the LM's last hidden state.
#[derive(Module, Debug)]
pub struct Agent<B: Backend> {
    policy_network: CausalLm<B>,
    value_network: ValueNetwork<B>,
}

/// Next-token outputs for the last position of each sequence.
#[derive(Debug, Clone)]
pub struct AgentOutput<B: Backend> {
    /// [batch, vocab_size]
    pub logits: Tensor<B, 2>,
    /// [batch, vocab_size]
    pub log_probs: Tensor<B, 2>,
    /// Entropy of the next-token distribution: [batch]
    pub entropy: Tensor<B, 1>,
    /// Predicted value: [batch]
    pub value: Tensor<B, 1>,
}

/// Teacher-forced evaluation of a generated response.
#[derive(Debug, Clone)]
pub struct ActionEvaluation<B: Backend> {
    /// log pi(y_t | x, y_<t): [batch, response_len]
    pub log_probs: Tensor<B, 2>,
    /// [batch, response_len]
    pub entropy: Tensor<B, 2>,
    /// Value at the state preceding each response token: [batch, response_len]
    pub values: Tensor<B, 2>,
    /// Mean log-likelihood of the prompt tokens under the policy: [1]
    pub prompt_log_likelihood: Tensor<B, 1>,
}

impl<B: Backend> Agent<B> {
    /// Wrap a pretrained language model; the value network is sized from its
    /// embedding width.
    pub fn new(model: CausalLm<B>, device: &B::Device) -> Self {
        let value_network = ValueNetworkConfig::new(model.n_embd()).init(device);
        Agent {
            policy_network: model,
            value_network,
        }
    }

    pub fn policy_network(&self) -> &CausalLm<B> {
        &self.policy_network
    }

    /// Value of the last position: hidden [batch, seq, n_embd] -> [batch, 1].
    pub fn get_value(&self, hidden_state: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, seq_len, _] = hidden_state.dims();
        self.value_network
            .forward(hidden_state)
            .slice([0..batch_size, seq_len - 1..seq_len, 0..1])
            .reshape([batch_size, 1])
    }

    /// Forward pass for the last token of each sequence.
    ///
    /// Prompts are expected to be left-padded so the last position is a real
    /// token.
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>, attention_mask: Tensor<B, 2>) -> AgentOutput<B> {
        let output = self.policy_network.forward(input_ids, attention_mask);
        let [batch_size, seq_len, vocab_size] = output.logits.dims();

        let logits = output
            .logits
            .slice([0..batch_size, seq_len - 1..seq_len, 0..vocab_size])
            .reshape([batch_size, vocab_size]);
        let log_probs = log_softmax(logits.clone(), 1);
        let entropy = -(log_probs.clone().exp() * log_probs.clone())
            .sum_dim(1)
            .reshape([batch_size]);

        let value = self
            .get_value(output.last_hidden_state)
            .reshape([batch_size]);

        AgentOutput {
            logits,
            log_probs,
            entropy,
            value,
        }
    }

    /// Re-evaluate a response of `response_len` tokens that follows a prompt
    /// of `prompt_len` (padded) positions.
    ///
    /// Values are read at positions `prompt_len - 1 ..`, i.e. the same
    /// positions [`Agent::forward`] used while the response was generated.
    pub fn evaluate_actions(
        &self,
        input_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2>,
        prompt_len: usize,
        response_len: usize,
    ) -> ActionEvaluation<B> {
        debug_assert!(prompt_len >= 1, "prompt must hold at least one token");
        let output = self
            .policy_network
            .forward(input_ids.clone(), attention_mask.clone());
        let [batch_size, seq_len, _] = output.logits.dims();

        let (log_probs, entropy) =
            token_log_probs_and_entropy(output.logits.clone(), input_ids.clone(), prompt_len, response_len);

        let values = self
            .value_network
            .forward(output.last_hidden_state)
            .reshape([batch_size, seq_len])
            .slice([0..batch_size, prompt_len - 1..prompt_len - 1 + response_len]);

        let prompt_log_likelihood =
            prompt_log_likelihood(output.logits, input_ids, attention_mask, prompt_len);

        ActionEvaluation {
            log_probs,
            entropy,
            values,
            prompt_log_likelihood,
        }
    }
}

/// Log-probability of tokens `start..start + len` under the distribution
/// predicted at the preceding position: [batch, len]. Requires `start >= 1`.
pub fn token_log_probs<B: Backend>(
    logits: Tensor<B, 3>,
    input_ids: Tensor<B, 2, Int>,
    start: usize,
    len: usize,
) -> Tensor<B, 2> {
    token_log_probs_and_entropy(logits, input_ids, start, len).0
}

fn token_log_probs_and_entropy<B: Backend>(
    logits: Tensor<B, 3>,
    input_ids: Tensor<B, 2, Int>,
    start: usize,
    len: usize,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [batch_size, _, vocab_size] = logits.dims();

    let log_probs = log_softmax(
        logits.slice([0..batch_size, start - 1..start - 1 + len, 0..vocab_size]),
        2,
    );
    let targets = input_ids
        .slice([0..batch_size, start..start + len])
        .reshape([batch_size, len, 1]);

    let selected = log_probs.clone().gather(2, targets).reshape([batch_size, len]);
    let entropy = -(log_probs.clone().exp() * log_probs)
        .sum_dim(2)
        .reshape([batch_size, len]);

    (selected, entropy)
}

/// Mean log-likelihood of the prompt tokens, counting a token only when it
/// and its predecessor are both real (not padding).
pub fn prompt_log_likelihood<B: Backend>(
    logits: Tensor<B, 3>,
    input_ids: Tensor<B, 2, Int>,
    attention_mask: Tensor<B, 2>,
    prompt_len: usize,
) -> Tensor<B, 1> {
    let device = logits.device();
    if prompt_len < 2 {
        return Tensor::zeros([1], &device);
    }
    let [batch_size, _] = input_ids.dims();

    let log_probs = token_log_probs(logits, input_ids, 1, prompt_len - 1);
    let mask = attention_mask.clone().slice([0..batch_size, 1..prompt_len])
        * attention_mask.slice([0..batch_size, 0..prompt_len - 1]);

    masked_mean(log_probs, mask)
}

/// Mean of `values` over the positions where `mask` is 1: [1].
pub fn masked_mean<B: Backend, const D: usize>(values: Tensor<B, D>, mask: Tensor<B, D>) -> Tensor<B, 1> {
    (values * mask.clone()).sum() / mask.sum().clamp_min(1.0)
}
