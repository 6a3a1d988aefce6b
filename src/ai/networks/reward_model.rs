use std::path::Path;

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::record::{DefaultRecorder, RecorderError};

use super::causal_lm::{CausalLm, CausalLmConfig};

/// Scalar reward model: a causal LM backbone with a linear score head read
/// at the last real token of each sequence.
#[derive(Module, Debug)]
pub struct RewardModel<B: Backend> {
    backbone: CausalLm<B>,
    score_head: Linear<B>,
}

#[derive(Config, Debug)]
pub struct RewardModelConfig {
    pub backbone: CausalLmConfig,
}

impl RewardModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RewardModel<B> {
        RewardModel {
            backbone: self.backbone.init(device),
            score_head: LinearConfig::new(self.backbone.n_embd, 1).init(device),
        }
    }
}

impl<B: Backend> RewardModel<B> {
    /// Score each sequence: ids [batch, seq], mask [batch, seq] -> [batch].
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>, attention_mask: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch_size, seq_len] = input_ids.dims();

        let hidden = self
            .backbone
            .forward(input_ids, attention_mask.clone())
            .last_hidden_state;
        let scores = self.score_head.forward(hidden).reshape([batch_size, seq_len]);

        scores
            .gather(1, last_token_index(attention_mask))
            .reshape([batch_size])
    }

    /// Load pretrained weights from a burn record file.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self, RecorderError> {
        self.load_file(path.to_path_buf(), &DefaultRecorder::default(), device)
    }
}

/// Index of the last position whose mask is non-zero, per row: [batch, 1].
/// Handles left padding on the prompt and right padding after EOS.
pub(crate) fn last_token_index<B: Backend>(attention_mask: Tensor<B, 2>) -> Tensor<B, 2, Int> {
    let [batch_size, seq_len] = attention_mask.dims();
    let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &attention_mask.device())
        .float()
        .reshape([1, seq_len])
        .repeat_dim(0, batch_size);
    (positions * attention_mask).argmax(1)
}
