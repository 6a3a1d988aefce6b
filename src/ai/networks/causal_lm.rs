use std::path::Path;

use burn::nn::attention::generate_autoregressive_mask;
use burn::nn::transformer::{
    TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput,
};
use burn::nn::{Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::record::{DefaultRecorder, RecorderError};

/// Decoder-only language model used as the policy, the reference (SFT)
/// model and the reward-model backbone.
///
/// ```text
/// Input:     [batch, seq] token ids, [batch, seq] attention mask
/// Embedding: token + position  =>  [batch, seq, n_embd]
/// Blocks:    n_layers pre-norm transformer blocks, causal + padding mask
/// LayerNorm
/// LM head:   n_embd -> vocab_size  =>  [batch, seq, vocab_size]
/// ```
#[derive(Module, Debug)]
pub struct CausalLm<B: Backend> {
    token_embedding: Embedding<B>,
    position_embedding: Embedding<B>,
    blocks: TransformerEncoder<B>,
    ln_f: LayerNorm<B>,
    lm_head: Linear<B>,
    n_embd: usize,
    vocab_size: usize,
    max_seq_len: usize,
}

#[derive(Config, Debug)]
pub struct CausalLmConfig {
    pub vocab_size: usize,
    #[config(default = 128)]
    pub n_embd: usize,
    #[config(default = 4)]
    pub n_heads: usize,
    #[config(default = 2)]
    pub n_layers: usize,
    #[config(default = 512)]
    pub d_ff: usize,
    #[config(default = 256)]
    pub max_seq_len: usize,
}

impl CausalLmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CausalLm<B> {
        CausalLm {
            token_embedding: EmbeddingConfig::new(self.vocab_size, self.n_embd).init(device),
            position_embedding: EmbeddingConfig::new(self.max_seq_len, self.n_embd).init(device),
            blocks: TransformerEncoderConfig::new(
                self.n_embd,
                self.d_ff,
                self.n_heads,
                self.n_layers,
            )
            .with_dropout(0.0)
            .with_norm_first(true)
            .init(device),
            ln_f: LayerNormConfig::new(self.n_embd).init(device),
            lm_head: LinearConfig::new(self.n_embd, self.vocab_size)
                .with_bias(false)
                .init(device),
            n_embd: self.n_embd,
            vocab_size: self.vocab_size,
            max_seq_len: self.max_seq_len,
        }
    }
}

/// Output of a language-model forward pass.
#[derive(Debug, Clone)]
pub struct LmOutput<B: Backend> {
    /// Next-token logits at every position: [batch, seq, vocab_size].
    pub logits: Tensor<B, 3>,
    /// Hidden state of the final block (after the last layer norm): [batch, seq, n_embd].
    pub last_hidden_state: Tensor<B, 3>,
}

impl<B: Backend> CausalLm<B> {
    /// Forward pass over a (possibly padded) batch.
    ///
    /// `attention_mask` holds 1.0 for real tokens and 0.0 for padding.
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>, attention_mask: Tensor<B, 2>) -> LmOutput<B> {
        let [batch_size, seq_len] = input_ids.dims();
        let device = input_ids.device();

        let positions = position_ids(attention_mask.clone());
        let x = self.token_embedding.forward(input_ids) + self.position_embedding.forward(positions);

        let mask_pad = attention_mask.equal_elem(0.0);
        let mask_attn = generate_autoregressive_mask::<B>(batch_size, seq_len, &device);
        let hidden = self.blocks.forward(
            TransformerEncoderInput::new(x)
                .mask_pad(mask_pad)
                .mask_attn(mask_attn),
        );

        let last_hidden_state = self.ln_f.forward(hidden);
        let logits = self.lm_head.forward(last_hidden_state.clone());

        LmOutput {
            logits,
            last_hidden_state,
        }
    }

    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Load pretrained weights from a burn record file.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self, RecorderError> {
        self.load_file(path.to_path_buf(), &DefaultRecorder::default(), device)
    }
}

/// Position ids derived from an attention mask: the running count of real
/// tokens minus one, clamped at zero. Left padding therefore does not shift
/// the positions of the real tokens.
pub fn position_ids<B: Backend>(attention_mask: Tensor<B, 2>) -> Tensor<B, 2, Int> {
    let [_, seq_len] = attention_mask.dims();
    let upper = Tensor::<B, 2>::ones([seq_len, seq_len], &attention_mask.device()).triu(0);
    attention_mask
        .matmul(upper)
        .sub_scalar(1.0)
        .clamp_min(0.0)
        .int()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn small_config() -> CausalLmConfig {
        CausalLmConfig::new(32)
            .with_n_embd(16)
            .with_n_heads(2)
            .with_n_layers(1)
            .with_d_ff(32)
            .with_max_seq_len(16)
    }

    fn ids(data: &[i64], shape: [usize; 2]) -> Tensor<TestBackend, 2, Int> {
        Tensor::<TestBackend, 1, Int>::from_data(TensorData::from(data), &Default::default())
            .reshape(shape)
    }

    fn mask(data: &[f32], shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_data(TensorData::from(data), &Default::default())
            .reshape(shape)
    }

    #[test]
    fn test_causal_lm_output_shapes() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let output = model.forward(ids(&[1, 2, 3, 4, 5, 6], [2, 3]), mask(&[1.0; 6], [2, 3]));
        assert_eq!(output.logits.shape().dims, [2, 3, 32]);
        assert_eq!(output.last_hidden_state.shape().dims, [2, 3, 16]);
        assert_eq!(model.n_embd(), 16);
        assert_eq!(model.vocab_size(), 32);
    }

    #[test]
    fn test_position_ids_skip_left_padding() {
        let positions = position_ids(mask(&[0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0], [2, 4]));
        let data: Vec<i64> = positions.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(data, vec![0, 0, 0, 1, 0, 1, 2, 3]);
    }

    #[test]
    fn test_left_padding_does_not_change_last_logits() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let unpadded = model.forward(ids(&[5, 6, 7], [1, 3]), mask(&[1.0, 1.0, 1.0], [1, 3]));
        let padded = model.forward(
            ids(&[0, 0, 5, 6, 7], [1, 5]),
            mask(&[0.0, 0.0, 1.0, 1.0, 1.0], [1, 5]),
        );

        let a: Vec<f32> = unpadded
            .logits
            .slice([0..1, 2..3, 0..32])
            .into_data()
            .to_vec()
            .unwrap();
        let b: Vec<f32> = padded
            .logits
            .slice([0..1, 4..5, 0..32])
            .into_data()
            .to_vec()
            .unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-3, "{x} vs {y}");
        }
    }

    #[test]
    fn test_save_and_load_pretrained() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lm");

        let model = small_config().init::<TestBackend>(&device);
        model
            .clone()
            .save_file(path.clone(), &DefaultRecorder::default())
            .unwrap();

        let loaded = small_config()
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &device)
            .unwrap();

        let input = ids(&[1, 2, 3], [1, 3]);
        let m = mask(&[1.0, 1.0, 1.0], [1, 3]);
        let a: Vec<f32> = model.forward(input.clone(), m.clone()).logits.into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.forward(input, m).logits.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }
}
