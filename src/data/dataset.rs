use std::path::Path;

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::data::tokenizer::{ByteTokenizer, PAD_TOKEN};
use crate::error::DatasetError;

/// One line of a JSONL prompt file.
#[derive(Debug, serde::Deserialize)]
struct PromptRecord {
    prompt: String,
}

/// Tokenized prompts, each at most `max_prompt_len` tokens.
#[derive(Debug, Clone)]
pub struct PromptDataset {
    prompts: Vec<Vec<i64>>,
}

/// A left-padded batch of prompts in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBatch {
    /// Row-major [batch_size, seq_len].
    pub input_ids: Vec<i64>,
    /// 1.0 for real tokens, 0.0 for padding.
    pub attention_mask: Vec<f32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl PromptDataset {
    pub fn from_prompts<S: AsRef<str>>(
        prompts: &[S],
        tokenizer: &ByteTokenizer,
        max_prompt_len: usize,
    ) -> Result<Self, DatasetError> {
        if prompts.is_empty() {
            return Err(DatasetError::Empty);
        }
        let prompts = prompts
            .iter()
            .map(|p| truncate_left(tokenizer.encode(p.as_ref()), max_prompt_len))
            .collect();
        Ok(PromptDataset { prompts })
    }

    /// Load a JSONL file with one `{"prompt": "..."}` object per line.
    /// Blank lines are skipped.
    pub fn load(
        path: &Path,
        tokenizer: &ByteTokenizer,
        max_prompt_len: usize,
    ) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path).map_err(|e| DatasetError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut prompts = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: PromptRecord =
                serde_json::from_str(line).map_err(|e| DatasetError::LineParse {
                    line: i + 1,
                    source: e,
                })?;
            prompts.push(record.prompt);
        }

        Self::from_prompts(&prompts, tokenizer, max_prompt_len)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Split the dataset into left-padded batches. When `rng` is given the
    /// prompt order is shuffled first. The last batch may be smaller.
    pub fn batches(
        &self,
        batch_size: usize,
        rng: Option<&mut StdRng>,
    ) -> Result<Vec<PromptBatch>, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::ZeroBatchSize);
        }
        let mut order: Vec<usize> = (0..self.prompts.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }

        Ok(order
            .chunks(batch_size)
            .map(|chunk| {
                let seqs: Vec<&[i64]> = chunk.iter().map(|&i| self.prompts[i].as_slice()).collect();
                PromptBatch::from_sequences(&seqs)
            })
            .collect())
    }
}

impl PromptBatch {
    /// Left-pad sequences to the longest one.
    pub fn from_sequences(seqs: &[&[i64]]) -> Self {
        let batch_size = seqs.len();
        let seq_len = seqs.iter().map(|s| s.len()).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for seq in seqs {
            let pad = seq_len - seq.len();
            input_ids.extend(std::iter::repeat(PAD_TOKEN).take(pad));
            input_ids.extend_from_slice(seq);
            attention_mask.extend(std::iter::repeat(0.0).take(pad));
            attention_mask.extend(std::iter::repeat(1.0).take(seq.len()));
        }

        PromptBatch {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        }
    }

    /// Upload the batch: ids [batch, seq] and mask [batch, seq].
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let ids = Tensor::<B, 1, Int>::from_data(TensorData::from(self.input_ids.as_slice()), device)
            .reshape([self.batch_size, self.seq_len]);
        let mask = Tensor::<B, 1>::from_data(TensorData::from(self.attention_mask.as_slice()), device)
            .reshape([self.batch_size, self.seq_len]);
        (ids, mask)
    }
}

/// Keep the first token (BOS) and the last `max_len - 1` tokens.
fn truncate_left(mut ids: Vec<i64>, max_len: usize) -> Vec<i64> {
    if ids.len() <= max_len || max_len == 0 {
        return ids;
    }
    let tail_start = ids.len() - (max_len - 1);
    ids.drain(1..tail_start);
    ids
}
