//! Prompt data: byte-level tokenizer, JSONL prompt dataset and left-padded
//! batching.

mod dataset;
mod tokenizer;

pub use dataset::{PromptBatch, PromptDataset};
pub use tokenizer::{ByteTokenizer, BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, VOCAB_SIZE};
