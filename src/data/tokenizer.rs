/// Beginning-of-sequence token, prepended to every encoded prompt.
pub const BOS_TOKEN: i64 = 256;
pub const EOS_TOKEN: i64 = 257;
pub const PAD_TOKEN: i64 = 258;
/// 256 byte values plus the three special tokens.
pub const VOCAB_SIZE: usize = 259;

/// Byte-level tokenizer: every UTF-8 byte is one token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        ByteTokenizer
    }

    /// Encode text as `[BOS, bytes...]`.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        std::iter::once(BOS_TOKEN)
            .chain(text.bytes().map(i64::from))
            .collect()
    }

    /// Decode token ids, skipping special tokens. Invalid UTF-8 is replaced.
    pub fn decode(&self, ids: &[i64]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
