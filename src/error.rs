use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint directory not found: {0}")]
    DirNotFound(PathBuf),

    #[error("no 'latest' symlink found in {0}")]
    NoLatestSymlink(PathBuf),

    #[error("failed to read metadata from {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse metadata from {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to save model: {0}")]
    ModelSave(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during rollout generation and training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("prompt batch is empty")]
    EmptyBatch,

    #[error("prompts must contain at least one token (got length {0})")]
    PromptTooShort(usize),

    #[error("max_new_tokens must be > 0")]
    NoNewTokens,

    #[error("sequence length {len} exceeds the model's maximum of {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("failed to read tensor data: {0}")]
    TensorData(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
}

/// Errors that can occur while loading or batching prompts.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON on line {line}: {source}")]
    LineParse {
        line: usize,
        source: serde_json::Error,
    },

    #[error("dataset contains no prompts")]
    Empty,

    #[error("batch size must be > 0")]
    ZeroBatchSize,
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

/// Map a burn tensor read-back failure into a training error.
pub(crate) fn tensor_data_error(err: burn::tensor::DataError) -> TrainingError {
    TrainingError::TensorData(format!("{err:?}"))
}
