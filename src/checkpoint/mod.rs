mod manager;
mod metadata;

use std::path::Path;

use crate::error::CheckpointError;

pub use manager::{AgentCheckpointData, CheckpointManager, CheckpointManagerConfig};
pub use metadata::{
    CheckpointHyperparameters, CheckpointMetadata, CheckpointMetrics, RlhfTrainingState,
};

/// Anything the checkpoint manager can persist.
pub trait Checkpointable {
    /// Write network weights into `dir`.
    fn save_weights_to_dir(&self, dir: &Path) -> Result<(), CheckpointError>;
    /// Serialize training state to JSON.
    fn training_state_json(&self) -> Result<String, CheckpointError>;
    /// Build checkpoint metadata for this agent.
    fn build_checkpoint_metadata(
        &self,
        metrics: &CheckpointMetrics,
        step: usize,
        timestamp: u64,
    ) -> CheckpointMetadata;
}
