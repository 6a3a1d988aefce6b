use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::checkpoint::metadata::{CheckpointMetadata, CheckpointMetrics};
use crate::checkpoint::Checkpointable;
use crate::error::CheckpointError;

const LATEST: &str = "latest";

/// Configuration for the checkpoint manager.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CheckpointManagerConfig {
    pub checkpoint_dir: PathBuf,
    pub keep_last_n: usize,
    pub keep_best_n: usize,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        CheckpointManagerConfig {
            checkpoint_dir: PathBuf::from("checkpoints"),
            keep_last_n: 5,
            keep_best_n: 3,
        }
    }
}

/// Checkpoint contents read back from disk. Weights are loaded by the agent
/// from `path`.
#[derive(Debug)]
pub struct AgentCheckpointData {
    pub path: PathBuf,
    pub metadata: CheckpointMetadata,
    pub training_state_json: String,
}

/// Manages saving, loading, listing, and pruning checkpoints.
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointManagerConfig) -> Self {
        fs::create_dir_all(&config.checkpoint_dir).ok();
        CheckpointManager { config }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Save a checkpoint into `checkpoint_{step:07}`, written to a `.tmp`
    /// directory first and renamed into place.
    pub fn save_checkpoint(
        &self,
        agent: &dyn Checkpointable,
        metrics: &CheckpointMetrics,
        step: usize,
    ) -> Result<PathBuf, CheckpointError> {
        let dir_name = format!("checkpoint_{:07}", step);
        let tmp_dir = self.config.checkpoint_dir.join(format!("{}.tmp", dir_name));
        let final_dir = self.config.checkpoint_dir.join(&dir_name);

        fs::create_dir_all(&tmp_dir)?;

        agent.save_weights_to_dir(&tmp_dir)?;
        fs::write(tmp_dir.join("training_state.json"), agent.training_state_json()?)?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let metadata = agent.build_checkpoint_metadata(metrics, step, timestamp);
        let meta_json = serde_json::to_string_pretty(&metadata)?;
        fs::write(tmp_dir.join("metadata.json"), meta_json)?;

        // Atomic rename
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;

        self.update_latest(&dir_name)?;
        self.prune_old_checkpoints()?;

        debug!(path = %final_dir.display(), "checkpoint written");
        Ok(final_dir)
    }

    /// Load metadata and training state from a checkpoint directory.
    pub fn load_checkpoint(&self, dir: &Path) -> Result<AgentCheckpointData, CheckpointError> {
        if !dir.is_dir() {
            return Err(CheckpointError::DirNotFound(dir.to_path_buf()));
        }
        let metadata = read_metadata(&dir.join("metadata.json"))?;

        let ts_path = dir.join("training_state.json");
        let training_state_json =
            fs::read_to_string(&ts_path).map_err(|e| CheckpointError::MetadataRead {
                path: ts_path,
                source: e,
            })?;

        Ok(AgentCheckpointData {
            path: dir.to_path_buf(),
            metadata,
            training_state_json,
        })
    }

    /// Load the checkpoint that `latest` points to.
    pub fn load_latest(&self) -> Result<AgentCheckpointData, CheckpointError> {
        let latest = self.config.checkpoint_dir.join(LATEST);
        let target = match latest.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => fs::read_link(&latest)?,
            Ok(_) => PathBuf::from(fs::read_to_string(&latest)?.trim()),
            Err(_) => {
                return Err(CheckpointError::NoLatestSymlink(
                    self.config.checkpoint_dir.clone(),
                ))
            }
        };
        let target = if target.is_relative() {
            self.config.checkpoint_dir.join(target)
        } else {
            target
        };
        self.load_checkpoint(&target)
    }

    /// List all checkpoints sorted by step (ascending).
    pub fn list_checkpoints(&self) -> Result<Vec<(PathBuf, CheckpointMetadata)>, CheckpointError> {
        let mut results = Vec::new();
        for entry in fs::read_dir(&self.config.checkpoint_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || entry.file_type()?.is_symlink() {
                continue;
            }
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if !name_str.starts_with("checkpoint_") || name_str.ends_with(".tmp") {
                continue;
            }
            let meta_path = path.join("metadata.json");
            if meta_path.exists() {
                let metadata = read_metadata(&meta_path)?;
                results.push((path, metadata));
            }
        }
        results.sort_by_key(|(_, m)| m.step);
        Ok(results)
    }

    /// Prune old checkpoints, keeping the union of the last N and the best N
    /// by mean reward.
    fn prune_old_checkpoints(&self) -> Result<(), CheckpointError> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= self.config.keep_last_n {
            return Ok(());
        }

        let total = checkpoints.len();
        let mut keep: HashSet<usize> = (total.saturating_sub(self.config.keep_last_n)..total).collect();

        let mut by_reward: Vec<(usize, f32)> = checkpoints
            .iter()
            .enumerate()
            .map(|(i, (_, m))| (i, m.metrics.mean_reward))
            .collect();
        by_reward.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        for (i, _) in by_reward.iter().take(self.config.keep_best_n) {
            keep.insert(*i);
        }

        for (i, (path, _)) in checkpoints.iter().enumerate() {
            if !keep.contains(&i) {
                fs::remove_dir_all(path)?;
            }
        }

        Ok(())
    }

    /// Point `latest` at the given checkpoint directory name.
    fn update_latest(&self, dir_name: &str) -> Result<(), CheckpointError> {
        let link_path = self.config.checkpoint_dir.join(LATEST);
        if link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir_name, &link_path)?;
        #[cfg(not(unix))]
        fs::write(&link_path, dir_name)?;
        Ok(())
    }
}

fn read_metadata(meta_path: &Path) -> Result<CheckpointMetadata, CheckpointError> {
    let meta_json = fs::read_to_string(meta_path).map_err(|e| CheckpointError::MetadataRead {
        path: meta_path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&meta_json).map_err(|e| CheckpointError::MetadataParse {
        path: meta_path.to_path_buf(),
        source: e,
    })
}
