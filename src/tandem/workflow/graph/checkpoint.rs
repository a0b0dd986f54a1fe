// SPDX-License-Identifier: MIT

//! Checkpoint persistence
//!
//! The executor writes one checkpoint per completed step when a store is
//! configured and never reads it back mid-run. Resuming is host-initiated
//! through `GraphExecutor::resume`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adk::error::CheckpointError;
use crate::tandem::workflow::state::GraphState;

use super::types::NodeId;

/// Persisted execution snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub execution_id: String,
    pub label: String,
    /// Number of steps completed when the snapshot was taken
    pub step: usize,
    pub state: GraphState,
    /// Nodes still queued, in order
    pub pending: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        label: impl Into<String>,
        step: usize,
        state: GraphState,
        pending: Vec<NodeId>,
    ) -> Self {
        Self {
            execution_id: state.execution_id.clone(),
            label: label.into(),
            step,
            state,
            pending,
            created_at: Utc::now(),
        }
    }

    /// Label the executor gives the snapshot taken after `step` steps
    pub fn step_label(step: usize) -> String {
        format!("step-{:05}", step)
    }
}

/// Storage backend for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint, replacing one with the same execution id and label
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, execution_id: &str, label: &str) -> Result<Checkpoint, CheckpointError>;

    /// Checkpoint with the highest step count
    async fn latest(&self, execution_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.list(execution_id).await?.pop())
    }

    /// All checkpoints of an execution, ordered by step
    async fn list(&self, execution_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Remove every checkpoint of an execution
    async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError>;
}

/// In-process store, mostly for tests and short-lived hosts
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        let entries = checkpoints
            .entry(checkpoint.execution_id.clone())
            .or_default();
        entries.retain(|c| c.label != checkpoint.label);
        entries.push(checkpoint.clone());
        entries.sort_by_key(|c| c.step);
        Ok(())
    }

    async fn load(&self, execution_id: &str, label: &str) -> Result<Checkpoint, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        checkpoints
            .get(execution_id)
            .and_then(|entries| entries.iter().find(|c| c.label == label))
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound {
                execution_id: execution_id.to_string(),
                label: label.to_string(),
            })
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(execution_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(execution_id);
        Ok(())
    }
}

/// One JSON file per checkpoint under `<root>/<execution_id>/<label>.json`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn execution_dir(&self, execution_id: &str) -> PathBuf {
        self.root.join(sanitize(execution_id))
    }

    fn checkpoint_path(&self, execution_id: &str, label: &str) -> PathBuf {
        self.execution_dir(execution_id)
            .join(format!("{}.json", sanitize(label)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(self.execution_dir(&checkpoint.execution_id)).await?;
        let path = self.checkpoint_path(&checkpoint.execution_id, &checkpoint.label);
        let json = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&path, json).await?;
        log::debug!("Wrote checkpoint {}", path.display());
        Ok(())
    }

    async fn load(&self, execution_id: &str, label: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(execution_id, label);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CheckpointError::NotFound {
                execution_id: execution_id.to_string(),
                label: label.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let dir = self.execution_dir(execution_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => log::warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }
        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_dir_all(self.execution_dir(execution_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep ids and labels usable as single path components
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
