use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppError;
use crate::models::PipelineKind;

/// Last fully flushed height per pipeline
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, kind: PipelineKind) -> Result<Option<u64>, AppError>;

    /// Durable overwrite
    async fn save(&self, kind: PipelineKind, height: u64) -> Result<(), AppError>;
}

/// One plain-text file per pipeline holding a decimal height
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, kind: PipelineKind) -> PathBuf {
        self.directory.join(kind.checkpoint_name())
    }
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Display) -> AppError {
    AppError::CheckpointError(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, kind: PipelineKind) -> Result<Option<u64>, AppError> {
        let path = self.path_for(kind);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(checkpoint_error(&path, e)),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|e| checkpoint_error(&path, format!("invalid height '{}': {}", trimmed, e)))
    }

    async fn save(&self, kind: PipelineKind, height: u64) -> Result<(), AppError> {
        let path = self.path_for(kind);
        let staging = path.with_extension("tmp");

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| checkpoint_error(&self.directory, e))?;

        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| checkpoint_error(&staging, e))?;
        file.write_all(height.to_string().as_bytes())
            .await
            .map_err(|e| checkpoint_error(&staging, e))?;
        file.sync_all().await.map_err(|e| checkpoint_error(&staging, e))?;
        drop(file);

        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| checkpoint_error(&path, e))?;

        debug!(pipeline = %kind, height, "Checkpoint saved");
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    heights: Mutex<HashMap<PipelineKind, u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_height(kind: PipelineKind, height: u64) -> Self {
        Self {
            heights: Mutex::new(HashMap::from([(kind, height)])),
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, kind: PipelineKind) -> Result<Option<u64>, AppError> {
        Ok(self.heights.lock().await.get(&kind).copied())
    }

    async fn save(&self, kind: PipelineKind, height: u64) -> Result<(), AppError> {
        self.heights.lock().await.insert(kind, height);
        Ok(())
    }
}
