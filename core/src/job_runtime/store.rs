//! Durable on-disk queue, atomic-write persistence adapted from the
//! scheduler's JSON job store: a flat file, written to a temp path and
//! renamed into place so a crash mid-write never corrupts the file a
//! restart reads.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use super::model::{Job, Schedule};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobsFile {
    pub schema_version: u32,
    pub jobs: Vec<Job>,
    pub schedules: Vec<Schedule>,
}

pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self { path: root_dir.as_ref().join("jobs.json") }
    }

    pub fn new_at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<JobsFile> {
        if !self.path.exists() {
            return Ok(JobsFile { schema_version: 1, ..Default::default() });
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| EngineError::internal(e.to_string()))
    }

    pub async fn save(&self, file: &JobsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::internal(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(file).map_err(|e| EngineError::internal(e.to_string()))?;
        self.atomic_write(&json).await
    }

    async fn atomic_write(&self, contents: &str) -> Result<()> {
        let tmp_path = self
            .path
            .with_extension(format!("tmp-{}", Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&tmp_path, contents).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(EngineError::internal(e.to_string()));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(EngineError::internal(e.to_string()));
        }
        Ok(())
    }
}
