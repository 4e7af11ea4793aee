// Copyright 2025 OSMO Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object storage boundary for workflow artefacts (archived logs, pod
//! specs, app contents). Cloud client libraries live behind this trait.

use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Io(String),
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Stores a blob under `prefix/name` and returns its location.
    async fn put(&self, prefix: &str, name: &str, content: &[u8]) -> Result<String, StorageError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError>;
}

/// Filesystem-backed store for local and dev deployments.
pub struct FsStorageClient {
    root: PathBuf,
}

impl FsStorageClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageClient for FsStorageClient {
    async fn put(&self, prefix: &str, name: &str, content: &[u8]) -> Result<String, StorageError> {
        let dir = self.root.join(prefix);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::Io(err.to_string()))?;
        let path = dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|err| StorageError::Io(err.to_string()))?;
        Ok(path.display().to_string())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let dir = self.root.join(prefix);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err.to_string())),
        }
    }
}
