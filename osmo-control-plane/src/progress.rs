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

//! Liveness progress file. Worker loops touch it; the deployment's
//! liveness probe reads it and restarts replicas that stopped making
//! progress.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct ProgressWriter {
    path: Option<PathBuf>,
}

impl ProgressWriter {
    pub fn new(path: &str) -> Self {
        let path = if path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        };
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub async fn report_progress(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        // Write-then-rename keeps the probe from ever reading a torn file.
        let temp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let outcome = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&temp, now.to_string()).await?;
            tokio::fs::rename(&temp, path).await
        }
        .await;
        if let Err(err) = outcome {
            warn!(error = %err, "Failed to report progress");
        }
    }
}

pub struct ProgressReader {
    path: PathBuf,
}

impl ProgressReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn has_recent_progress(&self, within_secs: f64) -> bool {
        let Ok(contents) = tokio::fs::read_to_string(&self.path).await else {
            return false;
        };
        let Ok(last_progress) = contents.trim().parse::<f64>() else {
            return false;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        last_progress > now - within_secs
    }
}
