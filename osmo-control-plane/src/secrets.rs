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

//! Credential resolution boundary. The control plane only ever needs the
//! *values* of a task's credentials to scrub them from captured logs;
//! encryption and storage of credentials live outside this crate.

use async_trait::async_trait;
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret resolution failed: {0}")]
    Resolve(String),
}

#[async_trait]
pub trait SecretBox: Send + Sync {
    /// The plaintext values of one named credential of one user.
    async fn resolve(&self, user: &str, name: &str) -> Result<Vec<String>, SecretError>;
}

/// Used when no credential store is wired in.
pub struct NoSecrets;

#[async_trait]
impl SecretBox for NoSecrets {
    async fn resolve(&self, _user: &str, _name: &str) -> Result<Vec<String>, SecretError> {
        Ok(Vec::new())
    }
}

/// Replaces every known secret value in `text`. Values shorter than eight
/// characters are skipped: masking them would mangle ordinary words.
pub fn mask_values(text: &str, values: &BTreeSet<String>) -> String {
    let mut masked = text.to_string();
    for value in values {
        if value.len() >= 8 {
            masked = masked.replace(value.as_str(), "****");
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn masks_long_values_only() {
        let values = BTreeSet::from(["supersecrettoken".to_string(), "short".to_string()]);
        let masked = mask_values("auth=supersecrettoken mode=short", &values);
        assert_eq!(masked, "auth=**** mode=short");
    }
}
