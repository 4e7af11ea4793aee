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

use osmo_common::model::WorkflowId;
use rand::Rng;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase alphanumeric suffix, used to de-collide job ids that
/// must not coalesce (forced cancels, repeated cleanups, check timers).
pub fn generate_unique_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Mints the public workflow id: the user-chosen name plus a random base32
/// suffix.
pub fn mint_workflow_id(name: &str) -> WorkflowId {
    let mut rng = rand::rng();
    let raw: [u8; 4] = rng.random();
    let suffix = base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &raw);
    WorkflowId(format!("{}-{}", name, &suffix[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn unique_ids_have_requested_length() {
        let id = generate_unique_id(6);
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn workflow_ids_keep_the_human_prefix() {
        let id = mint_workflow_id("train-model");
        assert!(id.0.starts_with("train-model-"));
        assert_eq!(id.0.len(), "train-model-".len() + 6);
    }
}
