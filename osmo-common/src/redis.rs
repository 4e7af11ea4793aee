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

use crate::config::RedisConfig;
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::Config;
use fred::types::Builder;
use tracing::info;

/// A fred connection pool together with the configured key prefix. All
/// control-plane keys go through [`RedisPool::key`] so that multiple
/// deployments can share one Redis.
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
    key_prefix: String,
}

impl RedisPool {
    pub async fn configured(config: &RedisConfig) -> Result<RedisPool, fred::error::Error> {
        info!(
            "Redis pool: {}:{}/{} (prefix: {:?})",
            config.host, config.port, config.database, config.key_prefix
        );
        let fred_config = Config::from_url(&config.url())?;
        let pool = Builder::from_config(fred_config).build_pool(config.pool_size)?;
        pool.init().await?;
        Ok(RedisPool {
            pool,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn key(&self, key: impl AsRef<str>) -> String {
        format!("{}{}", self.key_prefix, key.as_ref())
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
