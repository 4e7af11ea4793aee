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

//! Moves due entries from the delayed sorted set into their ready queues.
//!
//! The move runs as a Lua script, so a member is popped and pushed
//! atomically: concurrent monitor replicas cannot double-deliver.

use crate::broker::{BrokerError, RedisBroker, DELAYED_JOB_QUEUE};
use fred::interfaces::LuaInterface;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const MOVE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local moved = 0
for _, entry in ipairs(due) do
    if redis.call('ZREM', KEYS[1], entry) == 1 then
        local sep = string.find(entry, '\n', 1, true)
        local queue = string.sub(entry, 1, sep - 1)
        local payload = string.sub(entry, sep + 1)
        redis.call('LPUSH', queue, payload)
        moved = moved + 1
    end
end
return moved
"#;

pub struct DelayedJobMonitor {
    broker: RedisBroker,
    poll_interval: Duration,
    batch_size: u32,
}

impl DelayedJobMonitor {
    pub fn new(broker: RedisBroker, poll_interval: Duration) -> Self {
        Self {
            broker,
            poll_interval,
            batch_size: 128,
        }
    }

    /// Transfers every entry whose visibility timestamp has passed.
    /// Returns the number of jobs made visible.
    pub async fn move_due(&self) -> Result<u64, BrokerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let key = self.broker.redis().key(DELAYED_JOB_QUEUE);
        let moved: i64 = self
            .broker
            .redis()
            .pool()
            .eval(
                MOVE_DUE_SCRIPT,
                vec![key],
                vec![now_ms.to_string(), self.batch_size.to_string()],
            )
            .await?;
        if moved > 0 {
            debug!(moved, "Delayed jobs became visible");
        }
        Ok(moved.max(0) as u64)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.move_due().await {
                        error!(error = %err, "Delayed job monitor poll failed");
                    }
                }
            }
        }
    }
}
