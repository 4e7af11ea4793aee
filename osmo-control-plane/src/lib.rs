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

pub mod agent;
pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod ids;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod progress;
pub mod renderer;
pub mod repo;
pub mod scheduler;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod worker;

#[cfg(test)]
test_r::enable!();
