// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod coordinator;
pub mod serde_utils;

use serde::{Deserialize, Serialize};

use crate::coordinator::{ClusterConfig, CoordinatorConfig, ResultPublisherConfig};

/// Root of the configuration file passed to the `buildfleet` binary.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    /// Names of the shared collections and of this instance.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Dispatch, retry and liveness settings of the queue coordinator.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Settings of the task that forwards finished build jobs to the sink.
    #[serde(default)]
    pub result_publisher: ResultPublisherConfig,
}
