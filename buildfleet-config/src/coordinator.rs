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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_duration_with_shellexpand, convert_numeric_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Retry configuration. This configuration is exponential and each iteration
/// a jitter as a percentage is applied of the calculated delay. For example:
/// ```haskell
/// Retry{
///   max_retries: 7,
///   delay: 0.1,
///   jitter: 0.5,
/// }
/// ```
/// will result in:
/// Attempt - Delay
/// 1         0ms
/// 2         75ms - 125ms
/// 3         150ms - 250ms
/// 4         300ms - 500ms
/// ...
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default)]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form. This will
    /// change the formula like:
    /// ```haskell
    /// random(
    ///    (2 ^ {attempt_number}) * {delay} * (1 - (jitter / 2)),
    ///    (2 ^ {attempt_number}) * {delay} * (1 + (jitter / 2)),
    /// )
    /// ```
    #[serde(default)]
    pub jitter: f32,
}

/// Names of the cluster-wide collections the coordinators share. Every
/// instance in one fleet must use the same names.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Name of this instance, used in logs only.
    /// Default: "buildfleet"
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub instance_name: String,

    /// Default: "buildJobQueue"
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub queue_map_name: String,

    /// Default: "buildAgentInformation"
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub agent_map_name: String,

    /// Default: "cancelledBuildJobs"
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub cancelled_set_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// A build job whose agent disappears is put back into the queue. Once it
    /// has been re-queued this many times it is terminated as errored
    /// instead, so a job that crashes every agent it lands on cannot cycle
    /// through the fleet forever.
    /// Default: 5
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_job_retries: u32,

    /// Mark an agent unhealthy once it has not sent a heartbeat for this
    /// amount of time in seconds. Unhealthy agents take no new work.
    /// Default: 30 (seconds)
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub agent_heartbeat_timeout_s: u64,

    /// Additional time in seconds after the heartbeat timeout before an
    /// unhealthy agent is declared missing, its running jobs are re-queued
    /// and its record is removed.
    /// Default: 60 (seconds)
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub agent_missing_grace_period_s: u64,

    /// Size of the per-agent history of finished build jobs.
    /// Default: 20
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub recent_build_jobs_limit: usize,

    /// How often, in milliseconds, the dispatch loop runs even when no
    /// collection change woke it up.
    /// Default: 10000 (milliseconds)
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub dispatch_interval_ms: u64,

    /// Maximum time in milliseconds to wait for an agent's lock. An agent
    /// whose lock cannot be taken in time is skipped for the current
    /// dispatch round.
    /// Default: 1000 (milliseconds)
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub agent_lock_timeout_ms: u64,

    /// Retry policy for collection operations that fail because the cluster
    /// is unavailable.
    /// Default: `{ max_retries: 5, delay: 0.1, jitter: 0.5 }`
    #[serde(default)]
    pub cluster_retry: Option<Retry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResultPublisherConfig {
    /// Number of results that may wait for the sink before the coordinator
    /// hands results over on an overflow task instead.
    /// Default: 1024
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub channel_capacity: usize,

    /// Retry policy for publishing a result to the sink.
    /// Default: `{ max_retries: 10, delay: 0.5, jitter: 0.5 }`
    #[serde(default)]
    pub sink_retry: Option<Retry>,
}
