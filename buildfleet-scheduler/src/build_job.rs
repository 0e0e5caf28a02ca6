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

use core::cmp::Ordering;
use core::fmt;
use core::time::Duration;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority given to build jobs that do not ask for anything else. Lower
/// values are dispatched first.
pub const DEFAULT_BUILD_JOB_PRIORITY: u32 = 2;

/// Unique identifier of a build job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildJobId(pub Uuid);

impl BuildJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BuildJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepositoryType {
    #[default]
    User,
    Template,
    Solution,
    Tests,
    Auxiliary,
}

/// Where the agent checks out the sources it builds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub repository_name: String,
    pub repository_type: RepositoryType,
    /// Which repository received the push that triggered this build.
    pub triggered_by_push_to: RepositoryType,
    pub assignment_repository_uri: String,
    pub test_repository_uri: String,
    pub solution_repository_uri: Option<String>,
    pub auxiliary_repository_uris: Vec<String>,
    pub auxiliary_repository_checkout_directories: Vec<String>,
}

/// Timestamps of a build job. Each is set exactly once, by the transition
/// that introduces it, and they never go backwards:
/// submission <= build start <= build completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimingInfo {
    pub submission_date: SystemTime,
    pub build_start_date: Option<SystemTime>,
    pub build_completion_date: Option<SystemTime>,
    /// Expected duration of the build, used to estimate completion when the
    /// job starts. Zero when unknown.
    pub estimated_duration: Duration,
    pub estimated_completion_date: Option<SystemTime>,
}

impl JobTimingInfo {
    pub const fn new(submission_date: SystemTime) -> Self {
        Self {
            submission_date,
            build_start_date: None,
            build_completion_date: None,
            estimated_duration: Duration::ZERO,
            estimated_completion_date: None,
        }
    }
}

/// Terminal outcome of a build job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    /// The build ran and all its steps passed.
    Successful,
    /// The build ran and reported failures.
    Failed,
    /// The build could not be completed, see `FailureReason`.
    Errored,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The agent running the job disappeared too many times.
    AgentLost,
    /// The agent reported an error before the build produced a result.
    BuildError,
}

/// Lifecycle state, derived from the record's fields rather than stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildJobState {
    Queued,
    Building,
    Finished,
    Errored,
    Cancelled,
}

impl BuildJobState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Cancelled)
    }
}

/// One build of one participation's submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJobRecord {
    pub id: BuildJobId,
    /// Human readable name, shown in status views.
    pub name: String,
    pub participation_id: u64,
    pub course_id: u64,
    pub exercise_id: u64,
    /// Set when the result has been stored.
    pub result_id: Option<u64>,
    /// Lower values are dispatched first.
    pub priority: u32,
    /// Number of times the job went back to the queue because its agent was
    /// lost.
    pub retry_count: u32,
    pub repository_info: RepositoryInfo,
    pub timing: JobTimingInfo,
    /// Agent the job is, or was last, assigned to.
    pub agent_name: Option<String>,
    /// A user asked to cancel the job while it was building. The agent is
    /// expected to stop and report it as cancelled.
    pub cancel_requested: bool,
    pub status: Option<BuildStatus>,
    pub failure_reason: Option<FailureReason>,
}

impl BuildJobRecord {
    pub fn new(
        name: impl Into<String>,
        participation_id: u64,
        course_id: u64,
        exercise_id: u64,
        repository_info: RepositoryInfo,
        submission_date: SystemTime,
    ) -> Self {
        Self {
            id: BuildJobId::new(),
            name: name.into(),
            participation_id,
            course_id,
            exercise_id,
            result_id: None,
            priority: DEFAULT_BUILD_JOB_PRIORITY,
            retry_count: 0,
            repository_info,
            timing: JobTimingInfo::new(submission_date),
            agent_name: None,
            cancel_requested: false,
            status: None,
            failure_reason: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_estimated_duration(mut self, estimated_duration: Duration) -> Self {
        self.timing.estimated_duration = estimated_duration;
        self
    }

    pub const fn state(&self) -> BuildJobState {
        match self.status {
            Some(BuildStatus::Successful | BuildStatus::Failed) => BuildJobState::Finished,
            Some(BuildStatus::Errored) => BuildJobState::Errored,
            Some(BuildStatus::Cancelled) => BuildJobState::Cancelled,
            None if self.timing.build_start_date.is_some() => BuildJobState::Building,
            None => BuildJobState::Queued,
        }
    }

    /// Order in which queued jobs are offered to agents: priority, then
    /// submission date, then id so the order is total.
    pub fn queue_order(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.timing.submission_date.cmp(&other.timing.submission_date))
            .then_with(|| self.id.cmp(&other.id))
    }

    pub(crate) fn mark_started(&mut self, agent_name: &str, now: SystemTime) {
        let start = now.max(self.timing.submission_date);
        self.timing.build_start_date = Some(start);
        self.timing.estimated_completion_date = (!self.timing.estimated_duration.is_zero())
            .then(|| start + self.timing.estimated_duration);
        self.agent_name = Some(agent_name.to_string());
    }

    /// Reverts `mark_started` without counting a retry.
    pub(crate) fn unmark_started(&mut self) {
        self.timing.build_start_date = None;
        self.timing.estimated_completion_date = None;
        self.agent_name = None;
    }

    pub(crate) fn requeue_after_agent_loss(&mut self) {
        self.unmark_started();
        self.retry_count += 1;
    }

    pub(crate) fn mark_finished(
        &mut self,
        status: BuildStatus,
        failure_reason: Option<FailureReason>,
        now: SystemTime,
    ) {
        let floor = self
            .timing
            .build_start_date
            .unwrap_or(self.timing.submission_date);
        self.timing.build_completion_date = Some(now.max(floor));
        self.status = Some(status);
        self.failure_reason = failure_reason;
    }
}

/// What an agent reports for a finished build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub result_id: Option<u64>,
}

/// A finished build job together with what the agent reported about it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultQueueItem {
    pub result: BuildResult,
    pub job: BuildJobRecord,
    pub build_logs: Vec<String>,
    pub exception: Option<String>,
}

impl ResultQueueItem {
    /// Item for a job the coordinator terminated itself, for example because
    /// it was cancelled while queued or its agents kept disappearing.
    pub(crate) fn terminated(job: BuildJobRecord, exception: Option<String>) -> Self {
        Self {
            result: BuildResult {
                status: job.status.unwrap_or(BuildStatus::Errored),
                result_id: job.result_id,
            },
            job,
            build_logs: Vec::new(),
            exception,
        }
    }
}
