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

use buildfleet_error::{Error, make_input_err};
use serde::{Deserialize, Serialize};

use crate::build_job::{BuildJobId, BuildJobRecord};

pub type AgentTimestamp = u64;

/// Agent names are used as keys in the agent registry and as host names,
/// so they are restricted to lower case letters, digits and dashes.
pub fn validate_agent_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(make_input_err!(
            "Invalid agent name '{name}', must match ^[a-z0-9-]+$"
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Building at least one job.
    Active,
    Idle,
    /// Paused by an administrator, takes no new jobs.
    Paused,
}

/// What an agent tells the coordinator on every heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    /// Defaults to the agent name.
    pub display_name: Option<String>,
    pub member_address: String,
    pub max_concurrent_build_jobs: usize,
    /// Fingerprint of the key the agent uses to fetch repositories, see
    /// `auth_gate::public_key_fingerprint`.
    pub public_key_fingerprint: Option<String>,
}

/// Snapshot of one build agent as replicated through the agent registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique name of the agent, also the registry key.
    pub name: String,

    pub display_name: String,

    /// Address the agent's cluster member is reachable at.
    pub member_address: String,

    pub public_key_fingerprint: Option<String>,

    /// Number of jobs the agent builds in parallel.
    pub max_concurrent_build_jobs: usize,

    /// Jobs currently building, in dispatch order.
    pub running_build_jobs: Vec<BuildJobRecord>,

    /// Finished jobs, most recent first. Bounded, and always replaced as a
    /// whole.
    pub recent_build_jobs: Vec<BuildJobRecord>,

    /// False once the agent missed its heartbeat window.
    pub is_healthy: bool,

    pub is_paused: bool,

    /// Timestamp of the last heartbeat, in seconds since the unix epoch.
    pub last_heartbeat: AgentTimestamp,
}

impl AgentRecord {
    pub fn new(name: &str, heartbeat: AgentHeartbeat, now: AgentTimestamp) -> Self {
        Self {
            name: name.to_string(),
            display_name: heartbeat.display_name.unwrap_or_else(|| name.to_string()),
            member_address: heartbeat.member_address,
            public_key_fingerprint: heartbeat.public_key_fingerprint,
            max_concurrent_build_jobs: heartbeat.max_concurrent_build_jobs,
            running_build_jobs: Vec::new(),
            recent_build_jobs: Vec::new(),
            is_healthy: true,
            is_paused: false,
            last_heartbeat: now,
        }
    }

    /// Applies a heartbeat to an existing record. Running and recent jobs
    /// are owned by the coordinator and left untouched.
    pub(crate) fn apply_heartbeat(&mut self, heartbeat: AgentHeartbeat, now: AgentTimestamp) {
        if let Some(display_name) = heartbeat.display_name {
            self.display_name = display_name;
        }
        self.member_address = heartbeat.member_address;
        if heartbeat.public_key_fingerprint.is_some() {
            self.public_key_fingerprint = heartbeat.public_key_fingerprint;
        }
        // Never below what is already running. The surplus drains as jobs
        // finish and the next heartbeat lowers it.
        self.max_concurrent_build_jobs = heartbeat
            .max_concurrent_build_jobs
            .max(self.running_build_jobs.len());
        self.is_healthy = true;
        self.last_heartbeat = self.last_heartbeat.max(now);
    }

    pub fn number_of_current_build_jobs(&self) -> usize {
        self.running_build_jobs.len()
    }

    pub fn free_slots(&self) -> usize {
        self.max_concurrent_build_jobs
            .saturating_sub(self.number_of_current_build_jobs())
    }

    pub fn can_accept_work(&self) -> bool {
        self.is_healthy && !self.is_paused && self.free_slots() > 0
    }

    pub fn status(&self) -> AgentStatus {
        if self.is_paused {
            AgentStatus::Paused
        } else if self.running_build_jobs.is_empty() {
            AgentStatus::Idle
        } else {
            AgentStatus::Active
        }
    }

    pub fn running_job(&self, job_id: &BuildJobId) -> Option<&BuildJobRecord> {
        self.running_build_jobs.iter().find(|job| job.id == *job_id)
    }

    pub(crate) fn running_job_mut(&mut self, job_id: &BuildJobId) -> Option<&mut BuildJobRecord> {
        self.running_build_jobs
            .iter_mut()
            .find(|job| job.id == *job_id)
    }

    pub(crate) fn take_running_job(&mut self, job_id: &BuildJobId) -> Option<BuildJobRecord> {
        let index = self
            .running_build_jobs
            .iter()
            .position(|job| job.id == *job_id)?;
        Some(self.running_build_jobs.remove(index))
    }

    /// Puts `job` at the front of the recent history and keeps at most
    /// `limit` entries.
    pub(crate) fn push_recent(&mut self, job: BuildJobRecord, limit: usize) {
        let job_id = job.id;
        let mut recent = Vec::with_capacity(limit.min(self.recent_build_jobs.len() + 1));
        recent.push(job);
        recent.extend(
            self.recent_build_jobs
                .iter()
                .filter(|old| old.id != job_id)
                .take(limit.saturating_sub(1))
                .cloned(),
        );
        recent.truncate(limit);
        self.recent_build_jobs = recent;
    }

    /// Dispatch preference: the least utilized agent first, then the one
    /// with fewer running jobs, then by name so every instance agrees.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        // Compare running/max as fractions without floating point.
        let lhs = self.number_of_current_build_jobs() * other.max_concurrent_build_jobs.max(1);
        let rhs = other.number_of_current_build_jobs() * self.max_concurrent_build_jobs.max(1);
        lhs.cmp(&rhs)
            .then_with(|| {
                self.number_of_current_build_jobs()
                    .cmp(&other.number_of_current_build_jobs())
            })
            .then_with(|| self.name.cmp(&other.name))
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::build_job::RepositoryInfo;

    fn agent(name: &str, max: usize, running: usize) -> AgentRecord {
        let mut record = AgentRecord::new(
            name,
            AgentHeartbeat {
                max_concurrent_build_jobs: max,
                ..Default::default()
            },
            0,
        );
        for _ in 0..running {
            record.running_build_jobs.push(job());
        }
        record
    }

    fn job() -> BuildJobRecord {
        BuildJobRecord::new("job", 1, 1, 1, RepositoryInfo::default(), SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn agent_names_are_validated() {
        assert!(validate_agent_name("agent-01").is_ok());
        assert!(validate_agent_name("").is_err());
        assert!(validate_agent_name("Agent").is_err());
        assert!(validate_agent_name("agent_1").is_err());
        assert!(validate_agent_name("agent 1").is_err());
    }

    #[test]
    fn display_name_defaults_to_name() {
        assert_eq!(agent("agent-a", 1, 0).display_name, "agent-a");
    }

    #[test]
    fn capacity_checks() {
        assert!(agent("a", 2, 1).can_accept_work());
        assert!(!agent("a", 2, 2).can_accept_work());
        let mut paused = agent("a", 2, 0);
        paused.is_paused = true;
        assert!(!paused.can_accept_work());
        assert_eq!(paused.status(), AgentStatus::Paused);
        let mut unhealthy = agent("a", 2, 0);
        unhealthy.is_healthy = false;
        assert!(!unhealthy.can_accept_work());
        assert_eq!(agent("a", 2, 1).status(), AgentStatus::Active);
        assert_eq!(agent("a", 2, 0).status(), AgentStatus::Idle);
    }

    #[test]
    fn recent_jobs_are_bounded_and_most_recent_first() {
        let mut record = agent("a", 1, 0);
        let jobs: Vec<_> = (0..5).map(|_| job()).collect();
        for job in &jobs {
            record.push_recent(job.clone(), 3);
        }
        let ids: Vec<_> = record.recent_build_jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![jobs[4].id, jobs[3].id, jobs[2].id]);

        record.push_recent(jobs[3].clone(), 3);
        let ids: Vec<_> = record.recent_build_jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![jobs[3].id, jobs[4].id, jobs[2].id]);
    }

    #[test]
    fn heartbeat_without_fingerprint_keeps_stored_one() {
        let mut record = AgentRecord::new(
            "a",
            AgentHeartbeat {
                max_concurrent_build_jobs: 1,
                public_key_fingerprint: Some("SHA256:aa".to_string()),
                ..Default::default()
            },
            0,
        );
        record.apply_heartbeat(
            AgentHeartbeat {
                max_concurrent_build_jobs: 1,
                ..Default::default()
            },
            1,
        );
        assert_eq!(record.public_key_fingerprint.as_deref(), Some("SHA256:aa"));

        record.apply_heartbeat(
            AgentHeartbeat {
                max_concurrent_build_jobs: 1,
                public_key_fingerprint: Some("SHA256:bb".to_string()),
                ..Default::default()
            },
            2,
        );
        assert_eq!(record.public_key_fingerprint.as_deref(), Some("SHA256:bb"));
    }

    #[test]
    fn dispatch_order_prefers_least_loaded() {
        let mut agents = [agent("c", 4, 2), agent("b", 2, 1), agent("a", 4, 1), agent("d", 1, 0)];
        agents.sort_by(AgentRecord::dispatch_order);
        let names: Vec<_> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["d", "a", "b", "c"]);
    }
}
