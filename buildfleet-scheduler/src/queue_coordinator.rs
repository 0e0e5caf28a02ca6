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

use core::future::Future;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

use buildfleet_config::coordinator::{ClusterConfig, CoordinatorConfig, Retry};
use buildfleet_error::{Code, Error, ResultExt, error_if, make_err};
use buildfleet_store::memory_cluster::MemoryCluster;
use buildfleet_util::collection_trait::{
    ChangeListener, DistributedMap, DistributedSet, KeyLockGuard, ListenerId,
};
use buildfleet_util::instant_wrapper::InstantWrapper;
use buildfleet_util::retry::Retrier;
use buildfleet_util::spawn;
use buildfleet_util::task::JoinHandleDropGuard;
use tokio::sync::Notify;
use tracing::{Level, event};

use crate::agent::{AgentHeartbeat, AgentRecord, validate_agent_name};
use crate::build_job::{
    BuildJobId, BuildJobRecord, BuildJobState, BuildStatus, FailureReason, ResultQueueItem,
};
use crate::result_publisher::ResultPublisher;

/// Default times a job is re-queued after losing its agent before it is
/// terminated as errored.
pub const DEFAULT_MAX_JOB_RETRIES: u32 = 5;

/// Default seconds without heartbeat before an agent is marked unhealthy.
pub const DEFAULT_AGENT_HEARTBEAT_TIMEOUT_S: u64 = 30;

/// Default seconds an unhealthy agent is kept before it is declared missing.
pub const DEFAULT_AGENT_MISSING_GRACE_PERIOD_S: u64 = 60;

pub const DEFAULT_RECENT_BUILD_JOBS_LIMIT: usize = 20;

pub const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 10_000;

pub const DEFAULT_AGENT_LOCK_TIMEOUT_MS: u64 = 1_000;

pub const DEFAULT_CLUSTER_RETRY: Retry = Retry {
    max_retries: 5,
    delay: 0.1,
    jitter: 0.5,
};

pub const DEFAULT_INSTANCE_NAME: &str = "buildfleet";
pub const DEFAULT_QUEUE_MAP_NAME: &str = "buildJobQueue";
pub const DEFAULT_AGENT_MAP_NAME: &str = "buildAgentInformation";
pub const DEFAULT_CANCELLED_SET_NAME: &str = "cancelledBuildJobs";

/// Queued build jobs, keyed by job id.
pub type PendingJobs = Arc<dyn DistributedMap<BuildJobId, BuildJobRecord>>;

/// Build agents, keyed by agent name.
pub type AgentRegistry = Arc<dyn DistributedMap<String, AgentRecord>>;

/// Ids of building jobs whose cancellation was requested. Agents watch it.
pub type CancelledJobs = Arc<dyn DistributedSet<BuildJobId>>;

fn name_or_default<'a>(configured: &'a str, default: &'a str) -> &'a str {
    if configured.is_empty() {
        default
    } else {
        configured
    }
}

/// The cluster-wide collections one fleet of coordinators shares.
#[derive(Clone)]
pub struct FleetCollections {
    pub pending: PendingJobs,
    pub agents: AgentRegistry,
    pub cancelled: CancelledJobs,
}

impl core::fmt::Debug for FleetCollections {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FleetCollections").finish_non_exhaustive()
    }
}

impl FleetCollections {
    pub fn from_memory_cluster(cluster: &MemoryCluster, config: &ClusterConfig) -> Result<Self, Error> {
        Ok(Self {
            pending: cluster
                .map::<BuildJobId, BuildJobRecord>(name_or_default(
                    &config.queue_map_name,
                    DEFAULT_QUEUE_MAP_NAME,
                ))
                .err_tip(|| "Creating pending build job map")?,
            agents: cluster
                .map::<String, AgentRecord>(name_or_default(
                    &config.agent_map_name,
                    DEFAULT_AGENT_MAP_NAME,
                ))
                .err_tip(|| "Creating build agent map")?,
            cancelled: cluster
                .set::<BuildJobId>(name_or_default(
                    &config.cancelled_set_name,
                    DEFAULT_CANCELLED_SET_NAME,
                ))
                .err_tip(|| "Creating cancelled build job set")?,
        })
    }
}

/// Result of trying to place one job on one agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchAttempt {
    Dispatched,
    /// The agent was locked by someone else, is gone or is full by now.
    LostRace,
    /// Another instance already took the job off the queue.
    JobGone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and has been removed.
    Dequeued,
    /// The job is building. Its agent has been asked to stop.
    CancelRequested,
    /// The job already finished, nothing to cancel.
    AlreadyFinished,
}

/// Listener registrations made by `subscribe_changes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeSubscription {
    pending: ListenerId,
    agents: ListenerId,
}

#[derive(Debug, Default)]
struct Metrics {
    jobs_enqueued: AtomicU64,
    jobs_dispatched: AtomicU64,
    dispatch_races_lost: AtomicU64,
    results_processed: AtomicU64,
    jobs_requeued: AtomicU64,
    jobs_errored: AtomicU64,
    jobs_cancelled: AtomicU64,
    agents_removed: AtomicU64,
}

/// Counters of what this instance did since it started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    pub jobs_enqueued: u64,
    pub jobs_dispatched: u64,
    pub dispatch_races_lost: u64,
    pub results_processed: u64,
    pub jobs_requeued: u64,
    pub jobs_errored: u64,
    pub jobs_cancelled: u64,
    pub agents_removed: u64,
}

struct CoordinatorInner {
    instance_name: String,
    collections: FleetCollections,
    publisher: Arc<ResultPublisher>,
    clock: Arc<dyn InstantWrapper>,
    retrier: Retrier,
    max_job_retries: u32,
    agent_heartbeat_timeout_s: u64,
    agent_missing_grace_period_s: u64,
    recent_build_jobs_limit: usize,
    dispatch_interval: Duration,
    agent_lock_timeout: Duration,
    change_notify: Arc<Notify>,
    change_subscription: ChangeSubscription,
    metrics: Metrics,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        // Best effort, the cluster may already be gone.
        let _ = self
            .collections
            .pending
            .remove_listener(self.change_subscription.pending);
        let _ = self
            .collections
            .agents
            .remove_listener(self.change_subscription.agents);
    }
}

impl CoordinatorInner {
    /// Runs a collection operation, retrying while the cluster is
    /// unavailable.
    async fn cluster_op<T, F, Fut>(&self, op: F) -> Result<T, Error>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Error>> + Send,
        T: Send,
    {
        self.retrier.retry_transient(op).await
    }

    /// Takes the agent's lock, retrying lock timeouts as well. Used where
    /// giving up is not an option, unlike dispatch.
    async fn lock_agent(&self, key: &String) -> Result<KeyLockGuard, Error> {
        self.cluster_op(|| self.collections.agents.lock(key, self.agent_lock_timeout))
            .await
            .err_tip(|| format!("Locking build agent {key}"))
    }

    fn now(&self) -> std::time::SystemTime {
        self.clock.now()
    }

    async fn dispatch_to(
        &self,
        job_id: BuildJobId,
        agent_name: &str,
    ) -> Result<DispatchAttempt, Error> {
        let key = agent_name.to_string();
        // Unavailable is retried, a lock timeout is not.
        let agents = &self.collections.agents;
        let key_ref = &key;
        let lock_timeout = self.agent_lock_timeout;
        let maybe_guard = self
            .cluster_op(move || async move {
                match agents.lock(key_ref, lock_timeout).await {
                    Ok(guard) => Ok(Some(guard)),
                    Err(e) if e.code == Code::DeadlineExceeded => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .err_tip(|| format!("Locking build agent {agent_name} for dispatch"))?;
        let Some(guard) = maybe_guard else {
            event!(
                Level::DEBUG,
                agent_name,
                "Build agent is locked elsewhere, trying the next one"
            );
            return Ok(DispatchAttempt::LostRace);
        };

        // The snapshot used to pick this agent may be stale.
        let Some(mut agent) = self
            .cluster_op(|| self.collections.agents.get(&key))
            .await?
        else {
            return Ok(DispatchAttempt::LostRace);
        };
        if !agent.can_accept_work() {
            return Ok(DispatchAttempt::LostRace);
        }

        // Removal from the queue decides which instance gets the job.
        let Some(mut job) = self
            .cluster_op(|| self.collections.pending.remove(&job_id))
            .await?
        else {
            return Ok(DispatchAttempt::JobGone);
        };

        job.mark_started(agent_name, self.now());
        agent.running_build_jobs.push(job.clone());
        if let Err(err) = self
            .cluster_op(|| self.collections.agents.put(key.clone(), agent.clone()))
            .await
        {
            self.requeue_after_failed_dispatch(job, &key).await;
            return Err(err).err_tip(|| format!("Assigning build job {job_id} to {agent_name}"));
        }
        guard.unlock();

        self.metrics.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::INFO,
            %job_id,
            agent_name,
            running = agent.number_of_current_build_jobs(),
            max = agent.max_concurrent_build_jobs,
            "Dispatched build job"
        );
        Ok(DispatchAttempt::Dispatched)
    }

    /// Called with the agent still locked after its record could not be
    /// written. Puts the job back so it is not lost.
    async fn requeue_after_failed_dispatch(&self, mut job: BuildJobRecord, key: &String) {
        // The write may have been applied even though it reported an error.
        if let Ok(Some(agent)) = self.cluster_op(|| self.collections.agents.get(key)).await {
            if agent.running_job(&job.id).is_some() {
                return;
            }
        }
        job.unmark_started();
        let job_id = job.id;
        match self
            .cluster_op(|| self.collections.pending.put(job_id, job.clone()))
            .await
        {
            Ok(_) => event!(
                Level::WARN,
                %job_id,
                agent_name = %key,
                "Could not assign build job, put it back into the queue"
            ),
            Err(e) => event!(
                Level::ERROR,
                %job_id,
                agent_name = %key,
                ?e,
                "Could not assign build job nor put it back into the queue, job lost"
            ),
        }
    }

    /// Removes the agent and deals with its running jobs, but only if
    /// `still_missing` holds for the record read under the lock.
    async fn evict_agent<P>(&self, agent_name: &str, still_missing: P) -> Result<bool, Error>
    where
        P: Fn(&AgentRecord) -> bool + Send,
    {
        let key = agent_name.to_string();
        let guard = self.lock_agent(&key).await?;
        let Some(agent) = self
            .cluster_op(|| self.collections.agents.get(&key))
            .await?
        else {
            return Ok(false);
        };
        if !still_missing(&agent) {
            return Ok(false);
        }

        let now = self.now();
        for mut job in agent.running_build_jobs {
            let job_id = job.id;
            if job.cancel_requested {
                job.mark_finished(BuildStatus::Cancelled, None, now);
                self.metrics.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
                self.forget_cancellation(job_id).await;
                self.publisher
                    .handoff(ResultQueueItem::terminated(job, None));
            } else if job.retry_count >= self.max_job_retries {
                job.mark_finished(BuildStatus::Errored, Some(FailureReason::AgentLost), now);
                self.metrics.jobs_errored.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::WARN,
                    %job_id,
                    agent_name,
                    retry_count = job.retry_count,
                    "Build job lost its agent too often, giving up"
                );
                let exception = format!(
                    "Build agent {agent_name} disappeared, job was already retried {} times",
                    job.retry_count
                );
                self.publisher
                    .handoff(ResultQueueItem::terminated(job, Some(exception)));
            } else {
                job.requeue_after_agent_loss();
                self.cluster_op(|| self.collections.pending.put(job_id, job.clone()))
                    .await
                    .err_tip(|| format!("Re-queueing build job {job_id} of lost agent"))?;
                self.metrics.jobs_requeued.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::INFO,
                    %job_id,
                    agent_name,
                    retry_count = job.retry_count,
                    "Re-queued build job of lost agent"
                );
            }
        }

        self.cluster_op(|| self.collections.agents.remove(&key))
            .await
            .err_tip(|| format!("Removing build agent {agent_name}"))?;
        guard.unlock();
        self.metrics.agents_removed.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn forget_cancellation(&self, job_id: BuildJobId) {
        if let Err(e) = self
            .cluster_op(|| self.collections.cancelled.remove(&job_id))
            .await
        {
            event!(
                Level::WARN,
                %job_id,
                ?e,
                "Could not clear cancellation request of finished build job"
            );
        }
    }
}

/// Owns admission, dispatch, completion and failure handling of build jobs.
///
/// Any number of coordinators, typically one per server instance, may run
/// against the same `FleetCollections`. They never talk to each other; a job
/// is built exactly once because it is only ever assigned by the instance
/// whose `remove` took it off the pending map, and an agent's record is only
/// modified while holding the agent's cluster lock.
#[derive(Clone)]
pub struct QueueCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl core::fmt::Debug for QueueCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueCoordinator")
            .field("instance_name", &self.inner.instance_name)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl QueueCoordinator {
    pub fn new(
        config: &CoordinatorConfig,
        instance_name: &str,
        collections: FleetCollections,
        publisher: Arc<ResultPublisher>,
        clock: Arc<dyn InstantWrapper>,
    ) -> Result<Self, Error> {
        let retry = config
            .cluster_retry
            .clone()
            .unwrap_or(DEFAULT_CLUSTER_RETRY);
        Self::new_with_retrier(
            config,
            instance_name,
            collections,
            publisher,
            clock,
            Retrier::with_tokio_sleep(retry),
        )
    }

    pub fn new_with_retrier(
        config: &CoordinatorConfig,
        instance_name: &str,
        collections: FleetCollections,
        publisher: Arc<ResultPublisher>,
        clock: Arc<dyn InstantWrapper>,
        retrier: Retrier,
    ) -> Result<Self, Error> {
        let mut max_job_retries = config.max_job_retries;
        if max_job_retries == 0 {
            max_job_retries = DEFAULT_MAX_JOB_RETRIES;
        }

        let mut agent_heartbeat_timeout_s = config.agent_heartbeat_timeout_s;
        if agent_heartbeat_timeout_s == 0 {
            agent_heartbeat_timeout_s = DEFAULT_AGENT_HEARTBEAT_TIMEOUT_S;
        }

        let mut agent_missing_grace_period_s = config.agent_missing_grace_period_s;
        if agent_missing_grace_period_s == 0 {
            agent_missing_grace_period_s = DEFAULT_AGENT_MISSING_GRACE_PERIOD_S;
        }

        let mut recent_build_jobs_limit = config.recent_build_jobs_limit;
        if recent_build_jobs_limit == 0 {
            recent_build_jobs_limit = DEFAULT_RECENT_BUILD_JOBS_LIMIT;
        }

        let mut dispatch_interval_ms = config.dispatch_interval_ms;
        if dispatch_interval_ms == 0 {
            dispatch_interval_ms = DEFAULT_DISPATCH_INTERVAL_MS;
        }

        let mut agent_lock_timeout_ms = config.agent_lock_timeout_ms;
        if agent_lock_timeout_ms == 0 {
            agent_lock_timeout_ms = DEFAULT_AGENT_LOCK_TIMEOUT_MS;
        }

        let change_notify = Arc::new(Notify::new());
        let listener: ChangeListener = {
            let change_notify = change_notify.clone();
            Arc::new(move || change_notify.notify_one())
        };
        let change_subscription = ChangeSubscription {
            pending: collections
                .pending
                .add_listener(listener.clone())
                .err_tip(|| "Subscribing to pending build jobs")?,
            agents: collections
                .agents
                .add_listener(listener)
                .err_tip(|| "Subscribing to build agents")?,
        };

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                instance_name: name_or_default(instance_name, DEFAULT_INSTANCE_NAME).to_string(),
                collections,
                publisher,
                clock,
                retrier,
                max_job_retries,
                agent_heartbeat_timeout_s,
                agent_missing_grace_period_s,
                recent_build_jobs_limit,
                dispatch_interval: Duration::from_millis(dispatch_interval_ms),
                agent_lock_timeout: Duration::from_millis(agent_lock_timeout_ms),
                change_notify,
                change_subscription,
                metrics: Metrics::default(),
            }),
        })
    }

    /// Starts the background task that dispatches whenever a shared
    /// collection changes, and at least every `dispatch_interval_ms`. The
    /// task also runs the agent liveness check. It stops when the returned
    /// guard or the last handle to this coordinator is dropped.
    pub fn spawn_dispatch_loop(&self) -> JoinHandleDropGuard<()> {
        let weak_inner = Arc::downgrade(&self.inner);
        let change_notify = self.inner.change_notify.clone();
        let dispatch_interval = self.inner.dispatch_interval;
        let instance_name = self.inner.instance_name.clone();
        spawn!(
            "queue_coordinator_dispatch_loop",
            async move {
                let mut ticker = tokio::time::interval(dispatch_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Break out of the loop only when the coordinator is dropped.
                loop {
                    tokio::select! {
                        () = change_notify.notified() => {}
                        _ = ticker.tick() => {}
                    }
                    let Some(inner) = weak_inner.upgrade() else {
                        return;
                    };
                    let coordinator = Self { inner };
                    if let Err(e) = coordinator.check_agent_liveness().await {
                        event!(Level::WARN, ?e, "Build agent liveness check failed");
                    }
                    if let Err(e) = coordinator.try_dispatch().await {
                        event!(
                            Level::WARN,
                            ?e,
                            "Dispatch round failed, retrying on the next change or tick"
                        );
                    }
                }
            },
            instance_name = %instance_name
        )
    }

    /// Admits a build job into the queue. It is picked up by whichever
    /// instance dispatches next.
    pub async fn enqueue(&self, job: BuildJobRecord) -> Result<BuildJobId, Error> {
        let inner = &self.inner;
        error_if!(
            job.state() != BuildJobState::Queued,
            "Build job {} must be queued to be enqueued, it is {:?}",
            job.id,
            job.state()
        );
        let job_id = job.id;
        inner
            .cluster_op(|| inner.collections.pending.put(job_id, job.clone()))
            .await
            .err_tip(|| "In QueueCoordinator::enqueue")?;
        inner.metrics.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::DEBUG,
            %job_id,
            participation_id = job.participation_id,
            priority = job.priority,
            "Enqueued build job"
        );
        Ok(job_id)
    }

    /// Offers queued jobs, best first, to agents with free capacity, least
    /// loaded first. Safe to run concurrently on any number of instances.
    /// Returns how many jobs this call dispatched.
    pub async fn try_dispatch(&self) -> Result<usize, Error> {
        let inner = &self.inner;
        let mut queued = inner
            .cluster_op(|| inner.collections.pending.values())
            .await
            .err_tip(|| "In QueueCoordinator::try_dispatch")?;
        if queued.is_empty() {
            return Ok(0);
        }
        queued.sort_by(BuildJobRecord::queue_order);

        let mut dispatched = 0;
        for job in &queued {
            let mut candidates: Vec<AgentRecord> = inner
                .cluster_op(|| inner.collections.agents.values())
                .await
                .err_tip(|| "In QueueCoordinator::try_dispatch")?
                .into_iter()
                .filter(AgentRecord::can_accept_work)
                .collect();
            if candidates.is_empty() {
                event!(Level::TRACE, "No build agent has free capacity");
                break;
            }
            candidates.sort_by(AgentRecord::dispatch_order);

            for candidate in &candidates {
                match inner.dispatch_to(job.id, &candidate.name).await? {
                    DispatchAttempt::Dispatched => {
                        dispatched += 1;
                        break;
                    }
                    DispatchAttempt::JobGone => break,
                    DispatchAttempt::LostRace => {
                        inner
                            .metrics
                            .dispatch_races_lost
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(dispatched)
    }

    /// Records the outcome an agent reported, moves the job into the agent's
    /// recent history and hands it to the result publisher. Reporting the
    /// same result again leaves the records unchanged and only publishes
    /// the recorded result once more.
    pub async fn on_result(&self, item: ResultQueueItem) -> Result<(), Error> {
        let inner = &self.inner;
        let job_id = item.job.id;
        let agent_name = item.job.agent_name.clone().err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!("Result for build job {job_id} names no agent"),
            )
        })?;

        let guard = inner
            .lock_agent(&agent_name)
            .await
            .err_tip(|| "In QueueCoordinator::on_result")?;
        let Some(mut agent) = inner
            .cluster_op(|| inner.collections.agents.get(&agent_name))
            .await?
        else {
            event!(
                Level::WARN,
                %job_id,
                agent_name = %agent_name,
                "Ignoring result from unknown build agent"
            );
            return Ok(());
        };
        let Some(mut job) = agent.take_running_job(&job_id) else {
            guard.unlock();
            // An earlier report may have been recorded although recording it
            // failed, in which case it was never published. The sink drops
            // duplicates by job id.
            let Some(finished) = agent
                .recent_build_jobs
                .into_iter()
                .find(|job| job.id == job_id)
            else {
                event!(
                    Level::DEBUG,
                    %job_id,
                    agent_name = %agent_name,
                    "Ignoring result of a build job that is not running"
                );
                return Ok(());
            };
            event!(
                Level::DEBUG,
                %job_id,
                agent_name = %agent_name,
                "Build job already finished, publishing its result again"
            );
            if finished.cancel_requested {
                inner.forget_cancellation(job_id).await;
            }
            inner
                .publisher
                .handoff(ResultQueueItem { job: finished, ..item });
            return Ok(());
        };

        let failure_reason =
            (item.result.status == BuildStatus::Errored).then_some(FailureReason::BuildError);
        job.result_id = item.result.result_id;
        job.mark_finished(item.result.status, failure_reason, inner.now());
        agent.push_recent(job.clone(), inner.recent_build_jobs_limit);
        inner
            .cluster_op(|| inner.collections.agents.put(agent_name.clone(), agent.clone()))
            .await
            .err_tip(|| format!("Recording result of build job {job_id}"))?;
        guard.unlock();

        if job.cancel_requested {
            inner.forget_cancellation(job_id).await;
        }
        inner
            .metrics
            .results_processed
            .fetch_add(1, Ordering::Relaxed);
        event!(
            Level::INFO,
            %job_id,
            agent_name = %agent_name,
            status = ?item.result.status,
            "Build job finished"
        );
        inner.publisher.handoff(ResultQueueItem { job, ..item });
        Ok(())
    }

    /// Handles an agent that left the cluster: its running jobs go back to
    /// the queue, or are terminated as errored once they used up their
    /// retries, and the agent's record is removed. Idempotent.
    pub async fn on_agent_missing(&self, agent_name: &str) -> Result<(), Error> {
        let removed = self
            .inner
            .evict_agent(agent_name, |_| true)
            .await
            .err_tip(|| "In QueueCoordinator::on_agent_missing")?;
        if removed {
            event!(Level::WARN, agent_name, "Removed missing build agent");
        }
        Ok(())
    }

    /// Registers the agent on its first heartbeat and refreshes it on every
    /// later one.
    pub async fn heartbeat(&self, agent_name: &str, heartbeat: AgentHeartbeat) -> Result<(), Error> {
        let inner = &self.inner;
        validate_agent_name(agent_name)?;
        error_if!(
            heartbeat.max_concurrent_build_jobs == 0,
            "Build agent {agent_name} must accept at least one build job"
        );

        let key = agent_name.to_string();
        let guard = inner
            .lock_agent(&key)
            .await
            .err_tip(|| "In QueueCoordinator::heartbeat")?;
        let now = inner.clock.unix_timestamp();
        let record = match inner
            .cluster_op(|| inner.collections.agents.get(&key))
            .await?
        {
            Some(mut record) => {
                if !record.is_healthy {
                    event!(Level::INFO, agent_name, "Build agent is healthy again");
                }
                record.apply_heartbeat(heartbeat, now);
                record
            }
            None => {
                event!(
                    Level::INFO,
                    agent_name,
                    max_concurrent_build_jobs = heartbeat.max_concurrent_build_jobs,
                    "Registered build agent"
                );
                AgentRecord::new(agent_name, heartbeat, now)
            }
        };
        inner
            .cluster_op(|| inner.collections.agents.put(key.clone(), record.clone()))
            .await
            .err_tip(|| "In QueueCoordinator::heartbeat")?;
        guard.unlock();
        Ok(())
    }

    /// Marks agents that stopped sending heartbeats as unhealthy, and
    /// removes those silent for longer than the grace period as well.
    /// Returns the number of removed agents.
    pub async fn check_agent_liveness(&self) -> Result<usize, Error> {
        let inner = &self.inner;
        let now = inner.clock.unix_timestamp();
        let timeout = inner.agent_heartbeat_timeout_s;
        let missing_after = timeout.saturating_add(inner.agent_missing_grace_period_s);
        let agents = inner
            .cluster_op(|| inner.collections.agents.values())
            .await
            .err_tip(|| "In QueueCoordinator::check_agent_liveness")?;

        let mut removed = 0;
        for agent in agents {
            let silent_for = now.saturating_sub(agent.last_heartbeat);
            if silent_for > missing_after {
                event!(
                    Level::WARN,
                    agent_name = %agent.name,
                    silent_for,
                    "Build agent missed its heartbeats past the grace period"
                );
                let is_still_missing =
                    |record: &AgentRecord| now.saturating_sub(record.last_heartbeat) > missing_after;
                if inner.evict_agent(&agent.name, is_still_missing).await? {
                    removed += 1;
                }
            } else if silent_for > timeout && agent.is_healthy {
                self.mark_unhealthy(&agent.name, now).await?;
            }
        }
        Ok(removed)
    }

    async fn mark_unhealthy(&self, agent_name: &str, now: u64) -> Result<(), Error> {
        let inner = &self.inner;
        let key = agent_name.to_string();
        let guard = inner.lock_agent(&key).await?;
        let Some(mut agent) = inner
            .cluster_op(|| inner.collections.agents.get(&key))
            .await?
        else {
            return Ok(());
        };
        // A heartbeat may have arrived since the snapshot was taken.
        if now.saturating_sub(agent.last_heartbeat) <= inner.agent_heartbeat_timeout_s {
            return Ok(());
        }
        agent.is_healthy = false;
        inner
            .cluster_op(|| inner.collections.agents.put(key.clone(), agent.clone()))
            .await?;
        guard.unlock();
        event!(
            Level::WARN,
            agent_name,
            last_heartbeat = agent.last_heartbeat,
            "Build agent missed its heartbeat, marked unhealthy"
        );
        Ok(())
    }

    /// Cancels a queued job outright. For a building job the agent is asked
    /// to stop, through the job's `cancel_requested` flag and the cancelled
    /// jobs set; the job ends when the agent reports it.
    pub async fn cancel(&self, job_id: BuildJobId) -> Result<CancelOutcome, Error> {
        let inner = &self.inner;
        if self.cancel_queued(job_id).await? {
            return Ok(CancelOutcome::Dequeued);
        }

        let agents = inner
            .cluster_op(|| inner.collections.agents.values())
            .await
            .err_tip(|| "In QueueCoordinator::cancel")?;
        let holder = agents.iter().find(|agent| {
            agent.running_job(&job_id).is_some()
                || agent.recent_build_jobs.iter().any(|job| job.id == job_id)
        });
        if let Some(agent) = holder {
            if let Some(outcome) = self.cancel_on_agent(&agent.name, job_id).await? {
                return Ok(outcome);
            }
        }

        // The job may be moving from the queue to an agent. Dispatch holds
        // the agent's lock from taking the job off the queue until the agent
        // record is written, so every agent is checked under its lock.
        let mut names: Vec<String> = inner
            .cluster_op(|| inner.collections.agents.key_set())
            .await
            .err_tip(|| "In QueueCoordinator::cancel")?
            .into_iter()
            .collect();
        names.sort();
        for name in &names {
            if let Some(outcome) = self.cancel_on_agent(name, job_id).await? {
                return Ok(outcome);
            }
        }
        // A dispatch that failed to write the agent record re-queues the job.
        if self.cancel_queued(job_id).await? {
            return Ok(CancelOutcome::Dequeued);
        }
        Err(make_err!(
            Code::NotFound,
            "Build job {job_id} is neither queued nor building"
        ))
    }

    async fn cancel_queued(&self, job_id: BuildJobId) -> Result<bool, Error> {
        let inner = &self.inner;
        let Some(mut job) = inner
            .cluster_op(|| inner.collections.pending.remove(&job_id))
            .await
            .err_tip(|| "In QueueCoordinator::cancel")?
        else {
            return Ok(false);
        };
        job.mark_finished(BuildStatus::Cancelled, None, inner.now());
        inner.metrics.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        event!(Level::INFO, %job_id, "Cancelled queued build job");
        inner
            .publisher
            .handoff(ResultQueueItem::terminated(job, None));
        Ok(true)
    }

    /// Looks for the job on one agent while holding the agent's lock.
    async fn cancel_on_agent(
        &self,
        agent_name: &str,
        job_id: BuildJobId,
    ) -> Result<Option<CancelOutcome>, Error> {
        let inner = &self.inner;
        let key = agent_name.to_string();
        let guard = inner.lock_agent(&key).await?;
        let Some(mut agent) = inner
            .cluster_op(|| inner.collections.agents.get(&key))
            .await?
        else {
            return Ok(None);
        };
        let Some(job) = agent.running_job_mut(&job_id) else {
            let finished = agent.recent_build_jobs.iter().any(|job| job.id == job_id);
            return Ok(finished.then_some(CancelOutcome::AlreadyFinished));
        };
        job.cancel_requested = true;
        inner
            .cluster_op(|| inner.collections.agents.put(key.clone(), agent.clone()))
            .await?;
        guard.unlock();
        inner
            .cluster_op(|| inner.collections.cancelled.add(job_id))
            .await?;
        event!(
            Level::INFO,
            %job_id,
            agent_name,
            "Requested cancellation of building job"
        );
        Ok(Some(CancelOutcome::CancelRequested))
    }

    /// True if cancellation of the building job was requested and the job
    /// has not reported back yet.
    pub async fn is_cancel_requested(&self, job_id: BuildJobId) -> Result<bool, Error> {
        let inner = &self.inner;
        inner
            .cluster_op(|| inner.collections.cancelled.contains(&job_id))
            .await
    }

    /// A paused agent keeps building its running jobs but is offered no new
    /// ones until resumed.
    pub async fn pause_agent(&self, agent_name: &str) -> Result<(), Error> {
        self.set_agent_paused(agent_name, true).await
    }

    pub async fn resume_agent(&self, agent_name: &str) -> Result<(), Error> {
        self.set_agent_paused(agent_name, false).await
    }

    async fn set_agent_paused(&self, agent_name: &str, is_paused: bool) -> Result<(), Error> {
        let inner = &self.inner;
        let key = agent_name.to_string();
        let guard = inner.lock_agent(&key).await?;
        let mut agent = inner
            .cluster_op(|| inner.collections.agents.get(&key))
            .await?
            .err_tip_with_code(|_| {
                (
                    Code::NotFound,
                    format!("Build agent {agent_name} is not registered"),
                )
            })?;
        if agent.is_paused == is_paused {
            return Ok(());
        }
        agent.is_paused = is_paused;
        inner
            .cluster_op(|| inner.collections.agents.put(key.clone(), agent.clone()))
            .await?;
        guard.unlock();
        event!(Level::INFO, agent_name, is_paused, "Build agent pause state changed");
        Ok(())
    }

    /// Queued jobs in dispatch order.
    pub async fn queued_jobs(&self) -> Result<Vec<BuildJobRecord>, Error> {
        let inner = &self.inner;
        let mut jobs = inner
            .cluster_op(|| inner.collections.pending.values())
            .await?;
        jobs.sort_by(BuildJobRecord::queue_order);
        Ok(jobs)
    }

    pub async fn queued_jobs_for_participation(
        &self,
        participation_id: u64,
    ) -> Result<Vec<BuildJobRecord>, Error> {
        let mut jobs = self.queued_jobs().await?;
        jobs.retain(|job| job.participation_id == participation_id);
        Ok(jobs)
    }

    pub async fn queued_jobs_for_course(&self, course_id: u64) -> Result<Vec<BuildJobRecord>, Error> {
        let mut jobs = self.queued_jobs().await?;
        jobs.retain(|job| job.course_id == course_id);
        Ok(jobs)
    }

    /// Registered agents, sorted by name.
    pub async fn agents(&self) -> Result<Vec<AgentRecord>, Error> {
        let inner = &self.inner;
        let mut agents = inner
            .cluster_op(|| inner.collections.agents.values())
            .await?;
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    pub async fn agent(&self, agent_name: &str) -> Result<Option<AgentRecord>, Error> {
        let inner = &self.inner;
        let key = agent_name.to_string();
        inner
            .cluster_op(|| inner.collections.agents.get(&key))
            .await
    }

    /// Jobs building on any agent.
    pub async fn running_jobs(&self) -> Result<Vec<BuildJobRecord>, Error> {
        Ok(self
            .agents()
            .await?
            .into_iter()
            .flat_map(|agent| agent.running_build_jobs)
            .collect())
    }

    pub async fn running_jobs_for_agent(&self, agent_name: &str) -> Result<Vec<BuildJobRecord>, Error> {
        Ok(self
            .agent(agent_name)
            .await?
            .map(|agent| agent.running_build_jobs)
            .unwrap_or_default())
    }

    pub async fn running_jobs_for_participation(
        &self,
        participation_id: u64,
    ) -> Result<Vec<BuildJobRecord>, Error> {
        let mut jobs = self.running_jobs().await?;
        jobs.retain(|job| job.participation_id == participation_id);
        Ok(jobs)
    }

    pub async fn running_jobs_for_course(&self, course_id: u64) -> Result<Vec<BuildJobRecord>, Error> {
        let mut jobs = self.running_jobs().await?;
        jobs.retain(|job| job.course_id == course_id);
        Ok(jobs)
    }

    /// Current state of a job, or `None` once it left both the queue and
    /// every agent's history.
    pub async fn job_state(&self, job_id: BuildJobId) -> Result<Option<BuildJobState>, Error> {
        let inner = &self.inner;
        if let Some(job) = inner
            .cluster_op(|| inner.collections.pending.get(&job_id))
            .await?
        {
            return Ok(Some(job.state()));
        }
        let agents = inner
            .cluster_op(|| inner.collections.agents.values())
            .await?;
        Ok(agents.iter().find_map(|agent| {
            agent
                .running_job(&job_id)
                .or_else(|| agent.recent_build_jobs.iter().find(|job| job.id == job_id))
                .map(BuildJobRecord::state)
        }))
    }

    /// Calls `listener` whenever the queue or the agent registry changes.
    /// Meant for pushing status to clients. The listener must not block.
    pub fn subscribe_changes(&self, listener: ChangeListener) -> Result<ChangeSubscription, Error> {
        let collections = &self.inner.collections;
        let pending = collections.pending.add_listener(listener.clone())?;
        let agents = match collections.agents.add_listener(listener) {
            Ok(id) => id,
            Err(e) => {
                let _ = collections.pending.remove_listener(pending);
                return Err(e);
            }
        };
        Ok(ChangeSubscription { pending, agents })
    }

    pub fn unsubscribe_changes(&self, subscription: ChangeSubscription) -> Result<(), Error> {
        let collections = &self.inner.collections;
        collections.pending.remove_listener(subscription.pending)?;
        collections.agents.remove_listener(subscription.agents)?;
        Ok(())
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        let metrics = &self.inner.metrics;
        CoordinatorMetrics {
            jobs_enqueued: metrics.jobs_enqueued.load(Ordering::Relaxed),
            jobs_dispatched: metrics.jobs_dispatched.load(Ordering::Relaxed),
            dispatch_races_lost: metrics.dispatch_races_lost.load(Ordering::Relaxed),
            results_processed: metrics.results_processed.load(Ordering::Relaxed),
            jobs_requeued: metrics.jobs_requeued.load(Ordering::Relaxed),
            jobs_errored: metrics.jobs_errored.load(Ordering::Relaxed),
            jobs_cancelled: metrics.jobs_cancelled.load(Ordering::Relaxed),
            agents_removed: metrics.agents_removed.load(Ordering::Relaxed),
        }
    }
}
