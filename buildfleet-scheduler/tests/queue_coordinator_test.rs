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

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use buildfleet_config::coordinator::{ClusterConfig, CoordinatorConfig};
use buildfleet_error::{Code, Error, ResultExt};
use buildfleet_macro::buildfleet_test;
use buildfleet_scheduler::agent::AgentRecord;
use buildfleet_scheduler::build_job::{BuildJobState, BuildStatus, FailureReason};
use buildfleet_scheduler::queue_coordinator::{
    CancelOutcome, DEFAULT_AGENT_MAP_NAME, FleetCollections, QueueCoordinator,
};
use buildfleet_util::collection_trait::DistributedMap;
use buildfleet_util::instant_wrapper::MockInstantWrapped;
use pretty_assertions::assert_eq;
use utils::scheduler_utils::{
    INSTANCE_NAME, SlowPuts, fast_retrier, make_fleet, make_heartbeat, make_job, make_result,
};

mod utils {
    pub(crate) mod scheduler_utils;
}

fn system_clock() -> Arc<SystemTime> {
    Arc::new(SystemTime::now())
}

#[buildfleet_test]
async fn enqueue_then_dispatch_assigns_job() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;

    let job_id = coordinator.enqueue(make_job(1)).await?;
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Queued));
    assert_eq!(coordinator.try_dispatch().await?, 1);

    assert!(coordinator.queued_jobs().await?.is_empty());
    let running = coordinator.running_jobs_for_agent("agent-1").await?;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, job_id);
    assert_eq!(running[0].agent_name.as_deref(), Some("agent-1"));
    assert!(running[0].timing.build_start_date.is_some());
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Building));
    assert_eq!(coordinator.metrics().jobs_dispatched, 1);
    Ok(())
}

#[buildfleet_test]
async fn enqueue_rejects_finished_job() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let mut job = make_job(1);
    job.status = Some(BuildStatus::Successful);

    let err = fleet
        .first()
        .enqueue(job)
        .await
        .expect_err("Finished job must not be enqueued");
    assert_eq!(err.code, Code::InvalidArgument);
    assert!(fleet.first().queued_jobs().await?.is_empty());
    Ok(())
}

#[buildfleet_test]
async fn dispatch_without_agents_keeps_jobs_queued() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.enqueue(make_job(1)).await?;
    coordinator.enqueue(make_job(2)).await?;

    assert_eq!(coordinator.try_dispatch().await?, 0);
    assert_eq!(coordinator.queued_jobs().await?.len(), 2);
    Ok(())
}

#[buildfleet_test]
async fn agent_capacity_is_never_exceeded() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(2)).await?;
    for participation_id in 1..=3 {
        coordinator.enqueue(make_job(participation_id)).await?;
    }

    assert_eq!(coordinator.try_dispatch().await?, 2);
    assert_eq!(coordinator.running_jobs_for_agent("agent-1").await?.len(), 2);
    assert_eq!(coordinator.queued_jobs().await?.len(), 1);

    // Nothing changes until a slot frees up.
    assert_eq!(coordinator.try_dispatch().await?, 0);

    let running = coordinator.running_jobs_for_agent("agent-1").await?;
    coordinator
        .on_result(make_result(&running[0], BuildStatus::Successful))
        .await?;
    assert_eq!(coordinator.try_dispatch().await?, 1);
    assert_eq!(coordinator.running_jobs_for_agent("agent-1").await?.len(), 2);
    assert!(coordinator.queued_jobs().await?.is_empty());
    Ok(())
}

#[buildfleet_test]
async fn dispatch_follows_priority_then_submission_date() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    let mut old_low = make_job(1).with_priority(3);
    old_low.timing.submission_date = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
    let mut new_high = make_job(2).with_priority(1);
    new_high.timing.submission_date = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
    let mut old_high = make_job(3).with_priority(1);
    old_high.timing.submission_date = SystemTime::UNIX_EPOCH + Duration::from_secs(2);
    for job in [&old_low, &new_high, &old_high] {
        coordinator.enqueue(job.clone()).await?;
    }

    let queued: Vec<_> = coordinator
        .queued_jobs()
        .await?
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(queued, vec![old_high.id, new_high.id, old_low.id]);

    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    assert_eq!(coordinator.try_dispatch().await?, 1);
    let running = coordinator.running_jobs_for_agent("agent-1").await?;
    assert_eq!(running[0].id, old_high.id);
    Ok(())
}

#[buildfleet_test]
async fn dispatch_prefers_least_loaded_agent() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-a", make_heartbeat(4)).await?;
    coordinator.heartbeat("agent-b", make_heartbeat(1)).await?;
    let first = coordinator.enqueue(make_job(1)).await?;
    let second = coordinator.enqueue(make_job(2)).await?;

    assert_eq!(coordinator.try_dispatch().await?, 2);
    let on_a: Vec<_> = coordinator
        .running_jobs_for_agent("agent-a")
        .await?
        .iter()
        .map(|job| job.id)
        .collect();
    let on_b: Vec<_> = coordinator
        .running_jobs_for_agent("agent-b")
        .await?
        .iter()
        .map(|job| job.id)
        .collect();
    // Both idle, ties are broken by name. Afterwards agent-b at 0/1 is less
    // utilized than agent-a at 1/4.
    let mut all: Vec<_> = on_a.iter().chain(on_b.iter()).copied().collect();
    all.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(all, expected);
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_b.len(), 1);
    Ok(())
}

#[buildfleet_test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_never_assign_a_job_twice() -> Result<(), Error> {
    const INSTANCES: usize = 4;
    const AGENTS: usize = 5;
    const SLOTS_PER_AGENT: usize = 2;
    const JOBS: u64 = 30;

    let fleet = make_fleet(INSTANCES, &CoordinatorConfig::default(), system_clock())?;
    for agent in 0..AGENTS {
        fleet
            .first()
            .heartbeat(&format!("agent-{agent}"), make_heartbeat(SLOTS_PER_AGENT))
            .await?;
    }
    for participation_id in 0..JOBS {
        fleet.first().enqueue(make_job(participation_id)).await?;
    }

    let dispatched = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = fleet
        .coordinators
        .iter()
        .cloned()
        .map(|coordinator| {
            let dispatched = dispatched.clone();
            tokio::spawn(async move {
                loop {
                    let count = coordinator.try_dispatch().await?;
                    if count == 0 {
                        return Ok::<(), Error>(());
                    }
                    dispatched.fetch_add(count, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.err_tip(|| "Dispatch task panicked")??;
    }
    // A round that only lost races reports zero, so finish sequentially.
    dispatched.fetch_add(fleet.first().try_dispatch().await?, Ordering::Relaxed);

    let capacity = AGENTS * SLOTS_PER_AGENT;
    assert_eq!(dispatched.load(Ordering::Relaxed), capacity);

    let agents = fleet.first().agents().await?;
    let mut seen = HashSet::new();
    for agent in &agents {
        assert!(agent.running_build_jobs.len() <= SLOTS_PER_AGENT);
        for job in &agent.running_build_jobs {
            assert!(seen.insert(job.id), "Job {} assigned twice", job.id);
            assert_eq!(job.agent_name.as_deref(), Some(agent.name.as_str()));
        }
    }
    assert_eq!(seen.len(), capacity);

    let queued = fleet.first().queued_jobs().await?;
    assert_eq!(queued.len(), JOBS as usize - capacity);
    assert!(queued.iter().all(|job| !seen.contains(&job.id)));

    let total_dispatched: u64 = fleet
        .coordinators
        .iter()
        .map(|coordinator| coordinator.metrics().jobs_dispatched)
        .sum();
    assert_eq!(total_dispatched, capacity as u64);
    Ok(())
}

#[buildfleet_test]
async fn dispatch_skips_agent_locked_elsewhere() -> Result<(), Error> {
    let config = CoordinatorConfig {
        agent_lock_timeout_ms: 10,
        ..Default::default()
    };
    let fleet = make_fleet(1, &config, system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-a", make_heartbeat(1)).await?;
    coordinator.heartbeat("agent-b", make_heartbeat(1)).await?;
    coordinator.enqueue(make_job(1)).await?;

    let agents = fleet
        .cluster
        .map::<String, AgentRecord>(DEFAULT_AGENT_MAP_NAME)?;
    let guard = agents
        .lock(&"agent-a".to_string(), Duration::from_secs(1))
        .await?;

    assert_eq!(coordinator.try_dispatch().await?, 1);
    assert!(coordinator.running_jobs_for_agent("agent-a").await?.is_empty());
    assert_eq!(coordinator.running_jobs_for_agent("agent-b").await?.len(), 1);
    assert_eq!(coordinator.metrics().dispatch_races_lost, 1);
    guard.unlock();
    Ok(())
}

#[buildfleet_test]
async fn on_result_is_idempotent() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    let job_id = coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;
    let running = coordinator.running_jobs_for_agent("agent-1").await?;

    let result = make_result(&running[0], BuildStatus::Failed);
    coordinator.on_result(result.clone()).await?;
    coordinator.on_result(result).await?;
    fleet.publisher.wait_idle().await;

    let agent = coordinator
        .agent("agent-1")
        .await?
        .err_tip(|| "Agent should still be registered")?;
    assert!(agent.running_build_jobs.is_empty());
    assert_eq!(agent.recent_build_jobs.len(), 1);
    assert_eq!(agent.recent_build_jobs[0].result_id, Some(42));
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Finished));

    // The repeated report publishes the recorded result again, the sink
    // drops it by job id.
    let notifications = fleet.sink.notifications();
    assert_eq!(notifications.len(), 2);
    for notification in &notifications {
        assert_eq!(notification.job_id, job_id);
        assert_eq!(notification.status, BuildStatus::Failed);
    }
    assert_eq!(coordinator.metrics().results_processed, 1);
    Ok(())
}

#[buildfleet_test]
async fn result_recorded_despite_write_error_is_published_on_retry() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    let job_id = coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;
    let running = coordinator.running_jobs_for_agent("agent-1").await?;
    let result = make_result(&running[0], BuildStatus::Successful);

    // More failures than the retry budget, every attempt still lands.
    fleet
        .cluster
        .fail_next_writes_after_apply(DEFAULT_AGENT_MAP_NAME, 6);
    let err = coordinator
        .on_result(result.clone())
        .await
        .expect_err("Recording the result reported an error");
    assert_eq!(err.code, Code::Unavailable);
    fleet.publisher.wait_idle().await;
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Finished));
    assert!(fleet.sink.notifications().is_empty());

    // The agent reports again.
    coordinator.on_result(result).await?;
    fleet.publisher.wait_idle().await;
    let notifications = fleet.sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].job_id, job_id);
    assert_eq!(notifications[0].status, BuildStatus::Successful);
    Ok(())
}

#[buildfleet_test]
async fn dispatch_write_applied_despite_error_is_not_requeued() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(2)).await?;
    let job_id = coordinator.enqueue(make_job(1)).await?;

    fleet
        .cluster
        .fail_next_writes_after_apply(DEFAULT_AGENT_MAP_NAME, 6);
    let err = coordinator
        .try_dispatch()
        .await
        .expect_err("Assigning the job reported an error");
    assert_eq!(err.code, Code::Unavailable);

    // The assignment landed, so the job must not be queued a second time.
    assert!(coordinator.queued_jobs().await?.is_empty());
    let running = coordinator.running_jobs_for_agent("agent-1").await?;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, job_id);
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Building));
    assert_eq!(coordinator.try_dispatch().await?, 0);
    Ok(())
}

#[buildfleet_test]
async fn errored_result_is_reported_as_build_error() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;
    let running = coordinator.running_jobs_for_agent("agent-1").await?;

    coordinator
        .on_result(make_result(&running[0], BuildStatus::Errored))
        .await?;
    fleet.publisher.wait_idle().await;

    let notifications = fleet.sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].failure_reason, Some(FailureReason::BuildError));
    Ok(())
}

#[buildfleet_test]
async fn on_result_from_unknown_agent_is_ignored() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let mut job = make_job(1);
    job.agent_name = Some("agent-ghost".to_string());

    fleet
        .first()
        .on_result(make_result(&job, BuildStatus::Successful))
        .await?;
    fleet.publisher.wait_idle().await;
    assert!(fleet.sink.notifications().is_empty());
    Ok(())
}

#[buildfleet_test]
async fn recent_jobs_are_bounded() -> Result<(), Error> {
    let config = CoordinatorConfig {
        recent_build_jobs_limit: 2,
        ..Default::default()
    };
    let fleet = make_fleet(1, &config, system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;

    let mut finished = Vec::new();
    for participation_id in 0..3 {
        coordinator.enqueue(make_job(participation_id)).await?;
        coordinator.try_dispatch().await?;
        let running = coordinator.running_jobs_for_agent("agent-1").await?;
        coordinator
            .on_result(make_result(&running[0], BuildStatus::Successful))
            .await?;
        finished.push(running[0].id);
    }

    let agent = coordinator
        .agent("agent-1")
        .await?
        .err_tip(|| "Agent should still be registered")?;
    let recent: Vec<_> = agent.recent_build_jobs.iter().map(|job| job.id).collect();
    assert_eq!(recent, vec![finished[2], finished[1]]);
    Ok(())
}

#[buildfleet_test]
async fn missing_agent_requeues_its_jobs_once() -> Result<(), Error> {
    let fleet = make_fleet(2, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(2)).await?;
    coordinator.enqueue(make_job(1)).await?;
    coordinator.enqueue(make_job(2)).await?;
    assert_eq!(coordinator.try_dispatch().await?, 2);

    coordinator.on_agent_missing("agent-1").await?;
    // Another instance reacting to the same membership event.
    fleet.coordinators[1].on_agent_missing("agent-1").await?;

    assert_eq!(coordinator.agent("agent-1").await?, None);
    let queued = coordinator.queued_jobs().await?;
    assert_eq!(queued.len(), 2);
    for job in &queued {
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.agent_name, None);
        assert_eq!(job.timing.build_start_date, None);
        assert_eq!(job.state(), BuildJobState::Queued);
    }
    let requeued: u64 = fleet
        .coordinators
        .iter()
        .map(|coordinator| coordinator.metrics().jobs_requeued)
        .sum();
    assert_eq!(requeued, 2);
    Ok(())
}

#[buildfleet_test]
async fn job_errors_once_retries_are_exhausted() -> Result<(), Error> {
    let config = CoordinatorConfig {
        max_job_retries: 2,
        ..Default::default()
    };
    let fleet = make_fleet(1, &config, system_clock())?;
    let coordinator = fleet.first();
    let job_id = coordinator.enqueue(make_job(1)).await?;

    for lost in 1..=3u32 {
        coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
        assert_eq!(coordinator.try_dispatch().await?, 1);
        coordinator.on_agent_missing("agent-1").await?;
        if lost < 3 {
            let queued = coordinator.queued_jobs().await?;
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].retry_count, lost);
        }
    }
    fleet.publisher.wait_idle().await;

    assert!(coordinator.queued_jobs().await?.is_empty());
    let notifications = fleet.sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].job_id, job_id);
    assert_eq!(notifications[0].status, BuildStatus::Errored);
    assert_eq!(notifications[0].failure_reason, Some(FailureReason::AgentLost));
    assert_eq!(coordinator.metrics().jobs_errored, 1);
    Ok(())
}

#[buildfleet_test]
async fn cancel_queued_job_dequeues_it() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    let job_id = coordinator.enqueue(make_job(1)).await?;

    assert_eq!(coordinator.cancel(job_id).await?, CancelOutcome::Dequeued);
    fleet.publisher.wait_idle().await;

    assert!(coordinator.queued_jobs().await?.is_empty());
    assert_eq!(coordinator.job_state(job_id).await?, None);
    let notifications = fleet.sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, BuildStatus::Cancelled);

    let err = coordinator
        .cancel(job_id)
        .await
        .expect_err("Job is gone, cancel should fail");
    assert_eq!(err.code, Code::NotFound);
    Ok(())
}

#[buildfleet_test]
async fn cancel_building_job_asks_agent_to_stop() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    let job_id = coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;

    assert_eq!(coordinator.cancel(job_id).await?, CancelOutcome::CancelRequested);
    assert!(coordinator.is_cancel_requested(job_id).await?);
    let running = coordinator.running_jobs_for_agent("agent-1").await?;
    assert!(running[0].cancel_requested);
    // The agent keeps the job until it reports back.
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Building));

    coordinator
        .on_result(make_result(&running[0], BuildStatus::Cancelled))
        .await?;
    fleet.publisher.wait_idle().await;

    assert!(!coordinator.is_cancel_requested(job_id).await?);
    assert_eq!(coordinator.job_state(job_id).await?, Some(BuildJobState::Cancelled));
    assert_eq!(coordinator.cancel(job_id).await?, CancelOutcome::AlreadyFinished);
    assert_eq!(fleet.sink.job_ids(), vec![job_id]);
    Ok(())
}

#[buildfleet_test]
async fn cancel_finds_job_while_it_is_being_dispatched() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    fleet.first().heartbeat("agent-1", make_heartbeat(1)).await?;
    let job_id = fleet.first().enqueue(make_job(1)).await?;

    // Widen the window in which the job is in neither the queue nor the
    // agent's record.
    let collections =
        FleetCollections::from_memory_cluster(&fleet.cluster, &ClusterConfig::default())?;
    let slow_agents = SlowPuts::new(collections.agents.clone(), Duration::from_millis(200));
    let coordinator = QueueCoordinator::new_with_retrier(
        &CoordinatorConfig::default(),
        INSTANCE_NAME,
        FleetCollections {
            agents: slow_agents.clone(),
            ..collections
        },
        fleet.publisher.clone(),
        system_clock(),
        fast_retrier(5),
    )?;
    slow_agents.arm();

    let (dispatched, outcome) = tokio::join!(coordinator.try_dispatch(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fleet.first().cancel(job_id).await
    });
    assert_eq!(dispatched?, 1);
    assert_eq!(outcome?, CancelOutcome::CancelRequested);

    assert!(fleet.first().is_cancel_requested(job_id).await?);
    let running = fleet.first().running_jobs_for_agent("agent-1").await?;
    assert_eq!(running.len(), 1);
    assert!(running[0].cancel_requested);
    Ok(())
}

#[buildfleet_test]
async fn cancel_unknown_job_is_not_found() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;

    let err = coordinator
        .cancel(make_job(2).id)
        .await
        .expect_err("Job was never enqueued");
    assert_eq!(err.code, Code::NotFound);
    Ok(())
}

#[buildfleet_test]
async fn cancelled_job_of_lost_agent_is_not_requeued() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    let job_id = coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;
    coordinator.cancel(job_id).await?;

    coordinator.on_agent_missing("agent-1").await?;
    fleet.publisher.wait_idle().await;

    assert!(coordinator.queued_jobs().await?.is_empty());
    assert!(!coordinator.is_cancel_requested(job_id).await?);
    let notifications = fleet.sink.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, BuildStatus::Cancelled);
    Ok(())
}

#[buildfleet_test]
async fn paused_agent_receives_no_jobs() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    coordinator.pause_agent("agent-1").await?;
    coordinator.enqueue(make_job(1)).await?;

    assert_eq!(coordinator.try_dispatch().await?, 0);
    coordinator.resume_agent("agent-1").await?;
    assert_eq!(coordinator.try_dispatch().await?, 1);

    let err = coordinator
        .pause_agent("agent-unknown")
        .await
        .expect_err("Unknown agent cannot be paused");
    assert_eq!(err.code, Code::NotFound);
    Ok(())
}

#[buildfleet_test]
async fn heartbeat_validates_agent() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();

    let err = coordinator
        .heartbeat("Agent_1", make_heartbeat(1))
        .await
        .expect_err("Upper case and underscores are not allowed");
    assert_eq!(err.code, Code::InvalidArgument);
    let err = coordinator
        .heartbeat("agent-1", make_heartbeat(0))
        .await
        .expect_err("Agent without slots is useless");
    assert_eq!(err.code, Code::InvalidArgument);
    assert!(coordinator.agents().await?.is_empty());
    Ok(())
}

#[buildfleet_test]
async fn heartbeat_never_lowers_capacity_below_running_jobs() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(2)).await?;
    coordinator.enqueue(make_job(1)).await?;
    coordinator.enqueue(make_job(2)).await?;
    coordinator.try_dispatch().await?;

    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    let agent = coordinator
        .agent("agent-1")
        .await?
        .err_tip(|| "Agent should be registered")?;
    assert_eq!(agent.max_concurrent_build_jobs, 2);
    assert!(!agent.can_accept_work());
    Ok(())
}

#[buildfleet_test]
async fn transient_cluster_failures_are_retried() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();

    fleet.cluster.fail_next_operations(3);
    let job_id = coordinator.enqueue(make_job(1)).await?;
    assert_eq!(coordinator.queued_jobs().await?.len(), 1);

    fleet.cluster.set_available(false);
    let err = coordinator
        .enqueue(make_job(2))
        .await
        .expect_err("Cluster is down");
    assert_eq!(err.code, Code::Unavailable);
    let err = coordinator
        .try_dispatch()
        .await
        .expect_err("Cluster is down");
    assert_eq!(err.code, Code::Unavailable);
    fleet.cluster.set_available(true);

    // Nothing was lost or duplicated by the outage.
    let queued = coordinator.queued_jobs().await?;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, job_id);
    Ok(())
}

#[buildfleet_test]
async fn dispatch_survives_flaky_cluster() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(4)).await?;
    for participation_id in 0..4 {
        coordinator.enqueue(make_job(participation_id)).await?;
    }

    // Fewer than the retry budget of a single operation.
    fleet.cluster.fail_next_operations(4);
    assert_eq!(coordinator.try_dispatch().await?, 4);
    assert_eq!(coordinator.running_jobs().await?.len(), 4);
    assert!(coordinator.queued_jobs().await?.is_empty());
    Ok(())
}

#[buildfleet_test]
async fn silent_agent_is_marked_unhealthy_then_removed() -> Result<(), Error> {
    let config = CoordinatorConfig {
        agent_heartbeat_timeout_s: 30,
        agent_missing_grace_period_s: 60,
        ..Default::default()
    };
    let fleet = make_fleet(1, &config, Arc::new(MockInstantWrapped))?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(2)).await?;
    coordinator.enqueue(make_job(1)).await?;
    coordinator.try_dispatch().await?;

    MockInstantWrapped::advance(Duration::from_secs(31));
    assert_eq!(coordinator.check_agent_liveness().await?, 0);
    let agent = coordinator
        .agent("agent-1")
        .await?
        .err_tip(|| "Unhealthy agent is kept")?;
    assert!(!agent.is_healthy);

    coordinator.enqueue(make_job(2)).await?;
    assert_eq!(coordinator.try_dispatch().await?, 0);

    MockInstantWrapped::advance(Duration::from_secs(60));
    assert_eq!(coordinator.check_agent_liveness().await?, 1);
    assert_eq!(coordinator.agent("agent-1").await?, None);
    let queued = coordinator.queued_jobs().await?;
    assert_eq!(queued.len(), 2);
    assert_eq!(
        queued.iter().map(|job| job.retry_count).max(),
        Some(1),
        "Only the running job counts a retry"
    );
    Ok(())
}

#[buildfleet_test]
async fn heartbeat_restores_unhealthy_agent() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), Arc::new(MockInstantWrapped))?;
    let coordinator = fleet.first();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;

    MockInstantWrapped::advance(Duration::from_secs(45));
    coordinator.check_agent_liveness().await?;
    assert_eq!(coordinator.agent("agent-1").await?.map(|a| a.is_healthy), Some(false));

    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    assert_eq!(coordinator.agent("agent-1").await?.map(|a| a.is_healthy), Some(true));

    // The fresh heartbeat resets the clock for the liveness check.
    MockInstantWrapped::advance(Duration::from_secs(45));
    assert_eq!(coordinator.check_agent_liveness().await?, 0);
    assert!(coordinator.agent("agent-1").await?.is_some());
    Ok(())
}

#[buildfleet_test]
async fn queries_filter_by_participation_and_course() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    let mut other_course = make_job(7);
    other_course.course_id = 2;
    coordinator.enqueue(make_job(7)).await?;
    coordinator.enqueue(make_job(8)).await?;
    coordinator.enqueue(other_course).await?;

    assert_eq!(coordinator.queued_jobs_for_participation(7).await?.len(), 2);
    assert_eq!(coordinator.queued_jobs_for_course(2).await?.len(), 1);
    assert_eq!(coordinator.queued_jobs_for_course(1).await?.len(), 2);

    coordinator.heartbeat("agent-1", make_heartbeat(3)).await?;
    coordinator.try_dispatch().await?;
    assert_eq!(coordinator.running_jobs_for_participation(8).await?.len(), 1);
    assert_eq!(coordinator.running_jobs_for_course(2).await?.len(), 1);
    assert_eq!(coordinator.running_jobs().await?.len(), 3);
    Ok(())
}

#[buildfleet_test]
async fn subscribers_are_told_about_changes() -> Result<(), Error> {
    let fleet = make_fleet(1, &CoordinatorConfig::default(), system_clock())?;
    let coordinator = fleet.first();
    let changes = Arc::new(AtomicUsize::new(0));
    let subscription = coordinator.subscribe_changes({
        let changes = changes.clone();
        Arc::new(move || {
            changes.fetch_add(1, Ordering::Relaxed);
        })
    })?;

    coordinator.enqueue(make_job(1)).await?;
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    let seen = changes.load(Ordering::Relaxed);
    assert_eq!(seen, 2);

    coordinator.unsubscribe_changes(subscription)?;
    coordinator.enqueue(make_job(2)).await?;
    assert_eq!(changes.load(Ordering::Relaxed), seen);
    Ok(())
}

#[buildfleet_test]
async fn dispatch_loop_reacts_to_new_jobs() -> Result<(), Error> {
    let config = CoordinatorConfig {
        // Long enough that only change notifications can explain a dispatch.
        dispatch_interval_ms: 60_000,
        ..Default::default()
    };
    let fleet = make_fleet(1, &config, system_clock())?;
    let coordinator = fleet.first();
    let _dispatch_loop = coordinator.spawn_dispatch_loop();
    coordinator.heartbeat("agent-1", make_heartbeat(1)).await?;
    // Let the first interval tick pass.
    tokio::task::yield_now().await;

    let job_id = coordinator.enqueue(make_job(1)).await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if coordinator.job_state(job_id).await? == Some(BuildJobState::Building) {
                return Ok::<(), Error>(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await??;
    Ok(())
}
