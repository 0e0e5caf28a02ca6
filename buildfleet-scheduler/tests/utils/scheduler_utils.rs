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

use core::hash::Hash;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use buildfleet_config::coordinator::{
    ClusterConfig, CoordinatorConfig, ResultPublisherConfig, Retry,
};
use buildfleet_error::{Code, Error, make_err};
use buildfleet_scheduler::agent::AgentHeartbeat;
use buildfleet_scheduler::build_job::{
    BuildJobId, BuildJobRecord, BuildResult, BuildStatus, RepositoryInfo, ResultQueueItem,
};
use buildfleet_scheduler::queue_coordinator::{FleetCollections, QueueCoordinator};
use buildfleet_scheduler::result_publisher::{JobResultNotification, ResultPublisher, ResultSink};
use buildfleet_store::memory_cluster::MemoryCluster;
use buildfleet_util::collection_trait::{
    ChangeListener, DistributedMap, EntryListener, KeyLockGuard, ListenerId,
};
use buildfleet_util::instant_wrapper::InstantWrapper;
use buildfleet_util::retry::Retrier;
use parking_lot::Mutex;

pub const INSTANCE_NAME: &str = "buildfleet_test_instance";

/// Sink that remembers every notification and can be told to fail first.
#[derive(Debug, Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<JobResultNotification>>,
    failures_left: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `failures` publish calls with `Unavailable`.
    pub fn failing(failures: usize) -> Arc<Self> {
        let sink = Self::default();
        sink.failures_left.store(failures, Ordering::Release);
        Arc::new(sink)
    }

    pub fn notifications(&self) -> Vec<JobResultNotification> {
        self.notifications.lock().clone()
    }

    pub fn job_ids(&self) -> Vec<BuildJobId> {
        self.notifications
            .lock()
            .iter()
            .map(|notification| notification.job_id)
            .collect()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn publish(&self, notification: &JobResultNotification) -> Result<(), Error> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(make_err!(Code::Unavailable, "Result sink is down"));
        }
        self.notifications.lock().push(notification.clone());
        Ok(())
    }
}

/// Map whose `put` sleeps for `delay` before writing, once armed.
pub struct SlowPuts<K, V> {
    inner: Arc<dyn DistributedMap<K, V>>,
    delay: Duration,
    armed: AtomicBool,
}

impl<K, V> SlowPuts<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn DistributedMap<K, V>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            delay,
            armed: AtomicBool::new(false),
        })
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl<K, V> DistributedMap<K, V> for SlowPuts<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, Error> {
        self.inner.get(key).await
    }

    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, Error> {
        self.inner.get_all(keys).await
    }

    async fn put(&self, key: K, value: V) -> Result<Option<V>, Error> {
        if self.armed.load(Ordering::Acquire) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.put(key, value).await
    }

    async fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        self.inner.remove(key).await
    }

    async fn values(&self) -> Result<Vec<V>, Error> {
        self.inner.values().await
    }

    async fn key_set(&self) -> Result<HashSet<K>, Error> {
        self.inner.key_set().await
    }

    async fn entry_set(&self) -> Result<Vec<(K, V)>, Error> {
        self.inner.entry_set().await
    }

    async fn size(&self) -> Result<usize, Error> {
        self.inner.size().await
    }

    async fn clear(&self) -> Result<(), Error> {
        self.inner.clear().await
    }

    async fn lock(&self, key: &K, timeout: Duration) -> Result<KeyLockGuard, Error> {
        self.inner.lock(key, timeout).await
    }

    fn add_entry_listener(&self, listener: EntryListener<K, V>) -> Result<ListenerId, Error> {
        self.inner.add_entry_listener(listener)
    }

    fn add_listener(&self, listener: ChangeListener) -> Result<ListenerId, Error> {
        self.inner.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<bool, Error> {
        self.inner.remove_listener(id)
    }
}

/// Retrier that yields instead of sleeping.
pub fn fast_retrier(max_retries: usize) -> Retrier {
    Retrier::new(
        Arc::new(|_: Duration| Box::pin(tokio::task::yield_now())),
        Arc::new(|delay: Duration| delay),
        Retry {
            max_retries,
            delay: 0.,
            jitter: 0.,
        },
    )
}

/// Coordinator instances sharing one cluster and one result publisher.
pub struct Fleet {
    pub cluster: MemoryCluster,
    pub sink: Arc<RecordingSink>,
    pub publisher: Arc<ResultPublisher>,
    pub coordinators: Vec<QueueCoordinator>,
}

impl Fleet {
    pub fn first(&self) -> &QueueCoordinator {
        &self.coordinators[0]
    }
}

pub fn make_fleet(
    instances: usize,
    config: &CoordinatorConfig,
    clock: Arc<dyn InstantWrapper>,
) -> Result<Fleet, Error> {
    let cluster = MemoryCluster::new();
    let sink = RecordingSink::new();
    let publisher = ResultPublisher::new_with_retrier(
        &ResultPublisherConfig::default(),
        sink.clone(),
        fast_retrier(3),
    );
    let coordinators = (0..instances)
        .map(|_| {
            let collections =
                FleetCollections::from_memory_cluster(&cluster, &ClusterConfig::default())?;
            QueueCoordinator::new_with_retrier(
                config,
                INSTANCE_NAME,
                collections,
                publisher.clone(),
                clock.clone(),
                fast_retrier(5),
            )
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(Fleet {
        cluster,
        sink,
        publisher,
        coordinators,
    })
}

pub fn make_job(participation_id: u64) -> BuildJobRecord {
    BuildJobRecord::new(
        format!("build-{participation_id}"),
        participation_id,
        1,
        1,
        RepositoryInfo::default(),
        SystemTime::UNIX_EPOCH,
    )
}

pub fn make_heartbeat(max_concurrent_build_jobs: usize) -> AgentHeartbeat {
    AgentHeartbeat {
        display_name: None,
        member_address: "127.0.0.1:5701".to_string(),
        max_concurrent_build_jobs,
        public_key_fingerprint: None,
    }
}

/// What an agent reports after building `job`.
pub fn make_result(job: &BuildJobRecord, status: BuildStatus) -> ResultQueueItem {
    ResultQueueItem {
        result: BuildResult {
            status,
            result_id: Some(42),
        },
        job: job.clone(),
        build_logs: vec!["[INFO] BUILD SUCCESS".to_string()],
        exception: None,
    }
}
