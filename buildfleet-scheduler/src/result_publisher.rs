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

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_config::coordinator::{ResultPublisherConfig, Retry};
use buildfleet_error::Error;
use buildfleet_util::retry::{Retrier, RetryResult};
use buildfleet_util::task::JoinHandleDropGuard;
use buildfleet_util::{background_spawn, spawn};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{Level, event};

use crate::build_job::{BuildJobId, BuildStatus, FailureReason, ResultQueueItem};

pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 1024;

pub const DEFAULT_SINK_RETRY: Retry = Retry {
    max_retries: 10,
    delay: 0.5,
    jitter: 0.5,
};

/// What the sink receives for every finished build job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobResultNotification {
    pub job_id: BuildJobId,
    pub status: BuildStatus,
    pub failure_reason: Option<FailureReason>,
    pub item: ResultQueueItem,
}

impl From<ResultQueueItem> for JobResultNotification {
    fn from(item: ResultQueueItem) -> Self {
        Self {
            job_id: item.job.id,
            status: item.job.status.unwrap_or(item.result.status),
            failure_reason: item.job.failure_reason,
            item,
        }
    }
}

/// Persistence and client notification of finished jobs. Delivery is at
/// least once, so implementations must ignore a job id they already stored.
#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    async fn publish(&self, notification: &JobResultNotification) -> Result<(), Error>;
}

struct PublisherShared {
    sink: Arc<dyn ResultSink>,
    retrier: Retrier,
    published: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicUsize,
    idle_notify: Notify,
}

impl PublisherShared {
    async fn publish(&self, item: ResultQueueItem) {
        let notification = JobResultNotification::from(item);
        let sink = &self.sink;
        let notification_ref = &notification;
        let result = self
            .retrier
            .retry(futures::stream::unfold((), move |()| async move {
                let notification = notification_ref;
                let attempt = match sink.publish(notification).await {
                    Ok(()) => RetryResult::Ok(()),
                    Err(e) => {
                        event!(
                            Level::DEBUG,
                            job_id = %notification.job_id,
                            ?e,
                            "Result sink rejected notification"
                        );
                        RetryResult::Retry(e)
                    }
                };
                Some((attempt, ()))
            }))
            .await;
        match result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::DEBUG,
                    job_id = %notification.job_id,
                    status = ?notification.status,
                    "Published build job result"
                );
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::ERROR,
                    job_id = %notification.job_id,
                    ?e,
                    "Giving up on publishing build job result"
                );
            }
        }
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_notify.notify_waiters();
        }
    }
}

/// Hands finished build jobs to a `ResultSink` on a background task, so the
/// coordinator never waits on the sink.
pub struct ResultPublisher {
    sender: Mutex<Option<mpsc::Sender<ResultQueueItem>>>,
    shared: Arc<PublisherShared>,
    _worker: JoinHandleDropGuard<()>,
}

impl core::fmt::Debug for ResultPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResultPublisher")
            .field("published", &self.published_count())
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

impl ResultPublisher {
    /// Must be called from within a tokio runtime.
    pub fn new(config: &ResultPublisherConfig, sink: Arc<dyn ResultSink>) -> Arc<Self> {
        let retry = config.sink_retry.clone().unwrap_or(DEFAULT_SINK_RETRY);
        Self::new_with_retrier(config, sink, Retrier::with_tokio_sleep(retry))
    }

    pub fn new_with_retrier(
        config: &ResultPublisherConfig,
        sink: Arc<dyn ResultSink>,
        retrier: Retrier,
    ) -> Arc<Self> {
        let mut channel_capacity = config.channel_capacity;
        if channel_capacity == 0 {
            channel_capacity = DEFAULT_RESULT_CHANNEL_CAPACITY;
        }
        let (sender, mut receiver) = mpsc::channel(channel_capacity);
        let shared = Arc::new(PublisherShared {
            sink,
            retrier,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle_notify: Notify::new(),
        });
        let worker_shared = shared.clone();
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            shared,
            _worker: spawn!("result_publisher_worker", async move {
                while let Some(item) = receiver.recv().await {
                    worker_shared.publish(item).await;
                }
            }),
        })
    }

    /// Queues `item` for publishing and returns immediately. If the channel
    /// is full the item is published on its own task instead.
    pub fn handoff(&self, item: ResultQueueItem) {
        let Some(sender) = self.sender.lock().clone() else {
            event!(
                Level::ERROR,
                job_id = %item.job.id,
                "Result publisher is shut down, dropping result"
            );
            return;
        };
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                event!(
                    Level::WARN,
                    job_id = %item.job.id,
                    "Result channel full, publishing on overflow task"
                );
                let shared = self.shared.clone();
                background_spawn!("result_publisher_overflow", async move {
                    shared.publish(item).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                if self.shared.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.shared.idle_notify.notify_waiters();
                }
                event!(
                    Level::ERROR,
                    job_id = %item.job.id,
                    "Result publisher worker stopped, dropping result"
                );
            }
        }
    }

    /// Number of results the sink accepted.
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    /// Number of results given up on after exhausting retries.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once every handed off result has been published or dropped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle_notify.notified();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting results and waits for the ones already handed off.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        self.wait_idle().await;
    }
}
