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

use core::pin::Pin;
use core::time::Duration;
use std::sync::Arc;

use buildfleet_config::coordinator::Retry;
use buildfleet_error::{Code, Error, make_err};
use futures::future::Future;
use futures::stream::StreamExt;
use rand::Rng;
use tracing::debug;

struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    const fn new(base: Duration) -> Self {
        Self { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current *= 2;
        Some(delay)
    }
}

pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Sync + Send>;
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

#[derive(PartialEq, Eq, Debug)]
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Builds the jitter function described by `Retry::jitter`.
pub fn make_jitter_fn(config: &Retry) -> JitterFn {
    if config.jitter == 0f32 {
        Arc::new(move |delay: Duration| delay)
    } else {
        let local_jitter = config.jitter;
        Arc::new(move |delay: Duration| {
            delay.mul_f32(local_jitter.mul_add(rand::rng().random::<f32>() - 0.5, 1.))
        })
    }
}

/// Class used to retry a job with a sleep function in between each retry.
#[derive(Clone)]
pub struct Retrier {
    sleep_fn: SleepFn,
    jitter_fn: JitterFn,
    config: Retry,
}

impl core::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Retrier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn, jitter_fn: JitterFn, config: Retry) -> Self {
        Self {
            sleep_fn,
            jitter_fn,
            config,
        }
    }

    /// A retrier that sleeps on the tokio timer and applies the configured
    /// jitter.
    pub fn with_tokio_sleep(config: Retry) -> Self {
        let jitter_fn = make_jitter_fn(&config);
        Self::new(
            Arc::new(|duration| Box::pin(tokio::time::sleep(duration))),
            jitter_fn,
            config,
        )
    }

    /// This should only return true if the error code should be interpreted as
    /// temporary.
    const fn should_retry(code: Code) -> bool {
        matches!(
            code,
            Code::Unknown
                | Code::Cancelled
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
                | Code::Unavailable
                | Code::DataLoss
        )
    }

    fn get_retry_config(&self) -> impl Iterator<Item = Duration> + '_ {
        ExponentialBackoff::new(Duration::from_secs_f32(self.config.delay.max(0.)))
            .map(|d| (self.jitter_fn)(d))
            .take(self.config.max_retries) // Remember this is number of retries, so will run max_retries + 1.
    }

    pub fn retry<'a, T, Fut>(
        &'a self,
        operation: Fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, Error>> + 'a + Send>>
    where
        Fut: futures::stream::Stream<Item = RetryResult<T>> + Send + 'a,
        T: Send,
    {
        Box::pin(async move {
            let mut iter = self.get_retry_config();
            let mut operation = Box::pin(operation);
            let mut attempt = 0;
            loop {
                attempt += 1;
                match operation.next().await {
                    None => {
                        return Err(make_err!(
                            Code::Internal,
                            "Retry stream ended abruptly on attempt {attempt}",
                        ));
                    }
                    Some(RetryResult::Ok(value)) => return Ok(value),
                    Some(RetryResult::Err(e)) => {
                        return Err(e.append(format!("On attempt {attempt}")));
                    }
                    Some(RetryResult::Retry(e)) => {
                        if !Self::should_retry(e.code) {
                            debug!("Not retrying permanent error on attempt {attempt}: {e:?}");
                            return Err(e);
                        }
                        let delay = iter
                            .next()
                            .ok_or_else(|| e.append(format!("On attempt {attempt}")))?;
                        (self.sleep_fn)(delay).await;
                    }
                }
            }
        })
    }

    /// Runs `op` until it succeeds, fails with a non-transient error or the
    /// retry budget is exhausted. Only errors for which
    /// `Error::is_transient` holds are retried.
    pub async fn retry_transient<T, F, Fut>(&self, op: F) -> Result<T, Error>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, Error>> + Send,
        T: Send,
    {
        self.retry(futures::stream::unfold(&op, |op| async move {
            let result = match op().await {
                Ok(value) => RetryResult::Ok(value),
                Err(e) if e.is_transient() => RetryResult::Retry(e),
                Err(e) => RetryResult::Err(e),
            };
            Some((result, op))
        }))
        .await
    }
}
