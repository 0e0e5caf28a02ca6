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

use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use mock_instant::thread_local::MockClock;

/// Source of wall-clock time for heartbeat and build timestamps. Swapped for
/// `MockInstantWrapped` in tests.
pub trait InstantWrapper: Send + Sync + Unpin + 'static {
    fn unix_timestamp(&self) -> u64;
    fn now(&self) -> SystemTime;
}

impl InstantWrapper for SystemTime {
    fn unix_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub fn default_instant_wrapper() -> SystemTime {
    SystemTime::now()
}

/// Instant backed by `mock_instant`. Time only moves when a test calls
/// `MockClock::advance`, and the mock clock is thread local, so tests using
/// it must run on a current-thread runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockInstantWrapped;

impl MockInstantWrapped {
    pub fn advance(duration: Duration) {
        MockClock::advance(duration);
    }
}

impl InstantWrapper for MockInstantWrapped {
    fn unix_timestamp(&self) -> u64 {
        MockClock::time().as_secs()
    }

    fn now(&self) -> SystemTime {
        UNIX_EPOCH + MockClock::time()
    }
}
