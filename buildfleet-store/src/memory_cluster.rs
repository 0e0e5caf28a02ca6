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

use core::any::{Any, type_name};
use core::hash::Hash;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use buildfleet_error::{Code, Error, make_cluster_unavailable_err, make_err};
use buildfleet_util::collection_trait::ListenerId;
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::memory_map::MemoryMap;
use crate::memory_set::MemorySet;

type NamedCollections = Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>;

/// State shared by every collection handed out by one `MemoryCluster`.
#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    /// Per collection name, writes that still apply but report failure.
    fail_after_apply: Mutex<HashMap<String, usize>>,
    next_listener_id: AtomicU64,
}

impl ClusterState {
    /// Fails with `Code::Unavailable` while the cluster is partitioned or an
    /// injected failure is pending.
    pub(crate) fn check_available(&self, collection: &str, operation: &str) -> Result<(), Error> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(make_cluster_unavailable_err!(
                "Cluster unavailable during {operation} on '{collection}'"
            ));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(make_cluster_unavailable_err!(
                "Injected cluster failure during {operation} on '{collection}'"
            ));
        }
        Ok(())
    }

    /// Called after a write was applied. Fails with `Code::Unavailable` if
    /// an applied-then-failing write is pending for `collection`.
    pub(crate) fn check_applied(&self, collection: &str, operation: &str) -> Result<(), Error> {
        let mut pending = self.fail_after_apply.lock();
        let Some(remaining) = pending.get_mut(collection) else {
            return Ok(());
        };
        *remaining -= 1;
        if *remaining == 0 {
            pending.remove(collection);
        }
        Err(make_cluster_unavailable_err!(
            "Injected cluster failure after {operation} on '{collection}' was applied"
        ))
    }

    pub(crate) fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// In-process stand-in for a cluster of replicated collections. Every
/// handle obtained from clones of the same `MemoryCluster` under the same
/// name refers to the same data, so several coordinators built from one
/// cluster behave like separate server instances sharing state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
    maps: Arc<NamedCollections>,
    sets: Arc<NamedCollections>,
}

impl core::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("state", &self.state)
            .field("maps", &self.maps.lock().keys().cloned().collect::<Vec<_>>())
            .field("sets", &self.sets.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the map registered under `name`, creating it on first use.
    /// Requesting an existing name with different key or value types is an
    /// error.
    pub fn map<K, V>(&self, name: &str) -> Result<Arc<MemoryMap<K, V>>, Error>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut maps = self.maps.lock();
        let entry = maps
            .entry(name.to_string())
            .or_insert_with(|| {
                event!(Level::DEBUG, map_name = name, "Creating distributed map");
                let map: Arc<dyn Any + Send + Sync> =
                    Arc::new(MemoryMap::<K, V>::new(name.to_string(), self.state.clone()));
                map
            })
            .clone();
        entry.downcast::<MemoryMap<K, V>>().map_err(|_| {
            make_err!(
                Code::InvalidArgument,
                "Map '{name}' already exists with types other than ({}, {})",
                type_name::<K>(),
                type_name::<V>()
            )
        })
    }

    /// Returns the set registered under `name`, creating it on first use.
    pub fn set<T>(&self, name: &str) -> Result<Arc<MemorySet<T>>, Error>
    where
        T: Clone + Eq + Hash + Send + Sync + 'static,
    {
        let mut sets = self.sets.lock();
        let entry = sets
            .entry(name.to_string())
            .or_insert_with(|| {
                event!(Level::DEBUG, set_name = name, "Creating distributed set");
                let set: Arc<dyn Any + Send + Sync> =
                    Arc::new(MemorySet::<T>::new(name.to_string(), self.state.clone()));
                set
            })
            .clone();
        entry.downcast::<MemorySet<T>>().map_err(|_| {
            make_err!(
                Code::InvalidArgument,
                "Set '{name}' already exists with an item type other than {}",
                type_name::<T>()
            )
        })
    }

    /// Simulates a partition. While unavailable every collection operation
    /// fails with `Code::Unavailable`. Data is retained.
    pub fn set_available(&self, available: bool) {
        event!(Level::INFO, available, "Cluster availability changed");
        self.state.unavailable.store(!available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::Acquire)
    }

    /// Makes exactly the next `count` collection operations, across all
    /// collections of this cluster, fail with `Code::Unavailable` without
    /// being applied.
    pub fn fail_next_operations(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::Release);
    }

    /// Makes the next `count` writes to the collection named `collection`
    /// apply and notify listeners, then fail with `Code::Unavailable`. The
    /// caller cannot tell such a write from one that never landed.
    pub fn fail_next_writes_after_apply(&self, collection: &str, count: usize) {
        let mut pending = self.state.fail_after_apply.lock();
        if count == 0 {
            pending.remove(collection);
        } else {
            pending.insert(collection.to_string(), count);
        }
    }
}
