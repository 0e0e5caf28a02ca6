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

use core::fmt;
use core::hash::Hash;
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_error::{Code, Error, make_err};
use buildfleet_util::collection_trait::{
    ChangeListener, DistributedMap, EntryEvent, EntryListener, KeyLockGuard, ListenerId,
};
use parking_lot::{Mutex, RwLock};
use tracing::{Level, event};

use crate::memory_cluster::ClusterState;

type KeyLocks<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

/// Drops the table entry for `key` once nobody but the table refers to it.
fn prune_key_lock<K: Eq + Hash>(
    key_locks: &Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
    key: &K,
    key_lock: Arc<tokio::sync::Mutex<()>>,
) {
    let mut locks = key_locks.lock();
    let unused = locks
        .get(key)
        .is_some_and(|existing| Arc::ptr_eq(existing, &key_lock))
        && Arc::strong_count(&key_lock) == 2;
    if unused {
        locks.remove(key);
    }
}

struct Listeners<K, V> {
    entry: Vec<(ListenerId, EntryListener<K, V>)>,
    change: Vec<(ListenerId, ChangeListener)>,
}

/// Map held in process memory. See `MemoryCluster`.
pub struct MemoryMap<K, V> {
    name: String,
    cluster: Arc<ClusterState>,
    entries: RwLock<HashMap<K, V>>,
    key_locks: KeyLocks<K>,
    listeners: RwLock<Listeners<K, V>>,
}

impl<K, V> fmt::Debug for MemoryMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("name", &self.name)
            .field("len", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl<K, V> MemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(name: String, cluster: Arc<ClusterState>) -> Self {
        Self {
            name,
            cluster,
            entries: RwLock::new(HashMap::new()),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            listeners: RwLock::new(Listeners {
                entry: Vec::new(),
                change: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while some caller holds the lock on `key`.
    pub fn is_locked(&self, key: &K) -> bool {
        self.key_locks
            .lock()
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Number of keys with a lock that is held or waited on.
    pub fn tracked_key_locks(&self) -> usize {
        self.key_locks.lock().len()
    }

    /// Must be called without holding `entries`.
    fn notify(&self, events: &[EntryEvent<K, V>]) {
        if events.is_empty() {
            return;
        }
        let (entry_listeners, change_listeners): (Vec<_>, Vec<_>) = {
            let listeners = self.listeners.read();
            (
                listeners.entry.iter().map(|(_, l)| l.clone()).collect(),
                listeners.change.iter().map(|(_, l)| l.clone()).collect(),
            )
        };
        for event in events {
            for listener in &entry_listeners {
                listener(event);
            }
        }
        for listener in &change_listeners {
            listener();
        }
    }
}

#[async_trait]
impl<K, V> DistributedMap<K, V> for MemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, Error> {
        self.cluster.check_available(&self.name, "get")?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, Error> {
        self.cluster.check_available(&self.name, "get_all")?;
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    async fn put(&self, key: K, value: V) -> Result<Option<V>, Error> {
        self.cluster.check_available(&self.name, "put")?;
        let previous = self.entries.write().insert(key.clone(), value.clone());
        let event = match &previous {
            Some(old_value) => EntryEvent::Updated {
                key,
                old_value: old_value.clone(),
                value,
            },
            None => EntryEvent::Added { key, value },
        };
        self.notify(&[event]);
        self.cluster.check_applied(&self.name, "put")?;
        Ok(previous)
    }

    async fn remove(&self, key: &K) -> Result<Option<V>, Error> {
        self.cluster.check_available(&self.name, "remove")?;
        let previous = self.entries.write().remove(key);
        if let Some(old_value) = &previous {
            self.notify(&[EntryEvent::Removed {
                key: key.clone(),
                old_value: old_value.clone(),
            }]);
        }
        self.cluster.check_applied(&self.name, "remove")?;
        Ok(previous)
    }

    async fn values(&self) -> Result<Vec<V>, Error> {
        self.cluster.check_available(&self.name, "values")?;
        Ok(self.entries.read().values().cloned().collect())
    }

    async fn key_set(&self) -> Result<HashSet<K>, Error> {
        self.cluster.check_available(&self.name, "key_set")?;
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn entry_set(&self) -> Result<Vec<(K, V)>, Error> {
        self.cluster.check_available(&self.name, "entry_set")?;
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn size(&self) -> Result<usize, Error> {
        self.cluster.check_available(&self.name, "size")?;
        Ok(self.entries.read().len())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.cluster.check_available(&self.name, "clear")?;
        let removed: Vec<_> = self
            .entries
            .write()
            .drain()
            .map(|(key, old_value)| EntryEvent::Removed { key, old_value })
            .collect();
        self.notify(&removed);
        Ok(())
    }

    async fn lock(&self, key: &K, timeout: Duration) -> Result<KeyLockGuard, Error> {
        self.cluster.check_available(&self.name, "lock")?;
        let key_lock = self
            .key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let Ok(guard) = tokio::time::timeout(timeout, key_lock.clone().lock_owned()).await else {
            prune_key_lock(&self.key_locks, key, key_lock);
            event!(
                Level::DEBUG,
                map_name = %self.name,
                ?timeout,
                "Timed out waiting for key lock"
            );
            return Err(make_err!(
                Code::DeadlineExceeded,
                "Could not lock key in '{}' within {timeout:?}",
                self.name
            ));
        };
        let key_locks = self.key_locks.clone();
        let key = key.clone();
        Ok(KeyLockGuard::new(move || {
            drop(guard);
            prune_key_lock(&key_locks, &key, key_lock);
        }))
    }

    fn add_entry_listener(&self, listener: EntryListener<K, V>) -> Result<ListenerId, Error> {
        self.cluster
            .check_available(&self.name, "add_entry_listener")?;
        let id = self.cluster.next_listener_id();
        self.listeners.write().entry.push((id, listener));
        Ok(id)
    }

    fn add_listener(&self, listener: ChangeListener) -> Result<ListenerId, Error> {
        self.cluster.check_available(&self.name, "add_listener")?;
        let id = self.cluster.next_listener_id();
        self.listeners.write().change.push((id, listener));
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "remove_listener")?;
        let mut listeners = self.listeners.write();
        let before = listeners.entry.len() + listeners.change.len();
        listeners.entry.retain(|(listener_id, _)| *listener_id != id);
        listeners.change.retain(|(listener_id, _)| *listener_id != id);
        Ok(before != listeners.entry.len() + listeners.change.len())
    }
}
