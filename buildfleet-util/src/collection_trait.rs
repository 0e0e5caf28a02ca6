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

//! Contracts of the cluster-replicated collections every coordinator
//! instance shares.
//!
//! Every operation may fail with `Code::Unavailable` when the cluster cannot
//! be reached. A write may have been applied even though an error was
//! returned, so callers must be prepared to repeat any operation.

use core::fmt;
use core::hash::Hash;
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_error::Error;

/// Handle returned when registering a listener. Pass it back to
/// `remove_listener` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A single change to a map entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEvent<K, V> {
    Added { key: K, value: V },
    Updated { key: K, old_value: V, value: V },
    Removed { key: K, old_value: V },
}

impl<K, V> EntryEvent<K, V> {
    pub const fn key(&self) -> &K {
        match self {
            Self::Added { key, .. } | Self::Updated { key, .. } | Self::Removed { key, .. } => key,
        }
    }
}

/// A single change to set membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemEvent<T> {
    Added(T),
    Removed(T),
}

/// Listeners are invoked after the change has been applied and never while
/// the collection holds an internal lock, so a listener may call back into
/// the collection. Delivery is a wake-up hint: listeners must re-read state
/// rather than trust the event to be the latest.
pub type EntryListener<K, V> = Arc<dyn Fn(&EntryEvent<K, V>) + Send + Sync>;
pub type ItemListener<T> = Arc<dyn Fn(&ItemEvent<T>) + Send + Sync>;
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Cluster-wide exclusive lock on one key. Released when `unlock` is called
/// or the guard is dropped, whichever happens first.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyLockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyLockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unlock(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Cluster-replicated key/value map.
#[async_trait]
pub trait DistributedMap<K, V>: Send + Sync + 'static
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, Error>;

    /// Batch lookup. Missing keys are absent from the result.
    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, Error>;

    /// Stores `value` and returns the value it replaced.
    async fn put(&self, key: K, value: V) -> Result<Option<V>, Error>;

    /// Removes the entry and returns it. Of several concurrent callers
    /// removing the same key, exactly one receives `Some`.
    async fn remove(&self, key: &K) -> Result<Option<V>, Error>;

    async fn values(&self) -> Result<Vec<V>, Error>;

    async fn key_set(&self) -> Result<HashSet<K>, Error>;

    async fn entry_set(&self) -> Result<Vec<(K, V)>, Error>;

    async fn size(&self) -> Result<usize, Error>;

    async fn clear(&self) -> Result<(), Error>;

    /// Takes the cluster-wide lock on `key`, waiting at most `timeout`.
    /// Fails with `Code::DeadlineExceeded` if the lock is still held by
    /// someone else when the timeout elapses. Locks are not reentrant.
    async fn lock(&self, key: &K, timeout: Duration) -> Result<KeyLockGuard, Error>;

    fn add_entry_listener(&self, listener: EntryListener<K, V>) -> Result<ListenerId, Error>;

    /// Coarse listener fired once for every change of any kind.
    fn add_listener(&self, listener: ChangeListener) -> Result<ListenerId, Error>;

    /// Returns false if no listener with that id was registered.
    fn remove_listener(&self, id: ListenerId) -> Result<bool, Error>;
}

/// Cluster-replicated set.
#[async_trait]
pub trait DistributedSet<T>: Send + Sync + 'static
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Returns true if the item was not yet a member.
    async fn add(&self, item: T) -> Result<bool, Error>;

    /// Returns true if membership changed.
    async fn add_all(&self, items: Vec<T>) -> Result<bool, Error>;

    /// Returns true if the item was a member.
    async fn remove(&self, item: &T) -> Result<bool, Error>;

    /// Returns true if membership changed.
    async fn remove_all(&self, items: &[T]) -> Result<bool, Error>;

    async fn contains(&self, item: &T) -> Result<bool, Error>;

    async fn contains_all(&self, items: &[T]) -> Result<bool, Error>;

    async fn size(&self) -> Result<usize, Error>;

    async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.size().await? == 0)
    }

    async fn clear(&self) -> Result<(), Error>;

    async fn values(&self) -> Result<Vec<T>, Error>;

    fn add_item_listener(&self, listener: ItemListener<T>) -> Result<ListenerId, Error>;

    fn add_listener(&self, listener: ChangeListener) -> Result<ListenerId, Error>;

    fn remove_listener(&self, id: ListenerId) -> Result<bool, Error>;
}
