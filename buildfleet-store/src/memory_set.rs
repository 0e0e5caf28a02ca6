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
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_error::Error;
use buildfleet_util::collection_trait::{
    ChangeListener, DistributedSet, ItemEvent, ItemListener, ListenerId,
};
use parking_lot::RwLock;

use crate::memory_cluster::ClusterState;

struct Listeners<T> {
    item: Vec<(ListenerId, ItemListener<T>)>,
    change: Vec<(ListenerId, ChangeListener)>,
}

/// Set held in process memory. See `MemoryCluster`.
pub struct MemorySet<T> {
    name: String,
    cluster: Arc<ClusterState>,
    items: RwLock<HashSet<T>>,
    listeners: RwLock<Listeners<T>>,
}

impl<T> fmt::Debug for MemorySet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySet")
            .field("name", &self.name)
            .field("len", &self.items.read().len())
            .finish_non_exhaustive()
    }
}

impl<T> MemorySet<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub(crate) fn new(name: String, cluster: Arc<ClusterState>) -> Self {
        Self {
            name,
            cluster,
            items: RwLock::new(HashSet::new()),
            listeners: RwLock::new(Listeners {
                item: Vec::new(),
                change: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, events: Vec<ItemEvent<T>>) {
        if events.is_empty() {
            return;
        }
        let (item_listeners, change_listeners): (Vec<_>, Vec<_>) = {
            let listeners = self.listeners.read();
            (
                listeners.item.iter().map(|(_, l)| l.clone()).collect(),
                listeners.change.iter().map(|(_, l)| l.clone()).collect(),
            )
        };
        for event in &events {
            for listener in &item_listeners {
                listener(event);
            }
        }
        for listener in &change_listeners {
            listener();
        }
    }
}

#[async_trait]
impl<T> DistributedSet<T> for MemorySet<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    async fn add(&self, item: T) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "add")?;
        let inserted = self.items.write().insert(item.clone());
        if inserted {
            self.notify(vec![ItemEvent::Added(item)]);
        }
        self.cluster.check_applied(&self.name, "add")?;
        Ok(inserted)
    }

    async fn add_all(&self, items: Vec<T>) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "add_all")?;
        let added: Vec<_> = {
            let mut set = self.items.write();
            items
                .into_iter()
                .filter(|item| set.insert(item.clone()))
                .map(ItemEvent::Added)
                .collect()
        };
        let changed = !added.is_empty();
        self.notify(added);
        Ok(changed)
    }

    async fn remove(&self, item: &T) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "remove")?;
        let removed = self.items.write().remove(item);
        if removed {
            self.notify(vec![ItemEvent::Removed(item.clone())]);
        }
        self.cluster.check_applied(&self.name, "remove")?;
        Ok(removed)
    }

    async fn remove_all(&self, items: &[T]) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "remove_all")?;
        let removed: Vec<_> = {
            let mut set = self.items.write();
            items
                .iter()
                .filter(|item| set.remove(*item))
                .map(|item| ItemEvent::Removed(item.clone()))
                .collect()
        };
        let changed = !removed.is_empty();
        self.notify(removed);
        Ok(changed)
    }

    async fn contains(&self, item: &T) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "contains")?;
        Ok(self.items.read().contains(item))
    }

    async fn contains_all(&self, items: &[T]) -> Result<bool, Error> {
        self.cluster.check_available(&self.name, "contains_all")?;
        let set = self.items.read();
        Ok(items.iter().all(|item| set.contains(item)))
    }

    async fn size(&self) -> Result<usize, Error> {
        self.cluster.check_available(&self.name, "size")?;
        Ok(self.items.read().len())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.cluster.check_available(&self.name, "clear")?;
        let removed: Vec<_> = self.items.write().drain().map(ItemEvent::Removed).collect();
        self.notify(removed);
        Ok(())
    }

    async fn values(&self) -> Result<Vec<T>, Error> {
        self.cluster.check_available(&self.name, "values")?;
        Ok(self.items.read().iter().cloned().collect())
    }

    fn add_item_listener(&self, listener: ItemListener<T>) -> Result<ListenerId, Error> {
        self.cluster.check_available(&self.name, "add_item_listener")?;
        let id = self.cluster.next_listener_id();
        self.listeners.write().item.push((id, listener));
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
        let before = listeners.item.len() + listeners.change.len();
        listeners.item.retain(|(listener_id, _)| *listener_id != id);
        listeners.change.retain(|(listener_id, _)| *listener_id != id);
        Ok(before != listeners.item.len() + listeners.change.len())
    }
}
