// Copyright 2026 O7 Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Keyed object store interface and in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::error::StoreError;

/// Change notification emitted by a store on every successful write.
///
/// Subsystems that mirror store state in memory (IAM, bucket metadata)
/// consume these to perform targeted reloads.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Full key of the changed object.
    pub path: String,
    /// True when the object was deleted rather than written.
    pub removed: bool,
}

/// Keyed object store for configuration records.
///
/// Keys are `/`-separated hierarchical paths. Values are opaque bytes;
/// callers layer their own serialization on top.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes an object, overwriting any previous value.
    async fn put_object(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Reads an object. Fails with `NotFound` when absent.
    async fn get_object(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Deletes an object. Fails with `NotFound` when absent.
    async fn delete_object(&self, path: &str) -> Result<(), StoreError>;

    /// Lists all keys under the given prefix.
    ///
    /// Fails with `ContainerNotFound` when the backing container itself
    /// does not exist; callers enumerating optional collections treat
    /// that as an empty result.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// In-memory object store.
///
/// Backs single-node deployments and tests. All operations are linearized
/// through one `RwLock`; change events are broadcast to subscribers and
/// silently dropped when nobody listens.
pub struct MemObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemObjectStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        })
    }

    fn notify(&self, path: &str, removed: bool) {
        // A send error only means there are no subscribers.
        let _ = self.events.send(StoreEvent {
            path: path.to_string(),
            removed,
        });
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn put_object(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        objects.insert(path.to_string(), data.to_vec());
        drop(objects);
        self.notify(path, false);
        Ok(())
    }

    async fn get_object(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.read().await;
        objects.get(path).cloned().ok_or_else(|| StoreError::NotFound {
            key: path.to_string(),
        })
    }

    async fn delete_object(&self, path: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        if objects.remove(path).is_none() {
            return Err(StoreError::NotFound {
                key: path.to_string(),
            });
        }
        drop(objects);
        self.notify(path, true);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
