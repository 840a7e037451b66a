use std::collections::HashMap;
use std::sync::Arc;

use object_store::ObjectStore;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

use super::durable::{DurableMap, ObjectStoreMap};
use super::{QueuedRequest, RequestAborter, RequestQueue};

use async_trait::async_trait;

const ORDERING_KEY: &str = "ordering";

/// The persistence core shared by both queue shapes: an ordered key list in
/// one durable entry plus one value entry per key, mirrored in memory. Every
/// mutation rewrites the affected entries before control returns to the
/// caller, so a fresh instance over the same store reproduces the same head
/// and the same enumeration.
struct QueueCore {
    ordering_map: ObjectStoreMap,
    values_map: ObjectStoreMap,
    ordering: Vec<String>,
    values: HashMap<String, QueuedRequest>,
}

impl QueueCore {
    async fn open(store: Arc<dyn ObjectStore>, identifier: &str) -> Result<Self> {
        let ordering_map = ObjectStoreMap::new(store.clone(), &format!("{}_ordering", identifier));
        let values_map = ObjectStoreMap::new(store, &format!("{}_values", identifier));

        let persisted: Vec<String> = match ordering_map.get(ORDERING_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        let mut ordering = Vec::with_capacity(persisted.len());
        let mut values = HashMap::with_capacity(persisted.len());
        let mut skipped = false;
        for key in persisted {
            match values_map.get(&key).await? {
                Some(bytes) => {
                    values.insert(key.clone(), QueuedRequest::decode(&bytes)?);
                    ordering.push(key);
                }
                None => {
                    warn!("queue entry {} has no persisted value, skipping", key);
                    skipped = true;
                }
            }
        }
        let mut core = Self {
            ordering_map,
            values_map,
            ordering,
            values,
        };
        if skipped {
            core.persist_ordering().await?;
        }
        Ok(core)
    }

    async fn persist_ordering(&mut self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.ordering)?;
        self.ordering_map.set(ORDERING_KEY, bytes.into()).await
    }

    async fn write_value(&mut self, key: &str, request: &QueuedRequest) -> Result<()> {
        self.values_map.set(key, request.encode()?).await
    }

    async fn delete_value(&mut self, key: &str) -> Result<()> {
        self.values_map.delete(key).await
    }

    async fn insert(&mut self, key: String, request: QueuedRequest, at_head: bool) -> Result<()> {
        self.write_value(&key, &request).await?;
        self.values.insert(key.clone(), request);
        self.ordering.retain(|k| *k != key);
        if at_head {
            self.ordering.insert(0, key);
        } else {
            self.ordering.push(key);
        }
        self.persist_ordering().await
    }

    async fn pop_first(&mut self) -> Result<Option<QueuedRequest>> {
        while !self.ordering.is_empty() {
            let key = self.ordering.remove(0);
            self.persist_ordering().await?;
            let value = self.values.remove(&key);
            self.delete_value(&key).await?;
            match value {
                Some(request) => return Ok(Some(request)),
                None => warn!("queue ordering referenced missing value {}, skipping", key),
            }
        }
        Ok(None)
    }

    async fn remove_matching(
        &mut self,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedRequest>> {
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for key in std::mem::take(&mut self.ordering) {
            let matches = self.values.get(&key).map(|r| pred(r)).unwrap_or(false);
            if matches {
                if let Some(request) = self.values.remove(&key) {
                    self.delete_value(&key).await?;
                    removed.push(request);
                }
            } else {
                kept.push(key);
            }
        }
        self.ordering = kept;
        self.persist_ordering().await?;
        Ok(removed)
    }

    /// Atomic rebuild of both maps from transformed entries. The new key of
    /// each entry is supplied by the caller and may differ from the old one.
    async fn rebuild(
        &mut self,
        entries: Vec<(String, QueuedRequest)>,
    ) -> Result<()> {
        for key in std::mem::take(&mut self.ordering) {
            self.delete_value(&key).await?;
        }
        self.values.clear();
        for (key, request) in entries {
            if self.values.contains_key(&key) {
                // Transformed keys may collide; the earlier position wins and
                // the later value overwrites it.
                warn!("rebuild produced duplicate key {}, keeping later value", key);
            } else {
                self.ordering.push(key.clone());
            }
            self.write_value(&key, &request).await?;
            self.values.insert(key, request);
        }
        self.persist_ordering().await
    }

    fn contents(&self) -> Vec<QueuedRequest> {
        self.ordering
            .iter()
            .filter_map(|key| self.values.get(key).cloned())
            .collect()
    }
}

/// The default queue shape: a durable FIFO keyed by each request's token.
pub struct PersistedQueue {
    core: Mutex<QueueCore>,
}

impl PersistedQueue {
    pub async fn open(store: Arc<dyn ObjectStore>, identifier: &str) -> Result<Self> {
        Ok(Self {
            core: Mutex::new(QueueCore::open(store, identifier).await?),
        })
    }
}

#[async_trait]
impl RequestQueue for PersistedQueue {
    async fn append(&self, request: QueuedRequest) -> Result<()> {
        let mut core = self.core.lock().await;
        let key = request.token.to_string();
        core.insert(key, request, false).await
    }

    async fn prepend(&self, request: QueuedRequest) -> Result<()> {
        let mut core = self.core.lock().await;
        let key = request.token.to_string();
        core.insert(key, request, true).await
    }

    async fn pop_first(&self) -> Result<Option<QueuedRequest>> {
        self.core.lock().await.pop_first().await
    }

    async fn remove_matching(
        &self,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedRequest>> {
        self.core.lock().await.remove_matching(pred).await
    }

    async fn map_requests(
        &self,
        f: &(dyn Fn(QueuedRequest) -> QueuedRequest + Send + Sync),
    ) -> Result<()> {
        let mut core = self.core.lock().await;
        let entries = core
            .contents()
            .into_iter()
            .map(|request| {
                let transformed = f(request);
                (transformed.token.to_string(), transformed)
            })
            .collect();
        core.rebuild(entries).await
    }

    async fn contents(&self) -> Result<Vec<QueuedRequest>> {
        Ok(self.core.lock().await.contents())
    }
}

/// A queue that coalesces entries by a caller-supplied key. Appending over an
/// existing key aborts the displaced request through the registered aborter;
/// prepending an already-present key aborts the incoming request instead,
/// since a prepend is a reschedule rather than an upsert.
pub struct UniquingQueue {
    core: Mutex<QueueCore>,
    uniq: Box<dyn Fn(&QueuedRequest) -> String + Send + Sync>,
    aborter: std::sync::Mutex<Option<Arc<dyn RequestAborter>>>,
}

impl UniquingQueue {
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        identifier: &str,
        uniq: impl Fn(&QueuedRequest) -> String + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            core: Mutex::new(QueueCore::open(store, identifier).await?),
            uniq: Box::new(uniq),
            aborter: std::sync::Mutex::new(None),
        })
    }

    pub fn set_aborter(&self, aborter: Arc<dyn RequestAborter>) {
        *self.aborter.lock().unwrap() = Some(aborter);
    }

    async fn abort(&self, request: QueuedRequest) {
        let aborter = self.aborter.lock().unwrap().clone();
        match aborter {
            Some(aborter) => aborter.abort_request(request).await,
            None => warn!(
                "displaced request {} dropped without an aborter",
                request.token
            ),
        }
    }
}

#[async_trait]
impl RequestQueue for UniquingQueue {
    async fn append(&self, request: QueuedRequest) -> Result<()> {
        let key = (self.uniq)(&request);
        let displaced = {
            let mut core = self.core.lock().await;
            let displaced = core.values.get(&key).cloned();
            core.insert(key.clone(), request, false).await?;
            displaced
        };
        if let Some(displaced) = displaced {
            debug!("coalesced queued request {} under key {}", displaced.token, key);
            self.abort(displaced).await;
        }
        Ok(())
    }

    async fn prepend(&self, request: QueuedRequest) -> Result<()> {
        let key = (self.uniq)(&request);
        {
            let mut core = self.core.lock().await;
            if !core.values.contains_key(&key) {
                return core.insert(key, request, true).await;
            }
        }
        self.abort(request).await;
        Ok(())
    }

    async fn pop_first(&self) -> Result<Option<QueuedRequest>> {
        self.core.lock().await.pop_first().await
    }

    async fn remove_matching(
        &self,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedRequest>> {
        self.core.lock().await.remove_matching(pred).await
    }

    async fn map_requests(
        &self,
        f: &(dyn Fn(QueuedRequest) -> QueuedRequest + Send + Sync),
    ) -> Result<()> {
        let mut core = self.core.lock().await;
        let entries = core
            .contents()
            .into_iter()
            .map(|request| {
                let transformed = f(request);
                ((self.uniq)(&transformed), transformed)
            })
            .collect();
        core.rebuild(entries).await
    }

    async fn contents(&self) -> Result<Vec<QueuedRequest>> {
        Ok(self.core.lock().await.contents())
    }
}
