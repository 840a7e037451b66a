use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;

use crate::error::Result;

/// Version suffix embedded in every on-disk base path. Breaking changes to a
/// persisted value schema require bumping this and migrating.
pub const QUEUE_VERSION_SUFFIX: &str = "_9_8_0";

/// A byte-keyed durable map. Writes are flushed by the backing store before
/// the call returns, so a crash after any operation leaves the map readable
/// by a fresh instance.
#[async_trait]
pub trait DurableMap: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn clear(&self) -> Result<()>;
}

/// [DurableMap] over an [ObjectStore], scoping every key under a versioned
/// base path. `object_store::local::LocalFileSystem` backs production use;
/// tests run on `object_store::memory::InMemory`.
pub struct ObjectStoreMap {
    store: Arc<dyn ObjectStore>,
    base: StorePath,
}

impl ObjectStoreMap {
    pub fn new(store: Arc<dyn ObjectStore>, base_identifier: &str) -> Self {
        let base = StorePath::from(format!("{}{}", base_identifier, QUEUE_VERSION_SUFFIX));
        Self { store, base }
    }

    fn location(&self, key: &str) -> StorePath {
        self.base.child(key)
    }
}

#[async_trait]
impl DurableMap for ObjectStoreMap {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.store.get(&self.location(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.store.put(&self.location(key), value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&self.location(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let metas: Vec<_> = self
            .store
            .list(Some(&self.base))
            .try_collect()
            .await?;
        Ok(metas
            .into_iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}
