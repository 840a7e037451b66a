use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::request::RequestConfig;

pub mod durable;
pub mod persisted;
pub mod processor;
pub mod scheduler;

pub use durable::{DurableMap, ObjectStoreMap, QUEUE_VERSION_SUFFIX};
pub use persisted::{PersistedQueue, UniquingQueue};
pub use processor::{Processor, QueueDelegate, RequestOutcome, ResponseHandler};
pub use scheduler::{ProcessDriver, ProcessingResult, Scheduler};

/// One entry of a durable queue: the wrapped config plus the bookkeeping the
/// processor needs. The token keys the on-disk in-flight cache entry and
/// identifies the request across its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub config: RequestConfig,
    /// Opaque serialized identifier payload carried for response handlers.
    pub identifiers: Option<Vec<u8>>,
    pub timestamp_ns: u64,
    pub token: Uuid,
}

impl QueuedRequest {
    pub fn new(config: RequestConfig) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            config,
            identifiers: None,
            timestamp_ns,
            token: Uuid::new_v4(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The durable queue contract shared by the FIFO and uniquing shapes. Every
/// mutation is flushed to disk before it returns and serialized against all
/// other operations on the instance.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    async fn append(&self, request: QueuedRequest) -> Result<()>;
    async fn prepend(&self, request: QueuedRequest) -> Result<()>;
    async fn pop_first(&self) -> Result<Option<QueuedRequest>>;

    /// Removes entries satisfying the predicate, returning them in their
    /// queue order.
    async fn remove_matching(
        &self,
        pred: &(dyn for<'a> Fn(&'a QueuedRequest) -> bool + Send + Sync),
    ) -> Result<Vec<QueuedRequest>>;

    /// Atomically rebuilds the queue by transforming every entry.
    async fn map_requests(
        &self,
        f: &(dyn Fn(QueuedRequest) -> QueuedRequest + Send + Sync),
    ) -> Result<()>;

    /// The current entries in queue order.
    async fn contents(&self) -> Result<Vec<QueuedRequest>>;
}

/// Receives requests displaced from a uniquing queue so their owners can be
/// told the request was aborted. Implemented by the queue processor.
#[async_trait]
pub trait RequestAborter: Send + Sync {
    async fn abort_request(&self, request: QueuedRequest);
}

type RegistryKey = (String, String);

static REGISTRY: OnceLock<Mutex<HashMap<RegistryKey, Weak<dyn RequestQueue>>>> = OnceLock::new();

/// Weak-valued registry of queue instances keyed by `(client_id, identifier)`
/// so callers share one queue per identity, while a released owner lets the
/// queue be reclaimed. Dead entries are pruned on access.
pub fn shared_queue<F>(
    client_id: &str,
    identifier: &str,
    create: F,
) -> std::sync::Arc<dyn RequestQueue>
where
    F: FnOnce() -> std::sync::Arc<dyn RequestQueue>,
{
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut registry = registry.lock().unwrap();
    registry.retain(|_, weak| weak.strong_count() > 0);
    let key = (client_id.to_string(), identifier.to_string());
    if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let queue = create();
    registry.insert(key, std::sync::Arc::downgrade(&queue));
    queue
}
