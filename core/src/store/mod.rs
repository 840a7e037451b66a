use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreErrorKind, StrataError};
use crate::model::entity::Entity;
use crate::model::identifier::Identifier;
use crate::model::query::{EndpointMetadata, Query};

pub mod memory;
pub mod remote;

pub use memory::MemoryStore;
pub use remote::{RemoteEndpoints, RemoteStore};

/// Where an engine sits in the stack. Local levels are read in ascending
/// order (memory before disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StoreLevel {
    Memory,
    Disk,
    Remote,
}

impl StoreLevel {
    pub fn is_local(&self) -> bool {
        !matches!(self, StoreLevel::Remote)
    }
}

/// The read context of a query: which side of the stack serves it and how
/// misses and failures cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    Local,
    Remote,
    /// Remote, falling back to local on a designated class of failures.
    RemoteOrLocal,
    /// Local answers immediately; the remote read completes in the
    /// background and raises events.
    LocalThenRemote,
    /// Local answers when it can; the remote read runs only on a miss.
    LocalOrRemote,
}

impl DataSource {
    pub fn reads_remote(&self) -> bool {
        !matches!(self, DataSource::Local)
    }

    /// The context continuous rebuilds use so repeated emissions do not
    /// trigger unbounded refetches.
    pub fn demoted_for_rebuild(&self) -> DataSource {
        match self {
            DataSource::Local => DataSource::Local,
            _ => DataSource::LocalOrRemote,
        }
    }
}

/// Which stores a write reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteContext {
    Local,
    Remote,
    LocalAndRemote,
}

impl WriteContext {
    pub fn writes_local(&self) -> bool {
        !matches!(self, WriteContext::Remote)
    }

    pub fn writes_remote(&self) -> bool {
        !matches!(self, WriteContext::Local)
    }
}

/// A search served by one side of the stack. `complete` reports whether the
/// entities are the full result set for the query, which governs local
/// replacement on persist.
#[derive(Debug, Clone)]
pub struct StoreSearch<E> {
    pub entities: Vec<E>,
    pub metadata: Option<EndpointMetadata>,
    pub complete: bool,
}

impl<E> StoreSearch<E> {
    pub fn local(entities: Vec<E>) -> Self {
        Self {
            entities,
            metadata: None,
            complete: true,
        }
    }
}

/// One store engine behind the stack. An engine that does not service an
/// operation returns `Store(NotApplicable)`, which the stack skips.
#[async_trait]
pub trait StoreEngine<E: Entity>: Send + Sync {
    fn level(&self) -> StoreLevel;

    async fn get(&self, query: &Query) -> Result<Option<E>>;
    async fn search(&self, query: &Query) -> Result<StoreSearch<E>>;
    async fn set_many(&self, entities: Vec<E>) -> Result<Vec<E>>;
    async fn remove_many(&self, ids: &[Identifier]) -> Result<()>;
    async fn remove_all(&self, query: &Query) -> Result<Vec<Identifier>>;

    async fn set(&self, entity: E) -> Result<E> {
        let mut written = self.set_many(vec![entity]).await?;
        written.pop().ok_or_else(|| {
            StrataError::Logical("set_many returned no entity for a single write".to_string())
        })
    }

    async fn remove(&self, id: &Identifier) -> Result<()> {
        self.remove_many(std::slice::from_ref(id)).await
    }
}

/// Invoked with locally committed entities before the remote write resolves.
pub type CommitHook<E> = Arc<dyn Fn(Vec<E>) -> BoxFuture<'static, ()> + Send + Sync>;
/// Invoked with locally removed identifiers before the remote write resolves.
pub type RemoveHook = Arc<dyn Fn(Vec<Identifier>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The ordered set of engines backing one entity type. Reads are routed by
/// [DataSource]; writes by [WriteContext]. The `LocalThenRemote` and
/// `LocalOrRemote` contexts are sequenced above the stack, by the manager.
pub struct StoreStack<E: Entity> {
    engines: Vec<Arc<dyn StoreEngine<E>>>,
}

impl<E: Entity> StoreStack<E> {
    pub fn new(mut engines: Vec<Arc<dyn StoreEngine<E>>>) -> Self {
        engines.sort_by_key(|e| e.level());
        Self { engines }
    }

    fn locals(&self) -> impl Iterator<Item = &Arc<dyn StoreEngine<E>>> {
        self.engines.iter().filter(|e| e.level().is_local())
    }

    fn remotes(&self) -> impl Iterator<Item = &Arc<dyn StoreEngine<E>>> {
        self.engines.iter().filter(|e| !e.level().is_local())
    }

    pub fn has_remote(&self) -> bool {
        self.remotes().next().is_some()
    }

    /// A single-entity read in the given context. `LocalThenRemote` and
    /// `LocalOrRemote` must not reach this layer.
    pub async fn get(&self, query: &Query, source: DataSource) -> Result<Option<E>> {
        match source {
            DataSource::Local => self.get_local(query).await,
            DataSource::Remote => self.get_remote(query).await,
            DataSource::RemoteOrLocal => match self.get_remote(query).await {
                Ok(found) => Ok(found),
                Err(err) if err.is_fallback_eligible() => {
                    debug!("remote read failed ({}), falling back to local", err);
                    self.get_local(query).await
                }
                Err(err) => Err(err),
            },
            DataSource::LocalThenRemote | DataSource::LocalOrRemote => Err(
                StrataError::NotSupported("compound read context inside the stack".to_string()),
            ),
        }
    }

    pub async fn get_local(&self, query: &Query) -> Result<Option<E>> {
        for engine in self.locals() {
            match engine.get(query).await {
                Ok(Some(entity)) => return Ok(Some(entity)),
                Ok(None) => continue,
                Err(StrataError::Store(StoreErrorKind::NotApplicable)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    pub async fn get_remote(&self, query: &Query) -> Result<Option<E>> {
        for engine in self.remotes() {
            match engine.get(query).await {
                Err(StrataError::Store(StoreErrorKind::NotApplicable)) => continue,
                other => return other,
            }
        }
        Err(StrataError::NotSupported(
            "no remote store configured".to_string(),
        ))
    }

    pub async fn search(&self, query: &Query, source: DataSource) -> Result<StoreSearch<E>> {
        match source {
            DataSource::Local => self.search_local(query).await,
            DataSource::Remote => self.search_remote(query).await,
            DataSource::RemoteOrLocal => match self.search_remote(query).await {
                Ok(found) => Ok(found),
                Err(err) if err.is_fallback_eligible() => {
                    debug!("remote search failed ({}), falling back to local", err);
                    self.search_local(query).await
                }
                Err(err) => Err(err),
            },
            DataSource::LocalThenRemote | DataSource::LocalOrRemote => Err(
                StrataError::NotSupported("compound read context inside the stack".to_string()),
            ),
        }
    }

    /// Merges local results level by level, first level wins per identifier.
    pub async fn search_local(&self, query: &Query) -> Result<StoreSearch<E>> {
        let mut entities: Vec<E> = Vec::new();
        for engine in self.locals() {
            match engine.search(query).await {
                Ok(found) => entities.extend(found.entities),
                Err(StrataError::Store(StoreErrorKind::NotApplicable)) => continue,
                Err(err) => return Err(err),
            }
        }
        let entities = entities
            .into_iter()
            .unique_by(|e| e.identifier())
            .collect();
        Ok(StoreSearch::local(entities))
    }

    pub async fn search_remote(&self, query: &Query) -> Result<StoreSearch<E>> {
        for engine in self.remotes() {
            match engine.search(query).await {
                Err(StrataError::Store(StoreErrorKind::NotApplicable)) => continue,
                other => return other,
            }
        }
        Err(StrataError::NotSupported(
            "no remote store configured".to_string(),
        ))
    }

    /// Writes through the stack. For `LocalAndRemote` the remote write is
    /// dispatched first, locals commit while it is in flight, and the hook
    /// observes the local commit before the remote resolves. The entities
    /// returned are the remote's canonical ones when a remote took part.
    pub async fn write(
        &self,
        entities: Vec<E>,
        context: WriteContext,
        on_local_commit: Option<CommitHook<E>>,
    ) -> Result<Vec<E>> {
        let remote_write = if context.writes_remote() {
            let engines: Vec<_> = self.remotes().cloned().collect();
            if engines.is_empty() && context == WriteContext::Remote {
                return Err(StrataError::NotSupported(
                    "no remote store configured".to_string(),
                ));
            }
            let payload = entities.clone();
            Some(tokio::spawn(async move {
                write_engines(engines, payload).await
            }))
        } else {
            None
        };

        let mut committed = entities;
        if context.writes_local() {
            let engines: Vec<_> = self.locals().cloned().collect();
            committed = write_engines(engines, committed).await?;
            if let Some(hook) = on_local_commit {
                hook(committed.clone()).await;
            }
        }

        match remote_write {
            None => Ok(committed),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(StrataError::Logical(format!(
                    "remote write task failed: {}",
                    e
                ))),
            },
        }
    }

    /// Removes through the stack with the same sequencing as [Self::write].
    pub async fn remove(
        &self,
        ids: Vec<Identifier>,
        context: WriteContext,
        on_local_commit: Option<RemoveHook>,
    ) -> Result<()> {
        let remote_remove = if context.writes_remote() {
            let engines: Vec<_> = self.remotes().cloned().collect();
            if engines.is_empty() && context == WriteContext::Remote {
                return Err(StrataError::NotSupported(
                    "no remote store configured".to_string(),
                ));
            }
            let payload = ids.clone();
            Some(tokio::spawn(async move {
                remove_engines(engines, payload).await
            }))
        } else {
            None
        };

        if context.writes_local() {
            let engines: Vec<_> = self.locals().cloned().collect();
            remove_engines(engines, ids.clone()).await?;
            if let Some(hook) = on_local_commit {
                hook(ids).await;
            }
        }

        match remote_remove {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(StrataError::Logical(format!(
                    "remote remove task failed: {}",
                    e
                ))),
            },
        }
    }
}

async fn write_engines<E: Entity>(
    engines: Vec<Arc<dyn StoreEngine<E>>>,
    mut entities: Vec<E>,
) -> Result<Vec<E>> {
    for engine in engines {
        match engine.set_many(entities.clone()).await {
            Ok(written) => entities = written,
            Err(StrataError::Store(StoreErrorKind::NotApplicable)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(entities)
}

async fn remove_engines<E: Entity>(
    engines: Vec<Arc<dyn StoreEngine<E>>>,
    ids: Vec<Identifier>,
) -> Result<()> {
    for engine in engines {
        match engine.remove_many(&ids).await {
            Ok(()) => {}
            Err(StrataError::Store(StoreErrorKind::NotApplicable)) => {
                warn!("store engine skipped a remove it does not service");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;
    use crate::model::entity::fixtures::TestPost;

    struct FailingRemote {
        kind: StoreErrorKind,
    }

    #[async_trait]
    impl StoreEngine<TestPost> for FailingRemote {
        fn level(&self) -> StoreLevel {
            StoreLevel::Remote
        }

        async fn get(&self, _query: &Query) -> Result<Option<TestPost>> {
            Err(StrataError::Store(self.kind.clone()))
        }

        async fn search(&self, _query: &Query) -> Result<StoreSearch<TestPost>> {
            Err(StrataError::Store(self.kind.clone()))
        }

        async fn set_many(&self, _entities: Vec<TestPost>) -> Result<Vec<TestPost>> {
            Err(StrataError::Store(self.kind.clone()))
        }

        async fn remove_many(&self, _ids: &[Identifier]) -> Result<()> {
            Err(StrataError::Store(self.kind.clone()))
        }

        async fn remove_all(&self, _query: &Query) -> Result<Vec<Identifier>> {
            Err(StrataError::Store(self.kind.clone()))
        }
    }

    struct SlowRemote {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl StoreEngine<TestPost> for SlowRemote {
        fn level(&self) -> StoreLevel {
            StoreLevel::Remote
        }

        async fn get(&self, _query: &Query) -> Result<Option<TestPost>> {
            Ok(None)
        }

        async fn search(&self, _query: &Query) -> Result<StoreSearch<TestPost>> {
            Ok(StoreSearch::local(Vec::new()))
        }

        async fn set_many(&self, entities: Vec<TestPost>) -> Result<Vec<TestPost>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.log.lock().unwrap().push("remote");
            Ok(entities)
        }

        async fn remove_many(&self, _ids: &[Identifier]) -> Result<()> {
            Ok(())
        }

        async fn remove_all(&self, _query: &Query) -> Result<Vec<Identifier>> {
            Ok(Vec::new())
        }
    }

    fn post(id: i64, title: &str) -> TestPost {
        TestPost::new(Identifier::remote("post", id), title)
    }

    #[tokio::test]
    async fn local_reads_cascade_through_ascending_levels() {
        let memory = Arc::new(MemoryStore::new(StoreLevel::Memory));
        let disk = Arc::new(MemoryStore::new(StoreLevel::Disk));
        disk.set(post(1, "on disk")).await.unwrap();
        let stack = StoreStack::new(vec![
            disk as Arc<dyn StoreEngine<TestPost>>,
            memory as Arc<dyn StoreEngine<TestPost>>,
        ]);

        let query = Query::by_identifier(Identifier::remote("post", 1));
        let found = stack.get(&query, DataSource::Local).await.unwrap().unwrap();
        assert_eq!(found.title, "on disk");
    }

    #[tokio::test]
    async fn local_search_merges_levels_first_level_wins() {
        let memory = Arc::new(MemoryStore::new(StoreLevel::Memory));
        let disk = Arc::new(MemoryStore::new(StoreLevel::Disk));
        memory.set(post(1, "fresh")).await.unwrap();
        disk.set(post(1, "stale")).await.unwrap();
        disk.set(post(2, "only disk")).await.unwrap();
        let stack = StoreStack::new(vec![
            memory as Arc<dyn StoreEngine<TestPost>>,
            disk as Arc<dyn StoreEngine<TestPost>>,
        ]);

        let found = stack.search_local(&Query::all()).await.unwrap();
        let mut titles: Vec<_> = found.entities.iter().map(|p| p.title.clone()).collect();
        titles.sort();
        assert_eq!(titles, vec!["fresh", "only disk"]);
    }

    #[tokio::test]
    async fn remote_or_local_falls_back_on_eligible_errors() {
        let local = Arc::new(MemoryStore::new(StoreLevel::Memory));
        local.set(post(1, "cached")).await.unwrap();
        let stack = StoreStack::new(vec![
            local as Arc<dyn StoreEngine<TestPost>>,
            Arc::new(FailingRemote {
                kind: StoreErrorKind::NotReachable,
            }),
        ]);

        let query = Query::by_identifier(Identifier::remote("post", 1));
        let found = stack
            .get(&query, DataSource::RemoteOrLocal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "cached");
    }

    #[tokio::test]
    async fn remote_or_local_propagates_ineligible_errors() {
        let local = Arc::new(MemoryStore::new(StoreLevel::Memory));
        let stack = StoreStack::new(vec![
            local as Arc<dyn StoreEngine<TestPost>>,
            Arc::new(FailingRemote {
                kind: StoreErrorKind::InvalidContext("bad".to_string()),
            }),
        ]);

        let query = Query::by_identifier(Identifier::remote("post", 1));
        assert!(stack.get(&query, DataSource::RemoteOrLocal).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn local_commit_hook_fires_before_the_remote_resolves() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let local = Arc::new(MemoryStore::new(StoreLevel::Memory));
        let stack = StoreStack::new(vec![
            local.clone() as Arc<dyn StoreEngine<TestPost>>,
            Arc::new(SlowRemote { log: log.clone() }),
        ]);

        let hook_log = log.clone();
        let hook: CommitHook<TestPost> = Arc::new(move |_committed| {
            let log = hook_log.clone();
            async move {
                log.lock().unwrap().push("local");
            }
            .boxed()
        });

        stack
            .write(vec![post(1, "v")], WriteContext::LocalAndRemote, Some(hook))
            .await
            .unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &["local", "remote"]);
        assert!(local
            .get(&Query::by_identifier(Identifier::remote("post", 1)))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn remote_only_write_requires_a_remote_engine() {
        let local = Arc::new(MemoryStore::new(StoreLevel::Memory));
        let stack = StoreStack::new(vec![local as Arc<dyn StoreEngine<TestPost>>]);
        let result = stack
            .write(vec![post(1, "v")], WriteContext::Remote, None)
            .await;
        assert!(matches!(result, Err(StrataError::NotSupported(_))));
    }
}
