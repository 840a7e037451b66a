use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{Result, StrataError};
use crate::model::entity::Entity;
use crate::model::identifier::Identifier;
use crate::model::query::{build_result, Query, QueryResult};
use crate::model::update_time::UpdateTime;
use crate::store::{
    CommitHook, DataSource, RemoveHook, StoreSearch, StoreStack, WriteContext,
};

pub mod listeners;

pub use listeners::Contract;

use listeners::{ListenerEntry, ListenerSet};

const LISTENER_CHANNEL_CAPACITY: usize = 16;

/// What happens to extra local entities when a remote read carrying the
/// complete result set is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaStrategy {
    /// Synced local entities absent from the remote result are removed.
    DiscardExtraLocal,
    RetainExtraLocal,
}

/// Whether remote reads write through to the local stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceStrategy {
    Persist(DeltaStrategy),
    DoNotPersist,
}

impl PersistenceStrategy {
    pub fn persists(&self) -> bool {
        matches!(self, PersistenceStrategy::Persist(_))
    }

    fn discards_extra_local(&self) -> bool {
        matches!(
            self,
            PersistenceStrategy::Persist(DeltaStrategy::DiscardExtraLocal)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAccess {
    RemoteAccess,
    LocalAccess,
    NoAccess,
}

/// Caller-supplied access gate, consulted at the start and end of every
/// operation. A level that denies the operation, or that changes while the
/// operation runs, replaces the result with `access_invalid`.
pub trait AccessValidator: Send + Sync {
    fn user_access(&self) -> UserAccess;
}

/// The continuous result stream handed to a subscriber. Dropping it releases
/// the backing listener entry at the next event dispatch.
pub type EntityStream<E> = ReceiverStream<Vec<E>>;

/// Per-entity read/write funnel over a store stack: causal ordering of
/// mutations, write-through of remote reads, and continuous result delivery
/// to registered listeners. Mutations are serialized on one queue and event
/// dispatch on a second, so emission order is stable without blocking reads.
pub struct CoreManager<E: Entity> {
    inner: Arc<ManagerInner<E>>,
}

impl<E: Entity> Clone for CoreManager<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ManagerInner<E: Entity> {
    /// Self-reference for the deferred read legs and commit hooks, which
    /// outlive the borrow of the calling operation.
    weak: Weak<ManagerInner<E>>,
    stack: StoreStack<E>,
    persistence: PersistenceStrategy,
    validator: StdMutex<Option<Arc<dyn AccessValidator>>>,
    /// Serializes every mutating operation.
    op_lock: Mutex<()>,
    /// Serializes event dispatch, independently of mutations.
    events_lock: Mutex<()>,
    update_times: StdMutex<HashMap<Identifier, UpdateTime>>,
    listeners: StdMutex<ListenerSet<E>>,
}

impl<E: Entity> CoreManager<E> {
    pub fn new(stack: StoreStack<E>, persistence: PersistenceStrategy) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| ManagerInner {
                weak: weak.clone(),
                stack,
                persistence,
                validator: StdMutex::new(None),
                op_lock: Mutex::new(()),
                events_lock: Mutex::new(()),
                update_times: StdMutex::new(HashMap::new()),
                listeners: StdMutex::new(ListenerSet::new()),
            }),
        }
    }

    pub fn with_validator(self, validator: Arc<dyn AccessValidator>) -> Self {
        *self.inner.validator.lock().unwrap() = Some(validator);
        self
    }

    /// The number of live continuous listeners. Entries whose subscriber
    /// dropped disappear at the next dispatch.
    pub fn active_listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    pub async fn get(&self, id: &Identifier, source: DataSource) -> Result<Option<E>> {
        let initial = self.inner.begin_access(source.reads_remote())?;
        let result = self.inner.get_inner(id, source).await;
        self.inner.end_access(initial)?;
        result
    }

    /// Reads entities by the query's own context and shapes the result.
    pub async fn search(&self, query: Query) -> Result<QueryResult<E>> {
        let initial = self.inner.begin_access(query.context.reads_remote())?;
        let result = self.inner.search_inner(query).await;
        self.inner.end_access(initial)?;
        result
    }

    /// One identifier-list read, preserving the identifier order. This is
    /// the relationship fetch entry point.
    pub async fn get_by_ids(&self, ids: Vec<Identifier>, source: DataSource) -> Result<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::by_identifiers(ids).with_context(source);
        Ok(self.search(query).await?.into_entities())
    }

    pub async fn set(&self, entity: E, context: WriteContext) -> Result<E> {
        self.set_at(entity, context, UpdateTime::now()).await
    }

    /// A single write at an explicit origin time. A write superseded by a
    /// newer one succeeds and returns the currently stored value.
    pub async fn set_at(&self, entity: E, context: WriteContext, time: UpdateTime) -> Result<E> {
        let mut written = self.set_many_at(vec![entity], context, time).await?;
        written.pop().ok_or_else(|| {
            StrataError::Logical("set_many returned no entity for a single write".to_string())
        })
    }

    pub async fn set_many(&self, entities: Vec<E>, context: WriteContext) -> Result<Vec<E>> {
        self.set_many_at(entities, context, UpdateTime::now()).await
    }

    pub async fn set_many_at(
        &self,
        entities: Vec<E>,
        context: WriteContext,
        time: UpdateTime,
    ) -> Result<Vec<E>> {
        let initial = self.inner.begin_access(context.writes_remote())?;
        let result = self.inner.set_many_inner(entities, context, time).await;
        self.inner.end_access(initial)?;
        result
    }

    pub async fn remove(&self, id: &Identifier, context: WriteContext) -> Result<()> {
        self.remove_many_at(vec![id.clone()], context, UpdateTime::now())
            .await
    }

    pub async fn remove_many(&self, ids: Vec<Identifier>, context: WriteContext) -> Result<()> {
        self.remove_many_at(ids, context, UpdateTime::now()).await
    }

    pub async fn remove_many_at(
        &self,
        ids: Vec<Identifier>,
        context: WriteContext,
        time: UpdateTime,
    ) -> Result<()> {
        let initial = self.inner.begin_access(context.writes_remote())?;
        let result = self.inner.remove_many_inner(ids, context, time).await;
        self.inner.end_access(initial)?;
        result
    }

    /// A continuous query: the shaped once-result plus a stream of every
    /// subsequent value the listener's query projects from committed
    /// mutations.
    pub async fn continuous(&self, query: Query) -> Result<(QueryResult<E>, EntityStream<E>)> {
        self.continuous_with_contract(query, None).await
    }

    pub async fn continuous_with_contract(
        &self,
        query: Query,
        contract: Option<Contract<E>>,
    ) -> Result<(QueryResult<E>, EntityStream<E>)> {
        let initial = self.inner.begin_access(query.context.reads_remote())?;
        let result = self.inner.search_inner(query.clone()).await;
        self.inner.end_access(initial)?;
        let result = result?.materialized();

        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        self.inner.listeners.lock().unwrap().register(ListenerEntry {
            query,
            current: result.snapshot(),
            sink: tx,
            contract,
        });
        Ok((result, ReceiverStream::new(rx)))
    }
}

impl<E: Entity> ManagerInner<E> {
    fn begin_access(&self, needs_remote: bool) -> Result<UserAccess> {
        let validator = match self.validator.lock().unwrap().clone() {
            None => return Ok(UserAccess::RemoteAccess),
            Some(validator) => validator,
        };
        let level = validator.user_access();
        let denied = match level {
            UserAccess::NoAccess => true,
            UserAccess::LocalAccess => needs_remote,
            UserAccess::RemoteAccess => false,
        };
        if denied {
            Err(StrataError::AccessInvalid)
        } else {
            Ok(level)
        }
    }

    fn end_access(&self, initial: UserAccess) -> Result<()> {
        match self.validator.lock().unwrap().clone() {
            Some(validator) if validator.user_access() != initial => {
                Err(StrataError::AccessInvalid)
            }
            _ => Ok(()),
        }
    }

    fn supersedes(&self, id: &Identifier, time: UpdateTime) -> bool {
        let stored = self.update_times.lock().unwrap().get(id).copied();
        time.supersedes(stored)
    }

    fn record_times(&self, ids: impl IntoIterator<Item = Identifier>, time: UpdateTime) {
        let mut times = self.update_times.lock().unwrap();
        for id in ids {
            times.insert(id, time);
        }
    }

    async fn get_inner(&self, id: &Identifier, source: DataSource) -> Result<Option<E>> {
        let query = Query::by_identifier(id.clone());
        match source {
            DataSource::Local => self.stack.get_local(&query).await,
            DataSource::Remote => {
                let time = UpdateTime::now();
                let found = self.stack.get_remote(&query).await?;
                self.absorb_remote_get(id, &query, found.clone(), time).await;
                Ok(found)
            }
            DataSource::RemoteOrLocal => {
                let time = UpdateTime::now();
                match self.stack.get_remote(&query).await {
                    Ok(found) => {
                        self.absorb_remote_get(id, &query, found.clone(), time).await;
                        Ok(found)
                    }
                    Err(err) if err.is_fallback_eligible() => {
                        debug!("remote read failed ({}), serving local", err);
                        self.stack.get_local(&query).await
                    }
                    Err(err) => Err(err),
                }
            }
            DataSource::LocalThenRemote => {
                let local = self.stack.get_local(&query).await?;
                if self.stack.has_remote() {
                    let weak = self.weak.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => return,
                        };
                        let query = Query::by_identifier(id.clone());
                        let time = UpdateTime::now();
                        match inner.stack.get_remote(&query).await {
                            Ok(found) => {
                                inner.absorb_remote_get(&id, &query, found, time).await
                            }
                            Err(err) => warn!("deferred remote read failed: {}", err),
                        }
                    });
                }
                Ok(local)
            }
            DataSource::LocalOrRemote => {
                if let Some(found) = self.stack.get_local(&query).await? {
                    return Ok(Some(found));
                }
                let time = UpdateTime::now();
                match self.stack.get_remote(&query).await {
                    Ok(found) => {
                        self.absorb_remote_get(id, &query, found.clone(), time).await;
                        Ok(found)
                    }
                    // The local miss stands when the remote cannot answer.
                    Err(err) if err.is_fallback_eligible() => Ok(None),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Write-through of one remote read: set on hit, remove on miss, subject
    /// to the causal filter and the persistence strategy, then events.
    async fn absorb_remote_get(
        &self,
        id: &Identifier,
        query: &Query,
        found: Option<E>,
        time: UpdateTime,
    ) {
        if !self.persistence.persists() {
            match &found {
                Some(entity) => {
                    self.raise_update_events(query, std::slice::from_ref(entity), true)
                        .await
                }
                None => self.raise_delete_events(std::slice::from_ref(id)).await,
            }
            return;
        }
        match found {
            Some(entity) => {
                let entity_id = entity.identifier();
                let applied = {
                    let _op = self.op_lock.lock().await;
                    if !self.supersedes(&entity_id, time) {
                        false
                    } else {
                        match self
                            .stack
                            .write(vec![entity.clone()], WriteContext::Local, None)
                            .await
                        {
                            Ok(_) => {
                                self.record_times([entity_id], time);
                                true
                            }
                            Err(err) => {
                                warn!("write-through of a remote read failed: {}", err);
                                false
                            }
                        }
                    }
                };
                if applied {
                    self.raise_update_events(query, &[entity], true).await;
                }
            }
            None => {
                let applied = {
                    let _op = self.op_lock.lock().await;
                    if !self.supersedes(id, time) {
                        false
                    } else {
                        match self
                            .stack
                            .remove(vec![id.clone()], WriteContext::Local, None)
                            .await
                        {
                            Ok(()) => {
                                self.record_times([id.clone()], time);
                                true
                            }
                            Err(err) => {
                                warn!("removal after a remote miss failed: {}", err);
                                false
                            }
                        }
                    }
                };
                if applied {
                    self.raise_delete_events(std::slice::from_ref(id)).await;
                }
            }
        }
    }

    async fn search_inner(&self, query: Query) -> Result<QueryResult<E>> {
        match query.context {
            DataSource::Local => {
                let found = self.stack.search_local(&query).await?;
                Ok(build_result(found.entities, &query))
            }
            DataSource::Remote => {
                let found = self.stack.search_remote(&query).await?;
                self.absorb_remote_search(&query, &found, UpdateTime::now())
                    .await;
                let metadata = found.metadata.clone();
                Ok(build_result(found.entities, &query).with_metadata(metadata))
            }
            DataSource::RemoteOrLocal => match self.stack.search_remote(&query).await {
                Ok(found) => {
                    self.absorb_remote_search(&query, &found, UpdateTime::now())
                        .await;
                    let metadata = found.metadata.clone();
                    Ok(build_result(found.entities, &query).with_metadata(metadata))
                }
                Err(err) if err.is_fallback_eligible() => {
                    debug!("remote search failed ({}), serving local", err);
                    let found = self.stack.search_local(&query).await?;
                    Ok(build_result(found.entities, &query))
                }
                Err(err) => Err(err),
            },
            DataSource::LocalThenRemote => {
                let local = self.stack.search_local(&query).await?;
                if self.stack.has_remote() {
                    let weak = self.weak.clone();
                    let query = query.clone();
                    tokio::spawn(async move {
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => return,
                        };
                        let time = UpdateTime::now();
                        match inner.stack.search_remote(&query).await {
                            Ok(found) => {
                                inner.absorb_remote_search(&query, &found, time).await
                            }
                            Err(err) => warn!("deferred remote search failed: {}", err),
                        }
                    });
                }
                Ok(build_result(local.entities, &query))
            }
            DataSource::LocalOrRemote => {
                let local = self.stack.search_local(&query).await?;
                if !local.entities.is_empty() {
                    return Ok(build_result(local.entities, &query));
                }
                match self.stack.search_remote(&query).await {
                    Ok(found) => {
                        self.absorb_remote_search(&query, &found, UpdateTime::now())
                            .await;
                        let metadata = found.metadata.clone();
                        Ok(build_result(found.entities, &query).with_metadata(metadata))
                    }
                    Err(err) if err.is_fallback_eligible() => {
                        Ok(build_result(Vec::new(), &query))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Write-through of one remote search. With a persist strategy and a
    /// complete result set the local stores are replaced: synced entities
    /// absent from the result are removed (discard-extra-local only), and
    /// result entities are written under the causal filter.
    async fn absorb_remote_search(&self, query: &Query, found: &StoreSearch<E>, time: UpdateTime) {
        if !self.persistence.persists() {
            self.raise_update_events(query, &found.entities, found.complete)
                .await;
            return;
        }
        let mut removed: Vec<Identifier> = Vec::new();
        {
            let _op = self.op_lock.lock().await;
            if found.complete && self.persistence.discards_extra_local() {
                let remote_ids: HashSet<Identifier> =
                    found.entities.iter().map(|e| e.identifier()).collect();
                match self.stack.search_local(query).await {
                    Ok(local) => {
                        for entity in local.entities {
                            let id = entity.identifier();
                            if id.is_synced()
                                && !remote_ids.contains(&id)
                                && self.supersedes(&id, time)
                            {
                                removed.push(id);
                            }
                        }
                    }
                    Err(err) => warn!("local read before replacement failed: {}", err),
                }
                if !removed.is_empty() {
                    match self
                        .stack
                        .remove(removed.clone(), WriteContext::Local, None)
                        .await
                    {
                        Ok(()) => self.record_times(removed.iter().cloned(), time),
                        Err(err) => {
                            warn!("removal of extra local entities failed: {}", err);
                            removed.clear();
                        }
                    }
                }
            }
            let to_write: Vec<E> = found
                .entities
                .iter()
                .filter(|e| self.supersedes(&e.identifier(), time))
                .cloned()
                .collect();
            if !to_write.is_empty() {
                let ids: Vec<Identifier> = to_write.iter().map(|e| e.identifier()).collect();
                match self.stack.write(to_write, WriteContext::Local, None).await {
                    Ok(_) => self.record_times(ids, time),
                    Err(err) => warn!("write-through of a remote search failed: {}", err),
                }
            }
        }
        self.raise_update_events(query, &found.entities, found.complete)
            .await;
        if !removed.is_empty() {
            self.raise_delete_events(&removed).await;
        }
    }

    async fn set_many_inner(
        &self,
        entities: Vec<E>,
        context: WriteContext,
        time: UpdateTime,
    ) -> Result<Vec<E>> {
        let op = self.op_lock.lock().await;
        let to_write: Vec<E> = entities
            .iter()
            .filter(|e| self.supersedes(&e.identifier(), time))
            .cloned()
            .collect();
        if to_write.is_empty() {
            drop(op);
            // Every write was superseded; succeed with the current values.
            return self.current_or_input(entities).await;
        }
        let written_ids: Vec<Identifier> = to_write.iter().map(|e| e.identifier()).collect();
        let performed = Query::by_identifiers(written_ids.clone());

        let hook: Option<CommitHook<E>> = if context.writes_local() {
            let weak = self.weak.clone();
            let performed = performed.clone();
            Some(Arc::new(move |committed: Vec<E>| {
                let weak = weak.clone();
                let performed = performed.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner
                            .raise_update_events(&performed, &committed, false)
                            .await;
                    }
                }
                .boxed()
            }))
        } else {
            None
        };

        let written = self.stack.write(to_write, context, hook).await?;
        self.record_times(written_ids, time);
        drop(op);

        if context.writes_remote() {
            // The remote's canonical entities; handlers are idempotent and
            // unchanged values produce no second emission.
            self.raise_update_events(&performed, &written, false).await;
        }

        // Input order, with written entities replaced by their canonical
        // form and rejected ones by the currently stored value.
        let mut result = Vec::with_capacity(entities.len());
        for entity in entities {
            let id = entity.identifier();
            match written.iter().find(|w| w.identifier() == id) {
                Some(canonical) => result.push(canonical.clone()),
                None => result.push(self.current_of(&id).await.unwrap_or(entity)),
            }
        }
        Ok(result)
    }

    async fn remove_many_inner(
        &self,
        ids: Vec<Identifier>,
        context: WriteContext,
        time: UpdateTime,
    ) -> Result<()> {
        let op = self.op_lock.lock().await;
        let to_remove: Vec<Identifier> = ids
            .into_iter()
            .filter(|id| self.supersedes(id, time))
            .collect();
        if to_remove.is_empty() {
            return Ok(());
        }

        let hook: Option<RemoveHook> = if context.writes_local() {
            let weak = self.weak.clone();
            Some(Arc::new(move |committed: Vec<Identifier>| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.raise_delete_events(&committed).await;
                    }
                }
                .boxed()
            }))
        } else {
            None
        };

        self.stack.remove(to_remove.clone(), context, hook).await?;
        self.record_times(to_remove.iter().cloned(), time);
        drop(op);

        if !context.writes_local() {
            self.raise_delete_events(&to_remove).await;
        }
        Ok(())
    }

    async fn current_of(&self, id: &Identifier) -> Option<E> {
        self.stack
            .get_local(&Query::by_identifier(id.clone()))
            .await
            .ok()
            .flatten()
    }

    async fn current_or_input(&self, entities: Vec<E>) -> Result<Vec<E>> {
        let mut result = Vec::with_capacity(entities.len());
        for entity in entities {
            let id = entity.identifier();
            result.push(self.current_of(&id).await.unwrap_or(entity));
        }
        Ok(result)
    }

    async fn raise_update_events(&self, performed: &Query, results: &[E], complete: bool) {
        let _events = self.events_lock.lock().await;
        let emissions = self
            .listeners
            .lock()
            .unwrap()
            .collect_update_emissions(performed, results, complete);
        for (sink, value) in emissions {
            let _ = sink.send(value).await;
        }
    }

    async fn raise_delete_events(&self, deleted: &[Identifier]) {
        let _events = self.events_lock.lock().await;
        let emissions = self
            .listeners
            .lock()
            .unwrap()
            .collect_delete_emissions(deleted);
        for (sink, value) in emissions {
            let _ = sink.send(value).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::client::transport::mock::MockTransport;
    use crate::client::ApiClient;
    use crate::model::entity::fixtures::TestPost;
    use crate::store::remote::fixtures::PostEndpoints;
    use crate::store::{MemoryStore, RemoteStore, StoreEngine, StoreLevel};

    fn post(id: i64, title: &str) -> TestPost {
        TestPost::new(Identifier::remote("post", id), title)
    }

    struct Fixture {
        manager: CoreManager<TestPost>,
        local: Arc<MemoryStore<TestPost>>,
        transport: Arc<MockTransport>,
    }

    fn fixture(persistence: PersistenceStrategy) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let client = Arc::new(
            ApiClient::new(transport.clone()).with_host("https://api.example.com"),
        );
        let local = Arc::new(MemoryStore::new(StoreLevel::Memory));
        let stack = StoreStack::new(vec![
            local.clone() as Arc<dyn StoreEngine<TestPost>>,
            Arc::new(RemoteStore::new(client, Arc::new(PostEndpoints))),
        ]);
        Fixture {
            manager: CoreManager::new(stack, persistence),
            local,
            transport,
        }
    }

    fn persist() -> PersistenceStrategy {
        PersistenceStrategy::Persist(DeltaStrategy::DiscardExtraLocal)
    }

    #[tokio::test]
    async fn older_writes_are_rejected_silently() {
        let f = fixture(persist());
        let (_, mut stream) = f
            .manager
            .continuous(Query::all())
            .await
            .unwrap();

        f.manager
            .set_at(post(1, "newer"), WriteContext::Local, UpdateTime(100))
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first[0].title, "newer");

        // The older write succeeds but returns the stored value, raises no
        // event and leaves the store untouched.
        let returned = f
            .manager
            .set_at(post(1, "older"), WriteContext::Local, UpdateTime(50))
            .await
            .unwrap();
        assert_eq!(returned.title, "newer");
        let stored = f
            .manager
            .get(&Identifier::remote("post", 1), DataSource::Local)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "newer");

        f.manager
            .set_at(post(1, "newest"), WriteContext::Local, UpdateTime(200))
            .await
            .unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(second[0].title, "newest");
    }

    #[tokio::test]
    async fn equal_timestamps_do_not_supersede() {
        let f = fixture(persist());
        f.manager
            .set_at(post(1, "first"), WriteContext::Local, UpdateTime(100))
            .await
            .unwrap();
        f.manager
            .set_at(post(1, "second"), WriteContext::Local, UpdateTime(100))
            .await
            .unwrap();
        let stored = f
            .manager
            .get(&Identifier::remote("post", 1), DataSource::Local)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "first");
    }

    #[tokio::test]
    async fn ceiling_writes_always_apply() {
        let f = fixture(persist());
        f.manager
            .set_at(post(1, "a"), WriteContext::Local, UpdateTime(100))
            .await
            .unwrap();
        f.manager
            .set_at(post(1, "forced"), WriteContext::Local, UpdateTime::ceiling())
            .await
            .unwrap();
        let stored = f
            .manager
            .get(&Identifier::remote("post", 1), DataSource::Local)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "forced");
    }

    #[tokio::test(start_paused = true)]
    async fn local_then_remote_serves_local_and_streams_the_remote_value() {
        let f = fixture(persist());
        f.local.set(post(1, "a")).await.unwrap();
        let mut transport = MockTransport::new();
        transport = transport.with_delay(Duration::from_millis(50));
        transport.push_status(200, r#"[[1,"b"]]"#);
        // Swap in a delayed transport for this scenario.
        let client = Arc::new(
            ApiClient::new(Arc::new(transport)).with_host("https://api.example.com"),
        );
        let stack = StoreStack::new(vec![
            f.local.clone() as Arc<dyn StoreEngine<TestPost>>,
            Arc::new(RemoteStore::new(client, Arc::new(PostEndpoints))),
        ]);
        let manager = CoreManager::new(stack, persist());

        let query = Query::by_identifier(Identifier::remote("post", 1))
            .with_context(DataSource::LocalThenRemote);
        let (once, mut stream) = manager.continuous(query).await.unwrap();
        assert_eq!(once.snapshot()[0].title, "a");

        let update = stream.next().await.unwrap();
        assert_eq!(update[0].title, "b");
        let written = f.local
            .get(&Query::by_identifier(Identifier::remote("post", 1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.title, "b");
    }

    #[tokio::test]
    async fn complete_remote_results_replace_synced_local_entities() {
        let f = fixture(persist());
        f.local.set(post(1, "stale")).await.unwrap();
        f.local.set(post(2, "gone")).await.unwrap();
        let unsynced = TestPost::new(Identifier::local("post", "draft"), "local draft");
        f.local.set(unsynced.clone()).await.unwrap();

        f.transport.push_status(200, r#"[[1,"fresh"]]"#);
        let result = f
            .manager
            .search(Query::all().with_context(DataSource::Remote))
            .await
            .unwrap();
        assert_eq!(result.snapshot().len(), 1);

        // Synced post 2 was absent remotely and is removed; the unsynced
        // draft is retained.
        assert!(f.local
            .get(&Query::by_identifier(Identifier::remote("post", 2)))
            .await
            .unwrap()
            .is_none());
        let draft = f.local
            .get(&Query::by_identifier(unsynced.identifier()))
            .await
            .unwrap();
        assert!(draft.is_some());
        let fresh = f.local
            .get(&Query::by_identifier(Identifier::remote("post", 1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.title, "fresh");
    }

    #[tokio::test]
    async fn write_events_fire_on_local_commit_and_again_on_remote_canonical() {
        let f = fixture(persist());
        // The server canonicalizes the title.
        f.transport.push_status(200, r#"[[1,"server"]]"#);
        let (_, mut stream) = f.manager.continuous(Query::all()).await.unwrap();

        let written = f
            .manager
            .set(post(1, "local"), WriteContext::LocalAndRemote)
            .await
            .unwrap();
        assert_eq!(written.title, "server");

        let first = stream.next().await.unwrap();
        assert_eq!(first[0].title, "local");
        let second = stream.next().await.unwrap();
        assert_eq!(second[0].title, "server");
    }

    #[tokio::test]
    async fn remote_miss_removes_local_and_raises_delete_events() {
        let f = fixture(persist());
        f.local.set(post(1, "cached")).await.unwrap();
        let (_, mut stream) = f.manager.continuous(Query::all()).await.unwrap();
        f.transport.push_status(404, "");

        let found = f
            .manager
            .get(&Identifier::remote("post", 1), DataSource::Remote)
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(f.local.is_empty());
        let emission = stream.next().await.unwrap();
        assert!(emission.is_empty());
    }

    #[tokio::test]
    async fn remote_or_local_serves_local_on_eligible_failures() {
        let f = fixture(persist());
        f.local.set(post(1, "cached")).await.unwrap();
        f.transport
            .push_error(crate::error::NetworkErrorKind::NotConnected);
        let found = f
            .manager
            .get(&Identifier::remote("post", 1), DataSource::RemoteOrLocal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "cached");
    }

    #[tokio::test]
    async fn local_or_remote_returns_the_local_hit_without_a_remote_call() {
        let f = fixture(persist());
        f.local.set(post(1, "cached")).await.unwrap();
        let found = f
            .manager
            .get(&Identifier::remote("post", 1), DataSource::LocalOrRemote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "cached");
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_release_their_listener_entries() {
        let f = fixture(persist());
        let (_, stream) = f.manager.continuous(Query::all()).await.unwrap();
        assert_eq!(f.manager.active_listener_count(), 1);
        drop(stream);
        f.manager
            .set(post(1, "x"), WriteContext::Local)
            .await
            .unwrap();
        assert_eq!(f.manager.active_listener_count(), 0);
    }

    struct SequenceValidator {
        calls: AtomicUsize,
        levels: Vec<UserAccess>,
    }

    impl AccessValidator for SequenceValidator {
        fn user_access(&self) -> UserAccess {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            *self.levels.get(call).unwrap_or_else(|| {
                self.levels.last().expect("levels must not be empty")
            })
        }
    }

    #[tokio::test]
    async fn no_access_denies_every_operation() {
        let f = fixture(persist());
        let manager = CoreManager::new(
            StoreStack::new(vec![
                f.local.clone() as Arc<dyn StoreEngine<TestPost>>
            ]),
            persist(),
        )
        .with_validator(Arc::new(SequenceValidator {
            calls: AtomicUsize::new(0),
            levels: vec![UserAccess::NoAccess],
        }));
        let result = manager
            .get(&Identifier::remote("post", 1), DataSource::Local)
            .await;
        assert_eq!(result.unwrap_err(), StrataError::AccessInvalid);
    }

    #[tokio::test]
    async fn local_access_denies_remote_contexts() {
        let local_only = CoreManager::new(
            StoreStack::new(vec![
                Arc::new(MemoryStore::new(StoreLevel::Memory)) as Arc<dyn StoreEngine<TestPost>>
            ]),
            persist(),
        )
        .with_validator(Arc::new(SequenceValidator {
            calls: AtomicUsize::new(0),
            levels: vec![UserAccess::LocalAccess],
        }));
        assert!(local_only
            .get(&Identifier::remote("post", 1), DataSource::Local)
            .await
            .is_ok());
        let denied = local_only
            .get(&Identifier::remote("post", 1), DataSource::Remote)
            .await;
        assert_eq!(denied.unwrap_err(), StrataError::AccessInvalid);
    }

    #[tokio::test]
    async fn a_level_change_mid_operation_invalidates_the_result() {
        let local: Arc<MemoryStore<TestPost>> = Arc::new(MemoryStore::new(StoreLevel::Memory));
        local.set(post(1, "x")).await.unwrap();
        let manager = CoreManager::new(
            StoreStack::new(vec![local as Arc<dyn StoreEngine<TestPost>>]),
            persist(),
        )
        .with_validator(Arc::new(SequenceValidator {
            calls: AtomicUsize::new(0),
            levels: vec![UserAccess::RemoteAccess, UserAccess::LocalAccess],
        }));
        let result = manager
            .get(&Identifier::remote("post", 1), DataSource::Local)
            .await;
        assert_eq!(result.unwrap_err(), StrataError::AccessInvalid);
    }

    #[tokio::test]
    async fn get_by_ids_preserves_the_requested_order() {
        let f = fixture(persist());
        f.local.set(post(1, "a")).await.unwrap();
        f.local.set(post(2, "b")).await.unwrap();
        let found = f
            .manager
            .get_by_ids(
                vec![Identifier::remote("post", 2), Identifier::remote("post", 1)],
                DataSource::Local,
            )
            .await
            .unwrap();
        let ids: Vec<_> = found
            .iter()
            .map(|p| p.identifier().remote_value().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
