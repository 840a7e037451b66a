use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::conf;
use crate::error::Result;
use crate::model::entity::IndexName;
use crate::model::graph::{EntityGraph, GraphNode};
use crate::model::identifier::Identifier;
use crate::model::query::EndpointMetadata;
use crate::store::DataSource;

/// An ordered list of index names leading away from the root set.
pub type RelationshipPath = Vec<IndexName>;

/// How often an included path may be re-applied to the entities it fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursiveMode {
    /// Follow the path exactly once.
    None,
    /// Re-apply the path up to the given number of times.
    DepthLimit(usize),
    /// Re-apply until the library-level depth ceiling.
    Full,
}

/// Resolves one identifier set into nodes. Custom fetchers replace the
/// built-in manager call for the path they are registered on.
pub type RelationshipFetcher<N> = Arc<
    dyn Fn(Vec<Identifier>, DataSource) -> BoxFuture<'static, Result<Vec<N>>> + Send + Sync,
>;

/// The graph fill entry point of a per-entity manager family: one
/// identifier-list read per entity type, in the given context.
#[async_trait]
pub trait RelationshipManager<N: GraphNode>: Send + Sync {
    async fn get_by_ids(
        &self,
        ids: Vec<Identifier>,
        entity_type: &str,
        context: DataSource,
    ) -> Result<Vec<N>>;
}

/// Which relationship paths a graph build follows, and with what recursion,
/// context and fetcher per path. Exclusions always win; `include_all` admits
/// every edge within its recursion bound.
pub struct RelationshipSpec<N> {
    includes: Vec<(RelationshipPath, RecursiveMode)>,
    excludes: Vec<RelationshipPath>,
    include_all: Option<RecursiveMode>,
    fetchers: HashMap<RelationshipPath, RelationshipFetcher<N>>,
    contexts: HashMap<RelationshipPath, DataSource>,
}

impl<N> RelationshipSpec<N> {
    pub fn new() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            include_all: None,
            fetchers: HashMap::new(),
            contexts: HashMap::new(),
        }
    }

    pub fn include(self, path: RelationshipPath) -> Self {
        self.include_with(path, RecursiveMode::None)
    }

    pub fn include_with(mut self, path: RelationshipPath, mode: RecursiveMode) -> Self {
        self.includes.push((path, mode));
        self
    }

    pub fn exclude(mut self, path: RelationshipPath) -> Self {
        self.excludes.push(path);
        self
    }

    pub fn include_all(mut self, mode: RecursiveMode) -> Self {
        self.include_all = Some(mode);
        self
    }

    pub fn with_fetcher(mut self, path: RelationshipPath, fetcher: RelationshipFetcher<N>) -> Self {
        self.fetchers.insert(path, fetcher);
        self
    }

    /// Overrides the read context for one path.
    pub fn with_context(mut self, path: RelationshipPath, context: DataSource) -> Self {
        self.contexts.insert(path, context);
        self
    }

    fn allows(&self, concrete: &[IndexName]) -> bool {
        if self.excludes.iter().any(|p| p.as_slice() == concrete) {
            return false;
        }
        if let Some(mode) = self.include_all {
            let within = match mode {
                RecursiveMode::None => concrete.len() <= 1,
                RecursiveMode::DepthLimit(n) => concrete.len() <= n,
                RecursiveMode::Full => true,
            };
            if within {
                return true;
            }
        }
        self.includes
            .iter()
            .any(|(pattern, mode)| pattern_allows(pattern, *mode, concrete))
    }

    fn fetcher_for(&self, concrete: &[IndexName]) -> Option<RelationshipFetcher<N>> {
        self.fetchers
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, concrete))
            .map(|(_, fetcher)| fetcher.clone())
    }

    fn context_for(&self, concrete: &[IndexName]) -> Option<DataSource> {
        self.contexts
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, concrete))
            .map(|(_, context)| *context)
    }
}

impl<N> Default for RelationshipSpec<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Clone for RelationshipSpec<N> {
    fn clone(&self) -> Self {
        Self {
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
            include_all: self.include_all,
            fetchers: self.fetchers.clone(),
            contexts: self.contexts.clone(),
        }
    }
}

/// Whether a concrete edge path is admitted by an included pattern: prefixes
/// descend toward the pattern, and beyond it the pattern repeats cyclically
/// as far as the recursion mode allows.
fn pattern_allows(pattern: &[IndexName], mode: RecursiveMode, concrete: &[IndexName]) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if concrete.len() <= pattern.len() {
        return pattern[..concrete.len()] == *concrete;
    }
    let cyclic = concrete
        .iter()
        .enumerate()
        .all(|(i, segment)| *segment == pattern[i % pattern.len()]);
    if !cyclic {
        return false;
    }
    match mode {
        RecursiveMode::None => false,
        RecursiveMode::DepthLimit(n) => concrete.len() <= pattern.len() * n,
        RecursiveMode::Full => true,
    }
}

fn pattern_matches(pattern: &[IndexName], concrete: &[IndexName]) -> bool {
    pattern_allows(pattern, RecursiveMode::Full, concrete)
}

/// Builds relationship graphs: seeds the root set, walks included paths in
/// lexicographic index order with a concurrent fan-out per level, and bounds
/// recursion by the per-path mode and the library-level ceiling.
pub struct RelationshipController<N: GraphNode> {
    manager: Arc<dyn RelationshipManager<N>>,
    spec: RelationshipSpec<N>,
    context: DataSource,
}

impl<N: GraphNode> Clone for RelationshipController<N> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            spec: self.spec.clone(),
            context: self.context,
        }
    }
}

impl<N: GraphNode> RelationshipController<N> {
    pub fn new(manager: Arc<dyn RelationshipManager<N>>, spec: RelationshipSpec<N>) -> Self {
        Self {
            manager,
            spec,
            context: DataSource::LocalOrRemote,
        }
    }

    pub fn with_context(mut self, context: DataSource) -> Self {
        self.context = context;
        self
    }

    /// One full graph build from the given roots.
    pub async fn build(
        &self,
        roots: Vec<N>,
        metadata: Option<EndpointMetadata>,
    ) -> Result<EntityGraph<N>> {
        self.build_with_context(roots, metadata, self.context).await
    }

    async fn build_with_context(
        &self,
        roots: Vec<N>,
        metadata: Option<EndpointMetadata>,
        context: DataSource,
    ) -> Result<EntityGraph<N>> {
        let graph = Arc::new(Mutex::new(EntityGraph::new()));
        {
            let mut graph = graph.lock().unwrap();
            if let Some(metadata) = metadata {
                graph.set_metadata(metadata);
            }
            graph.set_roots(roots.clone());
        }
        self.fill(roots, Vec::new(), graph.clone(), context).await?;
        let graph = match Arc::try_unwrap(graph) {
            Ok(graph) => graph.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(shared) => shared.lock().unwrap().clone(),
        };
        Ok(graph)
    }

    /// Continuous graph delivery: the first build is the once-result; every
    /// subsequent root-set emission rebuilds the graph with remote contexts
    /// demoted so repeated emissions cannot refetch without bound.
    pub async fn continuous(
        &self,
        roots: Vec<N>,
        mut root_emissions: impl Stream<Item = Vec<N>> + Send + Unpin + 'static,
    ) -> Result<(EntityGraph<N>, ReceiverStream<EntityGraph<N>>)> {
        let first = self.build(roots, None).await?;
        let (tx, rx) = mpsc::channel(4);
        let controller = self.clone();
        tokio::spawn(async move {
            let demoted = controller.context.demoted_for_rebuild();
            while let Some(roots) = root_emissions.next().await {
                match controller.build_with_context(roots, None, demoted).await {
                    Ok(graph) => {
                        if tx.send(graph).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("continuous graph rebuild failed: {}", err),
                }
            }
        });
        Ok((first, ReceiverStream::new(rx)))
    }

    fn fill<'a>(
        &'a self,
        entities: Vec<N>,
        path: RelationshipPath,
        graph: Arc<Mutex<EntityGraph<N>>>,
        context: DataSource,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if path.len() >= conf::config().relationship_max_depth {
                return Ok(());
            }

            // Group the outgoing edges by index; the map keeps the fan-out
            // order deterministic (lexicographic by index name).
            let mut by_index: BTreeMap<IndexName, Vec<Identifier>> = BTreeMap::new();
            for entity in &entities {
                for edge in entity.relationships() {
                    by_index.entry(edge.index).or_default().push(edge.identifier);
                }
            }

            let mut tasks = Vec::new();
            for (index, ids) in by_index {
                let mut candidate = path.clone();
                candidate.push(index);
                if !self.spec.allows(&candidate) {
                    continue;
                }
                let graph = graph.clone();
                tasks.push(async move {
                    let mut pending = Vec::new();
                    {
                        let graph = graph.lock().unwrap();
                        let mut seen = std::collections::HashSet::new();
                        for id in ids {
                            if !graph.contains(&id) && seen.insert(id.clone()) {
                                pending.push(id);
                            }
                        }
                    }
                    if pending.is_empty() {
                        return Ok(());
                    }
                    let context = self.spec.context_for(&candidate).unwrap_or(context);
                    let requested_at = Instant::now();
                    let fetched = self.fetch(&candidate, pending, context).await?;
                    {
                        let mut graph = graph.lock().unwrap();
                        for node in fetched.clone() {
                            graph.insert(node);
                        }
                    }
                    self.note_fetch_gap(&candidate, requested_at);
                    self.fill(fetched, candidate, graph, context).await
                });
            }
            futures::future::try_join_all(tasks).await?;
            Ok(())
        }
        .boxed()
    }

    async fn fetch(
        &self,
        candidate: &[IndexName],
        ids: Vec<Identifier>,
        context: DataSource,
    ) -> Result<Vec<N>> {
        if let Some(fetcher) = self.spec.fetcher_for(candidate) {
            return fetcher(ids, context).await;
        }
        // The built-in fetcher asks the manager once per entity type.
        let mut by_type: BTreeMap<String, Vec<Identifier>> = BTreeMap::new();
        for id in ids {
            by_type.entry(id.type_uid.clone()).or_default().push(id);
        }
        let mut fetched = Vec::new();
        for (entity_type, ids) in by_type {
            fetched.extend(self.manager.get_by_ids(ids, &entity_type, context).await?);
        }
        Ok(fetched)
    }

    fn note_fetch_gap(&self, candidate: &[IndexName], requested_at: Instant) {
        let conf = conf::config();
        if !conf.relationship_debug {
            return;
        }
        let gap = requested_at.elapsed();
        if gap > conf.abnormal_fetch_threshold {
            let path: Vec<&str> = candidate.iter().map(|i| i.as_str()).collect();
            warn!(
                "slow relationship fetch for path {} took {:?}",
                path.join("."),
                gap
            );
        }
    }
}
