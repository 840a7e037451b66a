use std::collections::HashMap;

use super::entity::RelationshipIdentifier;
use super::identifier::Identifier;
use super::query::EndpointMetadata;

/// A node stored in an [EntityGraph]. Applications define one implementation
/// per entity family, typically an enum with a variant per entity type.
pub trait GraphNode: Clone + Send + Sync + 'static {
    fn identifier(&self) -> Identifier;

    /// The typed edges leaving this node, grouped by index when fetched.
    fn relationships(&self) -> Vec<RelationshipIdentifier> {
        Vec::new()
    }
}

/// The mutable sink of a relationship build: the root set, every entity
/// reached along an included path, and the endpoint metadata of the root
/// fetch. Containment checks are constant time; inserting an identifier that
/// is already present is a no-op; the root set and metadata are recorded at
/// most once.
#[derive(Debug, Clone)]
pub struct EntityGraph<N> {
    roots: Vec<Identifier>,
    entities: HashMap<Identifier, N>,
    metadata: Option<EndpointMetadata>,
}

impl<N: GraphNode> EntityGraph<N> {
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            entities: HashMap::new(),
            metadata: None,
        }
    }

    /// Records the root set. Later calls are ignored.
    pub fn set_roots(&mut self, roots: Vec<N>) {
        if !self.roots.is_empty() {
            return;
        }
        self.roots = roots.iter().map(|n| n.identifier()).collect();
        for node in roots {
            self.insert(node);
        }
    }

    /// Records the endpoint metadata of the root fetch. Later calls are
    /// ignored.
    pub fn set_metadata(&mut self, metadata: EndpointMetadata) {
        if self.metadata.is_none() {
            self.metadata = Some(metadata);
        }
    }

    /// Inserts a node, keeping the existing one when the identifier is
    /// already present.
    pub fn insert(&mut self, node: N) {
        self.entities.entry(node.identifier()).or_insert(node);
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.entities.contains_key(id)
    }

    pub fn get(&self, id: &Identifier) -> Option<&N> {
        self.entities.get(id)
    }

    pub fn roots(&self) -> &[Identifier] {
        &self.roots
    }

    pub fn root_nodes(&self) -> Vec<&N> {
        self.roots.iter().filter_map(|id| self.entities.get(id)).collect()
    }

    pub fn metadata(&self) -> Option<&EndpointMetadata> {
        self.metadata.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &Identifier> {
        self.entities.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.entities.values()
    }
}

impl<N: GraphNode> Default for EntityGraph<N> {
    fn default() -> Self {
        Self::new()
    }
}
