use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::entity::Entity;
use crate::model::identifier::Identifier;
use crate::model::query::Query;

use super::{StoreEngine, StoreLevel, StoreSearch};

/// A local engine over a plain map, used as the default memory level and as
/// the backend of choice in tests. Searches answer in identifier order so
/// unordered reads are still deterministic.
pub struct MemoryStore<E> {
    level: StoreLevel,
    entities: RwLock<HashMap<Identifier, E>>,
}

impl<E: Entity> MemoryStore<E> {
    pub fn new(level: StoreLevel) -> Self {
        Self {
            level,
            entities: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().unwrap().is_empty()
    }

    fn matching(&self, query: &Query) -> Vec<E> {
        let entities = self.entities.read().unwrap();
        if let Some(ids) = query.target_identifiers() {
            return ids
                .iter()
                .filter_map(|id| entities.get(id).cloned())
                .collect();
        }
        let mut found: Vec<(Identifier, E)> = entities
            .iter()
            .filter(|(_, e)| query.matches(*e))
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        found.sort_by(|(a, _), (b, _)| a.cmp(b));
        found.into_iter().map(|(_, e)| e).collect()
    }
}

impl<E: Entity> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new(StoreLevel::Memory)
    }
}

#[async_trait]
impl<E: Entity> StoreEngine<E> for MemoryStore<E> {
    fn level(&self) -> StoreLevel {
        self.level
    }

    async fn get(&self, query: &Query) -> Result<Option<E>> {
        Ok(self.matching(query).into_iter().next())
    }

    async fn search(&self, query: &Query) -> Result<StoreSearch<E>> {
        Ok(StoreSearch::local(self.matching(query)))
    }

    async fn set_many(&self, entities: Vec<E>) -> Result<Vec<E>> {
        let mut map = self.entities.write().unwrap();
        for entity in &entities {
            map.insert(entity.identifier(), entity.clone());
        }
        Ok(entities)
    }

    async fn remove_many(&self, ids: &[Identifier]) -> Result<()> {
        let mut map = self.entities.write().unwrap();
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    async fn remove_all(&self, query: &Query) -> Result<Vec<Identifier>> {
        let removed: Vec<Identifier> = self
            .matching(query)
            .into_iter()
            .map(|e| e.identifier())
            .collect();
        let mut map = self.entities.write().unwrap();
        for id in &removed {
            map.remove(id);
        }
        Ok(removed)
    }
}
