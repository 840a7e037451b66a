use std::fmt;

use serde::{Deserialize, Serialize};

use super::identifier::Identifier;

/// Names a searchable field of an entity. The reserved name
/// [IndexName::IDENTIFIER] is answered by [index_value_of] for every entity;
/// implementations only answer their own fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexName(pub String);

impl IndexName {
    pub const IDENTIFIER: &'static str = "identifier";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn identifier() -> Self {
        Self(Self::IDENTIFIER.to_string())
    }

    pub fn is_identifier(&self) -> bool {
        self.0 == Self::IDENTIFIER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IndexName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The value of a searchable field. Totally ordered and hashable so results
/// can be sorted and grouped without knowledge of the entity type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexValue {
    Text(String),
    Int(i64),
    Bool(bool),
    /// Nanoseconds since the unix epoch.
    Time(u64),
    Identifier(Identifier),
    Many(Vec<IndexValue>),
}

impl IndexValue {
    /// The string form used by the `Match` filter operator.
    pub fn as_match_text(&self) -> String {
        match self {
            IndexValue::Text(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Bool(b) => b.to_string(),
            IndexValue::Time(t) => t.to_string(),
            IndexValue::Identifier(id) => id.to_string(),
            IndexValue::Many(values) => values
                .iter()
                .map(|v| v.as_match_text())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::Text(s.to_string())
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        IndexValue::Int(i)
    }
}

impl From<Identifier> for IndexValue {
    fn from(id: Identifier) -> Self {
        IndexValue::Identifier(id)
    }
}

/// A typed edge from one entity to another, grouped by the index that holds
/// the target identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipIdentifier {
    pub index: IndexName,
    pub identifier: Identifier,
}

/// Discriminates specializations of an entity type, for families where one
/// endpoint serves several concrete shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtype(pub String);

/// A value managed by the cache layer. Uniquely keyed by its identifier; the
/// field contents may differ across snapshots of the same logical entity.
/// Equality compares snapshots field by field, which listener dispatch uses
/// to suppress emissions that would not change anything.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    /// Stable identifier for the entity type, used in placeholder encoding
    /// and relationship fetching.
    fn type_uid() -> &'static str;

    fn identifier(&self) -> Identifier;

    /// The value of one of the entity's own searchable fields, or `None` when
    /// the entity does not carry that field. The reserved identifier index is
    /// handled by [index_value_of].
    fn index_value(&self, name: &IndexName) -> Option<IndexValue>;

    /// The typed relationship edges leaving this entity.
    fn relationships(&self) -> Vec<RelationshipIdentifier> {
        Vec::new()
    }

    fn subtype(&self) -> Option<Subtype> {
        None
    }
}

/// Resolves an index against an entity, answering the reserved identifier
/// index uniformly so filters and engines never special-case it.
pub fn index_value_of<E: Entity>(entity: &E, name: &IndexName) -> Option<IndexValue> {
    if name.is_identifier() {
        Some(IndexValue::Identifier(entity.identifier()))
    } else {
        entity.index_value(name)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::TestPost;
    use super::*;

    #[test]
    fn identifier_index_is_answered_for_every_entity() {
        let id = Identifier::remote("post", 1);
        let post = TestPost::new(id.clone(), "hello");
        let value = index_value_of(&post, &IndexName::identifier());
        assert_eq!(value, Some(IndexValue::Identifier(id)));
    }

    #[test]
    fn missing_index_resolves_to_none() {
        let post = TestPost::new(Identifier::remote("post", 1), "hello");
        assert_eq!(index_value_of(&post, &IndexName::new("missing")), None);
    }

    #[test]
    fn relationships_surface_the_author_edge() {
        let author = Identifier::remote("user", 7);
        let post =
            TestPost::new(Identifier::remote("post", 1), "hello").with_author(author.clone());
        let rels = post.relationships();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].index, IndexName::new("author"));
        assert_eq!(rels[0].identifier, author);
    }
}
