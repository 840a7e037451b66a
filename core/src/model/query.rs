use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::DataSource;

use super::entity::{index_value_of, Entity, IndexName, IndexValue};
use super::identifier::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    And,
    Or,
    Match,
    ContainedIn,
    Gt,
    GreaterOrEq,
    Lt,
    LessOrEq,
}

/// A predicate over entities. Evaluation is total: comparing against a
/// missing index value yields false rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Property(IndexName),
    Value(IndexValue),
    Values(BTreeSet<IndexValue>),
    Negated(Box<Filter>),
    Binary(Box<Filter>, Operator, Box<Filter>),
}

impl Filter {
    pub fn binary(lhs: Filter, op: Operator, rhs: Filter) -> Self {
        Filter::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    pub fn property_eq(name: impl Into<IndexName>, value: impl Into<IndexValue>) -> Self {
        Filter::binary(
            Filter::Property(name.into()),
            Operator::Eq,
            Filter::Value(value.into()),
        )
    }

    pub fn identifier_eq(id: Identifier) -> Self {
        Filter::binary(
            Filter::Property(IndexName::identifier()),
            Operator::Eq,
            Filter::Value(IndexValue::Identifier(id)),
        )
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::binary(self, Operator::And, other)
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::binary(self, Operator::Or, other)
    }

    pub fn negated(self) -> Self {
        Filter::Negated(Box::new(self))
    }

    /// Whether the entity satisfies this filter.
    pub fn matches<E: Entity>(&self, entity: &E) -> bool {
        self.evaluate(entity).truth()
    }

    fn evaluate<E: Entity>(&self, entity: &E) -> Evaluated {
        match self {
            Filter::Property(name) => Evaluated::Value(index_value_of(entity, name)),
            Filter::Value(value) => Evaluated::Value(Some(value.clone())),
            Filter::Values(values) => Evaluated::Set(values.clone()),
            Filter::Negated(inner) => Evaluated::Bool(!inner.evaluate(entity).truth()),
            Filter::Binary(lhs, op, rhs) => match op {
                Operator::And => {
                    Evaluated::Bool(lhs.evaluate(entity).truth() && rhs.evaluate(entity).truth())
                }
                Operator::Or => {
                    Evaluated::Bool(lhs.evaluate(entity).truth() || rhs.evaluate(entity).truth())
                }
                Operator::Eq => {
                    let lhs = lhs.evaluate(entity).value();
                    let rhs = rhs.evaluate(entity).value();
                    Evaluated::Bool(match (lhs, rhs) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    })
                }
                Operator::Match => {
                    let text = lhs.evaluate(entity).value().map(|v| v.as_match_text());
                    let pattern = rhs.evaluate(entity).value().map(|v| v.as_match_text());
                    Evaluated::Bool(match (text, pattern) {
                        (Some(text), Some(pattern)) => Regex::new(&pattern)
                            .map(|re| re.is_match(&text))
                            .unwrap_or(false),
                        _ => false,
                    })
                }
                Operator::ContainedIn => {
                    let needle = lhs.evaluate(entity).value();
                    let haystack = rhs.evaluate(entity).set();
                    Evaluated::Bool(match (needle, haystack) {
                        (Some(needle), Some(haystack)) => haystack.contains(&needle),
                        _ => false,
                    })
                }
                Operator::Gt | Operator::GreaterOrEq | Operator::Lt | Operator::LessOrEq => {
                    let lhs = lhs.evaluate(entity).value();
                    let rhs = rhs.evaluate(entity).value();
                    Evaluated::Bool(match (lhs, rhs) {
                        (Some(a), Some(b)) => match op {
                            Operator::Gt => a > b,
                            Operator::GreaterOrEq => a >= b,
                            Operator::Lt => a < b,
                            Operator::LessOrEq => a <= b,
                            _ => unreachable!(),
                        },
                        _ => false,
                    })
                }
            },
        }
    }

    /// Flattens a filter composed solely of identifier equality and `Or`
    /// into the identifier list it matches. Any other shape returns `None`.
    pub fn extract_identifiers(&self) -> Option<Vec<Identifier>> {
        match self {
            Filter::Binary(lhs, Operator::Or, rhs) => {
                let mut ids = lhs.extract_identifiers()?;
                ids.extend(rhs.extract_identifiers()?);
                Some(ids)
            }
            Filter::Binary(lhs, Operator::Eq, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
                (Filter::Property(name), Filter::Value(IndexValue::Identifier(id)))
                | (Filter::Value(IndexValue::Identifier(id)), Filter::Property(name))
                    if name.is_identifier() =>
                {
                    Some(vec![id.clone()])
                }
                _ => None,
            },
            _ => None,
        }
    }
}

enum Evaluated {
    Bool(bool),
    Value(Option<IndexValue>),
    Set(BTreeSet<IndexValue>),
}

impl Evaluated {
    fn truth(&self) -> bool {
        match self {
            Evaluated::Bool(b) => *b,
            Evaluated::Value(None) => false,
            Evaluated::Value(Some(IndexValue::Bool(b))) => *b,
            Evaluated::Value(Some(_)) => true,
            Evaluated::Set(values) => !values.is_empty(),
        }
    }

    fn value(self) -> Option<IndexValue> {
        match self {
            Evaluated::Bool(b) => Some(IndexValue::Bool(b)),
            Evaluated::Value(value) => value,
            Evaluated::Set(_) => None,
        }
    }

    fn set(self) -> Option<BTreeSet<IndexValue>> {
        match self {
            Evaluated::Set(values) => Some(values),
            Evaluated::Value(Some(IndexValue::Many(values))) => {
                Some(values.into_iter().collect())
            }
            Evaluated::Value(Some(value)) => Some(BTreeSet::from([value])),
            _ => None,
        }
    }
}

/// One sort key. `Asc`/`Desc`/`Identifiers` are deterministic and safe for
/// stable continuous updates; `Natural` applies no reordering at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    Asc(IndexName),
    Desc(IndexName),
    Natural,
    Identifiers(Vec<Identifier>),
}

impl Order {
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, Order::Natural)
    }
}

/// Sorts entities by the given keys, in priority order. `Natural` keys
/// contribute no reordering; `Identifiers` ranks by position in the given
/// list with unknown entities at the end in their incoming order.
pub fn sort_entities<E: Entity>(entities: &mut Vec<E>, orders: &[Order]) {
    if !orders.iter().any(|o| o.is_deterministic()) {
        return;
    }
    entities.sort_by(|a, b| {
        for order in orders {
            let ordering = match order {
                Order::Natural => std::cmp::Ordering::Equal,
                Order::Asc(name) => cmp_index(a, b, name),
                Order::Desc(name) => cmp_index(a, b, name).reverse(),
                Order::Identifiers(ids) => {
                    let rank = |e: &E| {
                        ids.iter()
                            .position(|id| *id == e.identifier())
                            .unwrap_or(usize::MAX)
                    };
                    rank(a).cmp(&rank(b))
                }
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn cmp_index<E: Entity>(a: &E, b: &E, name: &IndexName) -> std::cmp::Ordering {
    // Missing values sort after present ones regardless of direction.
    match (index_value_of(a, name), index_value_of(b, name)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

/// Describes which entities to read and how to shape the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub filter: Option<Filter>,
    pub grouped_by: Option<IndexName>,
    pub uniquely: bool,
    pub order: Vec<Order>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub context: DataSource,
}

impl Query {
    /// Matches every entity of the type.
    pub fn all() -> Self {
        Self {
            filter: None,
            grouped_by: None,
            uniquely: true,
            order: vec![Order::Natural],
            offset: None,
            limit: None,
            context: DataSource::Local,
        }
    }

    pub fn by_identifier(id: Identifier) -> Self {
        Self {
            filter: Some(Filter::identifier_eq(id)),
            ..Self::all()
        }
    }

    /// An identifier-list query whose results preserve the given order.
    pub fn by_identifiers(ids: Vec<Identifier>) -> Self {
        let filter = ids
            .iter()
            .cloned()
            .map(Filter::identifier_eq)
            .reduce(Filter::or);
        Self {
            filter,
            order: vec![Order::Identifiers(ids)],
            ..Self::all()
        }
    }

    pub fn with_filter(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::all()
        }
    }

    pub fn with_context(mut self, context: DataSource) -> Self {
        self.context = context;
        self
    }

    pub fn ordered_by(mut self, order: Order) -> Self {
        self.order = vec![order];
        self
    }

    pub fn matches_all(&self) -> bool {
        self.filter.is_none()
    }

    /// Whether every sort key is usable for stable continuous updates.
    pub fn order_is_deterministic(&self) -> bool {
        !self.order.is_empty() && self.order.iter().all(|o| o.is_deterministic())
    }

    pub fn matches<E: Entity>(&self, entity: &E) -> bool {
        self.filter.as_ref().map(|f| f.matches(entity)).unwrap_or(true)
    }

    /// The flat identifier list this query targets, when its filter is only
    /// identifier equality joined by `Or`.
    pub fn target_identifiers(&self) -> Option<Vec<Identifier>> {
        self.filter.as_ref().and_then(|f| f.extract_identifiers())
    }
}

/// Opaque per-response data carried alongside results so consumers can read
/// server-side pagination or timing headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetadata {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
}

/// The materialized shape of a query's results.
pub struct QueryResult<E> {
    kind: ResultKind<E>,
    pub metadata: Option<EndpointMetadata>,
}

enum ResultKind<E> {
    Entities(Vec<E>),
    /// Converted to `Entities` exactly once, on first access.
    Lazy(Box<dyn Iterator<Item = E> + Send>),
    Groups(BTreeMap<IndexValue, Vec<E>>),
}

impl<E: Entity> QueryResult<E> {
    pub fn entities(entities: Vec<E>) -> Self {
        Self {
            kind: ResultKind::Entities(entities),
            metadata: None,
        }
    }

    pub fn lazy(iter: Box<dyn Iterator<Item = E> + Send>) -> Self {
        Self {
            kind: ResultKind::Lazy(iter),
            metadata: None,
        }
    }

    pub fn groups(groups: BTreeMap<IndexValue, Vec<E>>) -> Self {
        Self {
            kind: ResultKind::Groups(groups),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<EndpointMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Drains the lazy form into an array. Entities and groups pass through.
    pub fn materialized(self) -> Self {
        match self.kind {
            ResultKind::Lazy(iter) => Self {
                kind: ResultKind::Entities(iter.collect()),
                metadata: self.metadata,
            },
            other => Self {
                kind: other,
                metadata: self.metadata,
            },
        }
    }

    /// Every entity in the result, flattening groups in key order.
    pub fn into_entities(self) -> Vec<E> {
        match self.materialized().kind {
            ResultKind::Entities(entities) => entities,
            ResultKind::Groups(groups) => groups.into_values().flatten().collect(),
            ResultKind::Lazy(_) => unreachable!("materialized above"),
        }
    }

    pub fn into_groups(self) -> Option<BTreeMap<IndexValue, Vec<E>>> {
        match self.kind {
            ResultKind::Groups(groups) => Some(groups),
            _ => None,
        }
    }

    pub fn first(self) -> Option<E> {
        self.into_entities().into_iter().next()
    }

    /// Clones every entity out of an already-materialized result, flattening
    /// groups in key order. The lazy form has nothing to clone and yields an
    /// empty snapshot.
    pub fn snapshot(&self) -> Vec<E> {
        match &self.kind {
            ResultKind::Entities(entities) => entities.clone(),
            ResultKind::Groups(groups) => groups.values().flatten().cloned().collect(),
            ResultKind::Lazy(_) => Vec::new(),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for QueryResult<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ResultKind::Entities(entities) => {
                f.debug_tuple("QueryResult::Entities").field(entities).finish()
            }
            ResultKind::Lazy(_) => f.write_str("QueryResult::Lazy(..)"),
            ResultKind::Groups(groups) => {
                f.debug_tuple("QueryResult::Groups").field(groups).finish()
            }
        }
    }
}

/// Shapes raw entities into a query's result: uniquing by identifier (stable,
/// first wins), ordering, offset/limit, then optional grouping.
pub fn build_result<E: Entity>(mut entities: Vec<E>, query: &Query) -> QueryResult<E> {
    if query.uniquely {
        entities = entities
            .into_iter()
            .unique_by(|e| e.identifier())
            .collect();
    }
    sort_entities(&mut entities, &query.order);
    if let Some(offset) = query.offset {
        entities = entities.into_iter().skip(offset).collect();
    }
    if let Some(limit) = query.limit {
        entities.truncate(limit);
    }
    match &query.grouped_by {
        None => QueryResult::entities(entities),
        Some(index) => {
            let mut groups: BTreeMap<IndexValue, Vec<E>> = BTreeMap::new();
            for entity in entities {
                if let Some(key) = index_value_of(&entity, index) {
                    groups.entry(key).or_default().push(entity);
                }
            }
            QueryResult::groups(groups)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::fixtures::TestPost;

    fn posts() -> Vec<TestPost> {
        vec![
            TestPost::new(Identifier::remote("post", 1), "bravo"),
            TestPost::new(Identifier::remote("post", 2), "alpha"),
            TestPost::new(Identifier::remote("post", 3), "charlie"),
        ]
    }

    #[test]
    fn missing_index_comparisons_are_false() {
        let post = TestPost::new(Identifier::remote("post", 1), "x");
        let filter = Filter::property_eq("missing", "x");
        assert!(!filter.matches(&post));
        let gt = Filter::binary(
            Filter::Property(IndexName::new("missing")),
            Operator::Gt,
            Filter::Value(IndexValue::Int(0)),
        );
        assert!(!gt.matches(&post));
    }

    #[test]
    fn match_operator_is_regex_over_string_form() {
        let post = TestPost::new(Identifier::remote("post", 1), "hello world");
        let filter = Filter::binary(
            Filter::Property(IndexName::new("title")),
            Operator::Match,
            Filter::Value(IndexValue::Text("^hello".to_string())),
        );
        assert!(filter.matches(&post));
        let bad = Filter::binary(
            Filter::Property(IndexName::new("title")),
            Operator::Match,
            Filter::Value(IndexValue::Text("(unclosed".to_string())),
        );
        assert!(!bad.matches(&post));
    }

    #[test]
    fn contained_in_uses_set_membership() {
        let post = TestPost::new(Identifier::remote("post", 1), "alpha");
        let filter = Filter::binary(
            Filter::Property(IndexName::new("title")),
            Operator::ContainedIn,
            Filter::Values(BTreeSet::from([
                IndexValue::Text("alpha".to_string()),
                IndexValue::Text("beta".to_string()),
            ])),
        );
        assert!(filter.matches(&post));
    }

    #[test]
    fn negation_and_conjunction_compose() {
        let post = TestPost::new(Identifier::remote("post", 1), "alpha");
        let filter = Filter::property_eq("title", "alpha")
            .and(Filter::property_eq("title", "beta").negated());
        assert!(filter.matches(&post));
    }

    #[test]
    fn identifier_or_filters_extract_to_a_flat_list() {
        let a = Identifier::remote("post", 1);
        let b = Identifier::remote("post", 2);
        let filter = Filter::identifier_eq(a.clone()).or(Filter::identifier_eq(b.clone()));
        assert_eq!(filter.extract_identifiers(), Some(vec![a, b]));

        let mixed = Filter::identifier_eq(Identifier::remote("post", 1))
            .and(Filter::property_eq("title", "x"));
        assert_eq!(mixed.extract_identifiers(), None);
    }

    #[test]
    fn ascending_and_descending_orders_sort_by_index() {
        let mut asc = posts();
        sort_entities(&mut asc, &[Order::Asc(IndexName::new("title"))]);
        let titles: Vec<_> = asc.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["alpha", "bravo", "charlie"]);

        let mut desc = posts();
        sort_entities(&mut desc, &[Order::Desc(IndexName::new("title"))]);
        let titles: Vec<_> = desc.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["charlie", "bravo", "alpha"]);
    }

    #[test]
    fn identifier_order_places_unknowns_at_the_end() {
        let mut entities = posts();
        let order = Order::Identifiers(vec![
            Identifier::remote("post", 3),
            Identifier::remote("post", 1),
        ]);
        sort_entities(&mut entities, &[order]);
        let ids: Vec<_> = entities
            .iter()
            .map(|p| p.identifier().remote_value().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn natural_order_never_reorders() {
        let mut entities = posts();
        sort_entities(&mut entities, &[Order::Natural]);
        let titles: Vec<_> = entities.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["bravo", "alpha", "charlie"]);
    }

    #[test]
    fn result_construction_uniques_orders_and_paginates() {
        let mut entities = posts();
        entities.push(TestPost::new(Identifier::remote("post", 1), "duplicate"));
        let query = Query {
            order: vec![Order::Asc(IndexName::new("title"))],
            offset: Some(1),
            limit: Some(1),
            ..Query::all()
        };
        let result = build_result(entities, &query).into_entities();
        // The duplicate of post 1 is dropped (first wins), leaving
        // alpha/bravo/charlie; offset 1 + limit 1 selects bravo.
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].title, "bravo");
    }

    #[test]
    fn grouping_buckets_by_index_value() {
        let entities = vec![
            TestPost::new(Identifier::remote("post", 1), "a"),
            TestPost::new(Identifier::remote("post", 2), "a"),
            TestPost::new(Identifier::remote("post", 3), "b"),
        ];
        let query = Query {
            grouped_by: Some(IndexName::new("title")),
            ..Query::all()
        };
        let groups = build_result(entities, &query).into_groups().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&IndexValue::Text("a".to_string())].len(), 2);
        assert_eq!(groups[&IndexValue::Text("b".to_string())].len(), 1);
    }

    #[test]
    fn lazy_results_materialize_once() {
        let entities = posts();
        let result = QueryResult::lazy(Box::new(entities.clone().into_iter()));
        let materialized = result.materialized();
        assert_eq!(materialized.into_entities().len(), 3);
    }

    #[test]
    fn filter_serde_round_trip_is_identity() {
        let filter = Filter::identifier_eq(Identifier::remote("post", 1))
            .or(Filter::property_eq("title", "x"));
        let encoded = serde_json::to_string(&filter).unwrap();
        let decoded: Filter = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, filter);
    }
}
