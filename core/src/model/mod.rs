pub mod entity;
pub mod graph;
pub mod identifier;
pub mod query;
pub mod request;
pub mod update_time;

pub use entity::{Entity, IndexName, IndexValue, RelationshipIdentifier, Subtype};
pub use graph::{EntityGraph, GraphNode};
pub use identifier::{Identifier, IdentifierValue};
pub use query::{EndpointMetadata, Filter, Operator, Order, Query, QueryResult};
pub use request::{Method, Path, QueryValue, RequestConfig};
pub use update_time::UpdateTime;
