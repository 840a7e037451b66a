use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::identifier::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Delete,
    Post,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }

    /// Safe methods do not mutate server state and are deduplicated by
    /// default.
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl From<Method> for http::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => http::Method::GET,
            Method::Head => http::Method::HEAD,
            Method::Delete => http::Method::DELETE,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
        }
    }
}

/// A request path as a tree of components and identifier placeholders.
/// Flattening yields segments in left-to-right order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Path {
    Component(String),
    Identifier(Identifier),
    Join(Box<Path>, Box<Path>),
}

impl Path {
    pub fn component(segment: impl Into<String>) -> Self {
        Path::Component(segment.into())
    }

    pub fn identifier(id: Identifier) -> Self {
        Path::Identifier(id)
    }

    /// Appends `child` under `self`.
    pub fn child(self, child: Path) -> Self {
        Path::Join(Box::new(self), Box::new(child))
    }

    pub fn child_component(self, segment: impl Into<String>) -> Self {
        self.child(Path::component(segment))
    }

    pub fn child_identifier(self, id: Identifier) -> Self {
        self.child(Path::identifier(id))
    }

    /// The flattened segment list, in rendering order.
    pub fn parts(&self) -> Vec<PathPart> {
        let mut parts = Vec::new();
        self.collect_parts(&mut parts);
        parts
    }

    fn collect_parts(&self, parts: &mut Vec<PathPart>) {
        match self {
            Path::Component(segment) => parts.push(PathPart::Component(segment.clone())),
            Path::Identifier(id) => parts.push(PathPart::Identifier(id.clone())),
            Path::Join(parent, child) => {
                parent.collect_parts(parts);
                child.collect_parts(parts);
            }
        }
    }

    /// Whether any segment is still an unresolved local identifier.
    pub fn has_placeholder(&self) -> bool {
        match self {
            Path::Component(_) => false,
            Path::Identifier(id) => !id.is_synced(),
            Path::Join(parent, child) => parent.has_placeholder() || child.has_placeholder(),
        }
    }

    fn substituting(&self, resolved: &HashMap<String, Identifier>) -> Path {
        match self {
            Path::Component(_) => self.clone(),
            Path::Identifier(id) => match id.local_value().and_then(|l| resolved.get(l)) {
                Some(merged) => Path::Identifier(merged.clone()),
                None => self.clone(),
            },
            Path::Join(parent, child) => Path::Join(
                Box::new(parent.substituting(resolved)),
                Box::new(child.substituting(resolved)),
            ),
        }
    }
}

impl From<&str> for Path {
    /// Splits a literal path on `/` into joined components.
    fn from(path: &str) -> Self {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = Path::component(segments.next().unwrap_or_default());
        segments.fold(first, |acc, s| acc.child_component(s))
    }
}

/// A flattened path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPart {
    Component(String),
    Identifier(Identifier),
}

/// The value side of a query item. Arrays emit repeated `key[]=value` pairs;
/// nesting arrays is a construction error caught at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryValue {
    Scalar(String),
    Array(Vec<QueryValue>),
    Identifier(Identifier),
}

impl QueryValue {
    fn substituting(&self, resolved: &HashMap<String, Identifier>) -> QueryValue {
        match self {
            QueryValue::Scalar(_) => self.clone(),
            QueryValue::Identifier(id) => match id.local_value().and_then(|l| resolved.get(l)) {
                Some(merged) => QueryValue::Identifier(merged.clone()),
                None => self.clone(),
            },
            QueryValue::Array(values) => {
                QueryValue::Array(values.iter().map(|v| v.substituting(resolved)).collect())
            }
        }
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::Scalar(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Body {
    Raw(Vec<u8>),
    /// Form pairs encoded as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachePolicy {
    #[default]
    UseProtocol,
    IgnoreCache,
    PreferCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Synchronization {
    /// May run alongside other concurrent requests.
    Concurrent,
    /// Must be the only request executing for its duration.
    Barrier,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryPolicy {
    OnNetworkInterrupt,
    OnRequestTimeout,
    OnCustomErrorCodes(Vec<u16>),
    OnAllErrorCodesExcept(Vec<u16>),
}

/// Controls how a request behaves inside the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueingStrategy {
    pub synchronization: Synchronization,
    pub retry_policies: Vec<RetryPolicy>,
}

impl QueueingStrategy {
    /// GET/HEAD run concurrently without retries; mutating methods run as
    /// barriers and reschedule on connectivity loss and timeouts.
    pub fn default_for(method: Method) -> Self {
        if method.is_safe() {
            Self {
                synchronization: Synchronization::Concurrent,
                retry_policies: Vec::new(),
            }
        } else {
            Self {
                synchronization: Synchronization::Barrier,
                retry_policies: vec![
                    RetryPolicy::OnNetworkInterrupt,
                    RetryPolicy::OnRequestTimeout,
                ],
            }
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.synchronization == Synchronization::Barrier
    }

    pub fn retries_on_network_interrupt(&self) -> bool {
        self.retry_policies
            .iter()
            .any(|p| matches!(p, RetryPolicy::OnNetworkInterrupt))
    }

    pub fn retries_on_timeout(&self) -> bool {
        self.retry_policies
            .iter()
            .any(|p| matches!(p, RetryPolicy::OnRequestTimeout))
    }

    pub fn retries_on_status(&self, status: u16) -> bool {
        self.retry_policies.iter().any(|p| match p {
            RetryPolicy::OnCustomErrorCodes(codes) => codes.contains(&status),
            RetryPolicy::OnAllErrorCodesExcept(codes) => !codes.contains(&status),
            _ => false,
        })
    }
}

/// Immutable description of one HTTP request. Two configs are equal iff their
/// core fields are equal; `tag` and `deduplicate` are bookkeeping and do not
/// participate in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub method: Method,
    pub host: Option<String>,
    pub path: Path,
    pub query: Vec<(String, QueryValue)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    pub timeout: Option<Duration>,
    pub cache_policy: CachePolicy,
    pub queueing: QueueingStrategy,
    pub background: bool,
    pub tag: Option<String>,
    pub deduplicate: bool,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<Path>) -> Self {
        Self {
            method,
            host: None,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            cache_policy: CachePolicy::default(),
            queueing: QueueingStrategy::default_for(method),
            background: false,
            tag: None,
            deduplicate: method.is_safe(),
        }
    }

    pub fn get(path: impl Into<Path>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<Path>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<Path>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<Path>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Whether the path or query still carry an unresolved local identifier.
    pub fn has_placeholder(&self) -> bool {
        self.path.has_placeholder()
            || self.query.iter().any(|(_, v)| query_value_has_placeholder(v))
    }

    /// Rewrites identifier placeholders in the path and query from merged
    /// identifiers, keyed by the local value they resolve.
    pub fn substituting(&self, resolved: &HashMap<String, Identifier>) -> RequestConfig {
        let mut cfg = self.clone();
        cfg.path = self.path.substituting(resolved);
        cfg.query = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.substituting(resolved)))
            .collect();
        cfg
    }
}

fn query_value_has_placeholder(value: &QueryValue) -> bool {
    match value {
        QueryValue::Scalar(_) => false,
        QueryValue::Identifier(id) => !id.is_synced(),
        QueryValue::Array(values) => values.iter().any(query_value_has_placeholder),
    }
}

impl PartialEq for RequestConfig {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.host == other.host
            && self.path == other.path
            && self.query == other.query
            && self.headers == other.headers
            && self.body == other.body
            && self.timeout == other.timeout
            && self.cache_policy == other.cache_policy
            && self.queueing == other.queueing
            && self.background == other.background
    }
}

impl Eq for RequestConfig {}

impl Hash for RequestConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.method.hash(state);
        self.host.hash(state);
        self.path.hash(state);
        self.query.hash(state);
        self.headers.hash(state);
        self.body.hash(state);
        self.timeout.hash(state);
        self.cache_policy.hash(state);
        self.queueing.hash(state);
        self.background.hash(state);
    }
}
