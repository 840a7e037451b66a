use std::{error::Error, fmt, result};

use serde_json::Value;

pub type Result<T, E = StrataError> = result::Result<T, E>;

/// Classifies transport-level failures. Mirrors the failure codes surfaced by
/// URL loading stacks so that retry policies can match on them without
/// knowledge of the concrete [Transport][crate::client::transport::Transport].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionLost,
    NotConnected,
    TimedOut,
    Cancelled,
    BadUrl,
    UnsupportedUrl,
    CannotFindHost,
    CannotConnectToHost,
    DnsLookupFailed,
    BadServerResponse,
    UserCancelledAuth,
    UserAuthRequired,
    Unknown,
    Other(i64),
}

impl NetworkErrorKind {
    /// True for failures caused by losing connectivity mid-flight or having
    /// none at all. The queue processor reschedules requests on these.
    pub fn is_network_interrupt(&self) -> bool {
        matches!(
            self,
            NetworkErrorKind::ConnectionLost | NetworkErrorKind::NotConnected
        )
    }
}

/// Classifies failures raised by local store engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The engine does not service the requested level or operation.
    NotApplicable,
    /// The backing engine is unavailable.
    NotReachable,
    Io(String),
    Corrupted(String),
    Engine(String),
    InvalidContext(String),
}

impl StoreErrorKind {
    /// The subset of store failures for which a `RemoteOrLocal` read is
    /// allowed to fall back to local results.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            StoreErrorKind::NotReachable | StoreErrorKind::Io(_) | StoreErrorKind::Engine(_)
        )
    }
}

/// Crate-wide error taxonomy. Variants are cheap to clone so that a single
/// outcome can fan out to every deduplication waiter; foreign error types are
/// carried as strings for the same reason.
#[derive(Debug, Clone, PartialEq)]
pub enum StrataError {
    /// The transport produced a response that is not HTTP.
    ProtocolNotHttp,
    Network(NetworkErrorKind),
    Parsing(String),
    UrlConstruction(String),
    Deserialization(String),
    Api {
        status: u16,
        payload: Option<Value>,
        raw: Option<String>,
    },
    Store(StoreErrorKind),
    /// A write was superseded by a newer one. Callers of `set` never observe
    /// this directly; the current value is returned instead.
    Conflict,
    NotSupported(String),
    /// An internal invariant was broken but recovered.
    Logical(String),
    /// The access level denied the operation or changed while it ran.
    AccessInvalid,
}

impl StrataError {
    /// Whether a `RemoteOrLocal` read may satisfy itself from local stores
    /// after this failure.
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            StrataError::Network(kind) => matches!(
                kind,
                NetworkErrorKind::ConnectionLost
                    | NetworkErrorKind::NotConnected
                    | NetworkErrorKind::TimedOut
                    | NetworkErrorKind::CannotFindHost
                    | NetworkErrorKind::CannotConnectToHost
                    | NetworkErrorKind::DnsLookupFailed
            ),
            StrataError::Store(kind) => kind.is_fallback_eligible(),
            _ => false,
        }
    }
}

impl Error for StrataError {}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StrataError::ProtocolNotHttp => {
                write!(f, "transport returned a non HTTP response")
            }
            StrataError::Network(kind) => write!(f, "network error: {:?}", kind),
            StrataError::Parsing(s) => write!(f, "parsing error: {}", s),
            StrataError::UrlConstruction(s) => write!(f, "could not construct request url: {}", s),
            StrataError::Deserialization(s) => write!(f, "could not decode response body: {}", s),
            StrataError::Api { status, raw, .. } => match raw {
                Some(raw) => write!(f, "api error with status {}: {}", status, raw),
                None => write!(f, "api error with status {}", status),
            },
            StrataError::Store(kind) => write!(f, "store engine error: {:?}", kind),
            StrataError::Conflict => write!(f, "write superseded by a newer one"),
            StrataError::NotSupported(s) => write!(f, "operation not supported: {}", s),
            StrataError::Logical(s) => write!(f, "internal invariant broken: {}", s),
            StrataError::AccessInvalid => {
                write!(f, "access level denied the operation or changed mid flight")
            }
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Deserialization(e.to_string())
    }
}

impl From<url::ParseError> for StrataError {
    fn from(e: url::ParseError) -> Self {
        StrataError::UrlConstruction(e.to_string())
    }
}

impl From<std::io::Error> for StrataError {
    fn from(e: std::io::Error) -> Self {
        StrataError::Store(StoreErrorKind::Io(e.to_string()))
    }
}

impl From<object_store::Error> for StrataError {
    fn from(e: object_store::Error) -> Self {
        StrataError::Store(StoreErrorKind::Engine(e.to_string()))
    }
}

impl From<object_store::path::Error> for StrataError {
    fn from(e: object_store::path::Error) -> Self {
        StrataError::Store(StoreErrorKind::Engine(e.to_string()))
    }
}

impl From<regex::Error> for StrataError {
    fn from(e: regex::Error) -> Self {
        StrataError::Parsing(e.to_string())
    }
}
