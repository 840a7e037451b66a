use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// The two kinds of entity keys. A `Local` value is assigned by this client
/// before the entity has ever been synchronized; a `Remote` value is assigned
/// by the server and optionally remembers the local value it replaced so that
/// in-flight references to the local key can still be resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IdentifierValue {
    Local(String),
    Remote {
        remote: i64,
        local: Option<String>,
    },
}

/// Uniquely keys an entity within its type namespace. Two identifiers of the
/// same kind compare by embedded value; across kinds, remote sorts before
/// local. The remembered local value of a remote identifier does not
/// participate in equality or hashing, so a map keyed by identifiers resolves
/// a remote key regardless of its local history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    pub type_uid: String,
    pub value: IdentifierValue,
}

impl Identifier {
    pub fn local(type_uid: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            type_uid: type_uid.into(),
            value: IdentifierValue::Local(local.into()),
        }
    }

    pub fn remote(type_uid: impl Into<String>, remote: i64) -> Self {
        Self {
            type_uid: type_uid.into(),
            value: IdentifierValue::Remote {
                remote,
                local: None,
            },
        }
    }

    pub fn remote_with_local(
        type_uid: impl Into<String>,
        remote: i64,
        local: impl Into<String>,
    ) -> Self {
        Self {
            type_uid: type_uid.into(),
            value: IdentifierValue::Remote {
                remote,
                local: Some(local.into()),
            },
        }
    }

    /// Whether this identifier has been assigned by the server.
    pub fn is_synced(&self) -> bool {
        matches!(self.value, IdentifierValue::Remote { .. })
    }

    pub fn local_value(&self) -> Option<&str> {
        match &self.value {
            IdentifierValue::Local(local) => Some(local),
            IdentifierValue::Remote { local, .. } => local.as_deref(),
        }
    }

    pub fn remote_value(&self) -> Option<i64> {
        match &self.value {
            IdentifierValue::Local(_) => None,
            IdentifierValue::Remote { remote, .. } => Some(*remote),
        }
    }

    /// Renders the placeholder form `:identifier_<type_uid>:<local>` used in
    /// request paths and query values until the local value is resolved by a
    /// merge. Only local-kind identifiers are placeholders.
    pub fn placeholder(&self) -> Option<String> {
        match &self.value {
            IdentifierValue::Local(local) => {
                Some(format!(":identifier_{}:{}", self.type_uid, local))
            }
            IdentifierValue::Remote { .. } => None,
        }
    }

    /// Combines two identifiers for the same logical entity. Allowed iff their
    /// non-nil local parts agree and their non-nil remote parts agree; the
    /// result keeps the remote value and remembers the local one.
    pub fn merge(&self, other: &Identifier) -> Result<Identifier> {
        if self.type_uid != other.type_uid {
            return Err(StrataError::Logical(format!(
                "cannot merge identifiers of types {} and {}",
                self.type_uid, other.type_uid
            )));
        }
        let local = match (self.local_value(), other.local_value()) {
            (Some(a), Some(b)) if a != b => {
                return Err(StrataError::Logical(format!(
                    "cannot merge identifiers with local values {} and {}",
                    a, b
                )))
            }
            (a, b) => a.or(b).map(str::to_string),
        };
        let remote = match (self.remote_value(), other.remote_value()) {
            (Some(a), Some(b)) if a != b => {
                return Err(StrataError::Logical(format!(
                    "cannot merge identifiers with remote values {} and {}",
                    a, b
                )))
            }
            (a, b) => a.or(b),
        };
        let value = match (remote, local) {
            (Some(remote), local) => IdentifierValue::Remote { remote, local },
            (None, Some(local)) => IdentifierValue::Local(local),
            (None, None) => {
                return Err(StrataError::Logical(
                    "merge produced an identifier with no value".to_string(),
                ))
            }
        };
        Ok(Identifier {
            type_uid: self.type_uid.clone(),
            value,
        })
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        if self.type_uid != other.type_uid {
            return false;
        }
        match (&self.value, &other.value) {
            (IdentifierValue::Local(a), IdentifierValue::Local(b)) => a == b,
            (
                IdentifierValue::Remote { remote: a, .. },
                IdentifierValue::Remote { remote: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_uid.hash(state);
        match &self.value {
            IdentifierValue::Local(local) => {
                1u8.hash(state);
                local.hash(state);
            }
            IdentifierValue::Remote { remote, .. } => {
                0u8.hash(state);
                remote.hash(state);
            }
        }
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_uid
            .cmp(&other.type_uid)
            .then_with(|| match (&self.value, &other.value) {
                (IdentifierValue::Remote { remote: a, .. }, IdentifierValue::Remote { remote: b, .. }) => {
                    a.cmp(b)
                }
                (IdentifierValue::Local(a), IdentifierValue::Local(b)) => a.cmp(b),
                (IdentifierValue::Remote { .. }, IdentifierValue::Local(_)) => Ordering::Less,
                (IdentifierValue::Local(_), IdentifierValue::Remote { .. }) => Ordering::Greater,
            })
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            IdentifierValue::Local(local) => write!(f, "{}:local:{}", self.type_uid, local),
            IdentifierValue::Remote { remote, .. } => {
                write!(f, "{}:remote:{}", self.type_uid, remote)
            }
        }
    }
}
