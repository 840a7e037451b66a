use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Nanosecond timestamp ordering competing mutations to the same identifier.
/// A mutation is applied only when its update time strictly exceeds the
/// stored one; [UpdateTime::ceiling] always wins and is used for synthetic
/// writes that must not be rejected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UpdateTime(pub u64);

impl UpdateTime {
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        UpdateTime(nanos)
    }

    pub fn ceiling() -> Self {
        UpdateTime(u64::MAX)
    }

    pub fn is_ceiling(&self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether a mutation carrying this time supersedes a stored one. A nil
    /// stored time is always superseded; the ceiling bypasses the check.
    pub fn supersedes(&self, stored: Option<UpdateTime>) -> bool {
        if self.is_ceiling() {
            return true;
        }
        match stored {
            None => true,
            Some(stored) => *self > stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_always_superseded() {
        assert!(UpdateTime(0).supersedes(None));
    }

    #[test]
    fn equal_or_older_times_do_not_supersede() {
        assert!(!UpdateTime(100).supersedes(Some(UpdateTime(100))));
        assert!(!UpdateTime(50).supersedes(Some(UpdateTime(100))));
        assert!(UpdateTime(101).supersedes(Some(UpdateTime(100))));
    }

    #[test]
    fn ceiling_bypasses_the_check() {
        assert!(UpdateTime::ceiling().supersedes(Some(UpdateTime(u64::MAX))));
    }
}
