//! The tuple that identifies one distributed build across every participant.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable identity shared by every participant in one distributed build.
///
/// Created once at process start and carried on every call; compared for
/// equality by all three fields. A mismatch between a caller's id and a
/// server's local id is unrecoverable for that call (but not for the
/// channel: other calls bearing the right id may still succeed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DistributedInvocationId {
    related_activity_id: String,
    environment: String,
    engine_version: String,
}

impl DistributedInvocationId {
    /// Construct an id from its three components.
    pub fn new(
        related_activity_id: impl Into<String>,
        environment: impl Into<String>,
        engine_version: impl Into<String>,
    ) -> Self {
        DistributedInvocationId {
            related_activity_id: related_activity_id.into(),
            environment: environment.into(),
            engine_version: engine_version.into(),
        }
    }

    /// The related-activity id component.
    pub fn related_activity_id(&self) -> &str {
        &self.related_activity_id
    }

    /// The environment component.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The engine-version component.
    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// True if every field is empty.
    ///
    /// `parse_headers` builds an id from whatever subset of fields a peer
    /// sent; a fully-empty id never compares equal to anything (including
    /// another fully-empty id), since an absent id should never be mistaken
    /// for a match.
    pub fn is_empty(&self) -> bool {
        self.related_activity_id.is_empty() && self.environment.is_empty() && self.engine_version.is_empty()
    }

    /// Compare against another id, the way the server does for every inbound
    /// call: empty ids never match, even each other.
    pub fn matches(&self, other: &DistributedInvocationId) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self == other
    }
}

impl fmt::Display for DistributedInvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.related_activity_id, self.environment, self.engine_version
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equal_ids_match() {
        let a = DistributedInvocationId::new("act", "prod", "1.2.3");
        let b = DistributedInvocationId::new("act", "prod", "1.2.3");
        assert!(a.matches(&b));
    }

    #[test]
    fn differing_engine_version_does_not_match() {
        let a = DistributedInvocationId::new("act", "prod", "1.2.3");
        let b = DistributedInvocationId::new("act", "prod", "1.2.4");
        assert!(!a.matches(&b));
    }

    #[test]
    fn empty_ids_never_match_even_each_other() {
        let a = DistributedInvocationId::default();
        let b = DistributedInvocationId::default();
        assert!(!a.matches(&b));
    }
}
