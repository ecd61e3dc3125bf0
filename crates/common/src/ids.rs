//! Typed identifiers shared across backplane/worker components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable worker identifier used in scheduling and liveness reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(
    /// Raw identifier value.
    pub String,
);

impl WorkerId {
    /// Borrow the raw identifier value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        WorkerId(value.to_string())
    }
}

/// Base name of a distributed work queue.
///
/// The name is the backplane list key for the pending list. The in-flight
/// sibling list key is derived by [`QueueName::dequeue_name`]; the `_dequeue`
/// suffix is reserved and must not be used as a base name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(
    /// Raw queue name value.
    pub String,
);

impl QueueName {
    /// Borrow the pending-list key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the in-flight sibling list holding popped-but-unacknowledged
    /// entries.
    pub fn dequeue_name(&self) -> String {
        format!("{}_dequeue", self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueueName {
    fn from(value: &str) -> Self {
        QueueName(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::QueueName;

    #[test]
    fn dequeue_name_appends_reserved_suffix() {
        let q = QueueName::from("{ops}:cpu");
        assert_eq!(q.dequeue_name(), "{ops}:cpu_dequeue");
    }
}
