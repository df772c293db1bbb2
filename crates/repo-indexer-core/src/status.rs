//! Repository indexing status and its allowed transitions.
//!
//! ```text
//!            claim              clone ok
//! Pending ─────────▶ Cloning ─────────▶ Indexing ─────────▶ Completed
//!    ▲                  │                  │                    │
//!    │                  ▼                  ▼                    │
//!    │               Failed ◀──────────────┘                    │
//!    └──────────────────┴───── reindex ─────────────────────────┘
//! ```
//!
//! Every status change goes through [`Status::can_transition_to`]; stores
//! apply the change as a compare-and-swap on the previous status so two
//! writers can never both succeed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Cloning,
    Indexing,
    Completed,
    Failed,
}

/// Every edge of the state machine. Anything not listed is rejected.
///
/// The `Cloning -> Pending` and `Indexing -> Pending` edges are only taken
/// by stale-run recovery; re-index requests refuse active repositories.
const TRANSITIONS: &[(Status, Status)] = &[
    (Status::Pending, Status::Cloning),
    (Status::Cloning, Status::Indexing),
    (Status::Cloning, Status::Failed),
    (Status::Cloning, Status::Pending),
    (Status::Indexing, Status::Completed),
    (Status::Indexing, Status::Failed),
    (Status::Indexing, Status::Pending),
    (Status::Completed, Status::Pending),
    (Status::Failed, Status::Pending),
];

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Cloning,
        Status::Indexing,
        Status::Completed,
        Status::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Cloning => "cloning",
            Status::Indexing => "indexing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    /// A pipeline run currently owns the repository.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Cloning | Status::Indexing)
    }

    /// End state of a single run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        TRANSITIONS.iter().any(|&(from, to)| from == *self && to == next)
    }

    /// Statuses from which `next` may be entered.
    pub fn predecessors(next: Status) -> Vec<Status> {
        TRANSITIONS
            .iter()
            .filter(|(_, to)| *to == next)
            .map(|(from, _)| *from)
            .collect()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted status string is not one of the known values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown repository status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_allowed() {
        assert!(Status::Pending.can_transition_to(Status::Cloning));
        assert!(Status::Cloning.can_transition_to(Status::Indexing));
        assert!(Status::Indexing.can_transition_to(Status::Completed));
        assert!(Status::Completed.can_transition_to(Status::Pending));
    }

    #[test]
    fn test_failure_edges() {
        assert!(Status::Cloning.can_transition_to(Status::Failed));
        assert!(Status::Indexing.can_transition_to(Status::Failed));
        assert!(Status::Failed.can_transition_to(Status::Pending));
    }

    #[test]
    fn test_rejected_edges() {
        assert!(!Status::Pending.can_transition_to(Status::Indexing));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::Cloning.can_transition_to(Status::Completed));
        assert!(!Status::Completed.can_transition_to(Status::Failed));
        assert!(!Status::Failed.can_transition_to(Status::Completed));
        for s in Status::ALL {
            assert!(!s.can_transition_to(s), "self-loop allowed for {}", s);
        }
    }

    #[test]
    fn test_active_and_terminal_are_disjoint() {
        for s in Status::ALL {
            assert!(!(s.is_active() && s.is_terminal()));
        }
        assert!(Status::Cloning.is_active());
        assert!(Status::Indexing.is_active());
        assert!(!Status::Pending.is_active());
    }

    #[test]
    fn test_parse_display() {
        for s in Status::ALL {
            assert_eq!(s.to_string().parse::<Status>().unwrap(), s);
        }
        assert!("queued".parse::<Status>().is_err());
    }

    #[test]
    fn test_predecessors_of_pending() {
        let preds = Status::predecessors(Status::Pending);
        assert!(preds.contains(&Status::Completed));
        assert!(preds.contains(&Status::Failed));
        assert!(!preds.contains(&Status::Pending));
    }
}
