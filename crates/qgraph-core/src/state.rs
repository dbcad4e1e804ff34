//! Node lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of a single quantum node over the life of a run.
///
/// ```text
/// Pending  --(all predecessors Succeeded)-->  Ready
/// Ready    --(dispatch)-->                    Running
/// Running  --(completion)-->                  Succeeded | Failed | TimedOut
/// Pending | Ready --(a predecessor terminal but not Succeeded)--> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl NodeState {
    /// Terminal states are `Succeeded`, `Failed`, `TimedOut`, `Skipped`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::TimedOut | NodeState::Skipped
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, NodeState::Succeeded)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::TimedOut => "timed-out",
            NodeState::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}
