//! Per-chunk operation status.

use serde::{Deserialize, Serialize};

/// Outcome of the last operation that touched a chunk.
///
/// Every load, sort and merge writes exactly one status to each chunk it touches,
/// so the orchestrator can decide what to schedule next without inspecting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Operation completed.
    Success,
    /// Chunk capacity was exhausted while loading. Expected, the remainder must be
    /// routed to a fresh chunk.
    NoSpace,
    /// Comparator or data access failure. The owning sort job is aborted and the
    /// chunk contents must be discarded.
    Fault,
}

impl Status {
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    pub fn is_fault(&self) -> bool {
        *self == Status::Fault
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Success
    }
}
