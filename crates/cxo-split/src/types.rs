use serde::{Deserialize, Serialize};

/// Lifecycle of one fill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillState {
    #[default]
    Running,
    Success,
    Failed,
    Terminated,
}

impl FillState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, FillState::Running)
    }
}

/// Counters of a fill.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    /// Objects received from peers and stored.
    pub fetched: usize,
    /// Objects found in the local store.
    pub local: usize,
    /// Subtrees not descended into because another owner already holds them.
    pub skipped: usize,
}
