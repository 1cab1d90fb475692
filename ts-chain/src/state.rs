//! Stage lifecycle state

use serde::Serialize;

/// Lifecycle of one stage runner.
///
/// `Init → Started → Running ⇄ Suspended → Stopping → Stopped`, with `Failed`
/// reachable when the plugin cannot be constructed or started. A restart takes
/// a live stage back through `Stopping → Stopped → Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    /// Plugin instance is being constructed
    Init,
    /// Start hook succeeded, thread not yet moving packets
    Started,
    /// Moving packets through the plugin
    Running,
    /// Moving packets without invoking the plugin
    Suspended,
    /// Stop hook in progress
    Stopping,
    /// Plugin instance torn down
    Stopped,
    /// Construction or start failed; the slot behaves as an absent stage
    Failed,
}

impl StageState {
    pub fn can_transition_to(&self, target: &StageState) -> bool {
        use StageState::*;

        match (self, target) {
            (Init, Started) => true,
            (Init, Failed) => true,

            (Started, Running) => true,
            (Started, Suspended) => true,
            (Started, Failed) => true,
            (Started, Stopping) => true,

            (Running, Suspended) => true,
            (Running, Stopping) => true,

            (Suspended, Running) => true,
            (Suspended, Stopping) => true,

            (Stopping, Stopped) => true,

            // restart
            (Stopped, Init) => true,
            (Failed, Init) => true,
            (Failed, Stopped) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageState::Init => "init",
            StageState::Started => "started",
            StageState::Running => "running",
            StageState::Suspended => "suspended",
            StageState::Stopping => "stopping",
            StageState::Stopped => "stopped",
            StageState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
