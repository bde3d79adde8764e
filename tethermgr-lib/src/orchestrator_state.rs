//! Top-level TetherOrchestrator state (§3, §4.6). The transition behavior
//! lives in `tethermgr::orchestrator`; this enum is the shape reported over
//! the IPC boundary in a `Command::Status` response.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Initial,
    TetherModeAlive,
    IpForwardEnableError,
    IpForwardDisableError,
    StartTetherError,
    StopTetherError,
    DnsForwardersError,
}

impl OrchestratorState {
    /// Error states are terminal except for an explicit `CLEAR_ERROR`, which
    /// returns the orchestrator to `Initial`.
    pub fn is_error(self) -> bool {
        !matches!(self, OrchestratorState::Initial | OrchestratorState::TetherModeAlive)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OrchestratorState::Initial => "initial",
            OrchestratorState::TetherModeAlive => "tether mode alive",
            OrchestratorState::IpForwardEnableError => "ip forward enable error",
            OrchestratorState::IpForwardDisableError => "ip forward disable error",
            OrchestratorState::StartTetherError => "start tether error",
            OrchestratorState::StopTetherError => "stop tether error",
            OrchestratorState::DnsForwardersError => "dns forwarders error",
        };
        write!(f, "{s}")
    }
}
