//! Wire protocol for the control socket (§6.1). One JSON object per line,
//! same push/pull shape as the teacher's command channel: a request gets
//! exactly one `Response`, except `RegisterTetheringEventCallback`, whose
//! connection is then kept open and fed a `TetherEvent` per line until the
//! caller disconnects or sends `UnregisterTetheringEventCallback`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::caller::CallerContext;
use crate::downstream::{DownstreamType, TetheringRequest};
use crate::error::ErrorCode;
use crate::event::IpServerSnapshot;
use crate::orchestrator_state::OrchestratorState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Tether { caller: CallerContext, request: TetheringRequest },
    Untether { caller: CallerContext, interface_name: String },
    StartTethering { caller: CallerContext, request: TetheringRequest },
    StopTethering { caller: CallerContext, downstream_type: DownstreamType },
    StopAllTethering { caller: CallerContext },
    SetUsbTethering { caller: CallerContext, enable: bool },
    RequestLatestTetheringEntitlementResult { caller: CallerContext, downstream_type: DownstreamType, show_entitlement_ui: bool },
    RegisterTetheringEventCallback { caller: CallerContext },
    UnregisterTetheringEventCallback { caller: CallerContext },
    IsTetheringSupported { caller: CallerContext },
    SetPreferTestNetworks { caller: CallerContext, prefer: bool },
    Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Result { code: ErrorCode },
    EntitlementResult { code: ErrorCode, entitled: Option<bool> },
    TetheringSupported { supported: bool, types: Vec<DownstreamType> },
    Status { orchestrator_state: OrchestratorState, servers: Vec<IpServerSnapshot> },
    /// First reply to a successful `RegisterTetheringEventCallback`; every
    /// line after this one on the same connection is a `TetherEvent`.
    Registered,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{json}")
    }
}

impl FromStr for Command {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{json}")
    }
}

impl FromStr for Response {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}
