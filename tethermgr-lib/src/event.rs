//! Listener-facing event types (§4.8). These are the payloads the
//! `CallbackRegistry` fans out to registered listeners, privilege-redacted
//! per listener cookie before being serialized onto the control socket.

use serde::{Deserialize, Serialize};

use crate::downstream::{DownstreamType, SoftApConfig};
use crate::error::ErrorCode;
use crate::ip_server_state::{IpServerPhase, ServingMode};
use crate::orchestrator_state::OrchestratorState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpServerSnapshot {
    pub interface_name: String,
    pub downstream_type: DownstreamType,
    pub phase: IpServerPhase,
    pub serving_mode: Option<ServingMode>,
    pub last_error: ErrorCode,
    /// Present only when the listener owns the request or holds system
    /// privilege (cookie check in §4.8 / §9's open question on redaction).
    pub soft_ap_config: Option<SoftApConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpstreamSummary {
    pub interface_name: String,
    pub kind: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OffloadStatus {
    Started,
    Stopped,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub mac_address: String,
    pub interface_name: String,
}

/// The event stream a registered listener receives, one JSON line per event,
/// on the same connection the registration response was sent on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TetherEvent {
    SupportedTypesChanged(Vec<DownstreamType>),
    UpstreamChanged(Option<UpstreamSummary>),
    ConfigurationChanged,
    OrchestratorStateChanged(OrchestratorState),
    TetherStatesChanged(Vec<IpServerSnapshot>),
    /// Privileged listeners only; never sent to a cookie without system privilege.
    ClientsChanged(Vec<ClientInfo>),
    OffloadStatusChanged(OffloadStatus),
}
