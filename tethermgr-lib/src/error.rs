//! Result-code taxonomy exposed across the IPC boundary (§7). Internal
//! `thiserror` error types never cross a process boundary directly; each
//! module maps its own errors down to one of these stable, serializable
//! codes plus a short human-readable message.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoError,
    UnknownIface,
    UnavailIface,
    InternalError,
    Unsupported,
    ServiceUnavail,
    NoChangeTetheringPermission,
    NoAccessTetheringPermission,
    UnknownType,
    HardwareOffloadStarted,
    HardwareOffloadStopped,
    HardwareOffloadFailed,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::NoError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorCode::NoError => "no error",
            ErrorCode::UnknownIface => "unknown interface",
            ErrorCode::UnavailIface => "interface unavailable",
            ErrorCode::InternalError => "internal error",
            ErrorCode::Unsupported => "tethering type unsupported",
            ErrorCode::ServiceUnavail => "service unavailable",
            ErrorCode::NoChangeTetheringPermission => "caller lacks permission to change tethering state",
            ErrorCode::NoAccessTetheringPermission => "caller lacks permission to access tethering state",
            ErrorCode::UnknownType => "unknown downstream type",
            ErrorCode::HardwareOffloadStarted => "hardware offload started",
            ErrorCode::HardwareOffloadStopped => "hardware offload stopped",
            ErrorCode::HardwareOffloadFailed => "hardware offload failed",
        };
        write!(f, "{s}")
    }
}

/// A response-carrying error: the stable code plus context meaningful to a
/// human reading `tethermgr-ctl` output or a log line, never the internal
/// `thiserror` `Display` text of whatever module produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TetherError {
    pub code: ErrorCode,
    pub message: String,
}

impl TetherError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        TetherError {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TetherError {}
