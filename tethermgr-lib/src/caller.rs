//! Caller identity and permission evaluation for the IPC surface (§6.1).

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Capability {
    TetherPrivileged,
    WriteSettings,
    AccessNetworkState,
    NetworkSettings,
    NetworkStack,
}

/// Identity attached to every IPC request, analogous to the caller UID /
/// package name / attribution tag a real binder call carries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallerContext {
    pub uid: u32,
    pub package_name: String,
    pub attribution_tag: Option<String>,
    pub capabilities: Vec<Capability>,
}

impl CallerContext {
    pub fn new(uid: u32, package_name: impl Into<String>) -> Self {
        CallerContext {
            uid,
            package_name: package_name.into(),
            attribution_tag: None,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.push(cap);
        self
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    fn is_privileged(&self) -> bool {
        self.has(Capability::TetherPrivileged)
    }

    fn is_system(&self) -> bool {
        self.has(Capability::NetworkSettings) || self.has(Capability::NetworkStack)
    }

    /// Permission check for change operations (`tether`, `startTethering`,
    /// `setUsbTethering`, ...). `provisioning_required` models whether
    /// entitlement/provisioning must still pass before `WRITE_SETTINGS`
    /// alone is sufficient (§6.1).
    pub fn check_change_permission(&self, provisioning_required: bool) -> Result<(), ErrorCode> {
        if self.is_privileged() {
            return Ok(());
        }
        if self.has(Capability::WriteSettings) && !provisioning_required {
            return Ok(());
        }
        Err(ErrorCode::NoChangeTetheringPermission)
    }

    /// Operations naming an explicit interface or bypassing entitlement
    /// require system-level permission regardless of `TETHER_PRIVILEGED`.
    pub fn check_system_permission(&self) -> Result<(), ErrorCode> {
        if self.is_system() {
            Ok(())
        } else {
            Err(ErrorCode::NoChangeTetheringPermission)
        }
    }

    pub fn check_callback_permission(&self) -> Result<(), ErrorCode> {
        if self.is_privileged() || self.has(Capability::AccessNetworkState) {
            Ok(())
        } else {
            Err(ErrorCode::NoAccessTetheringPermission)
        }
    }

    /// UID↔package name mismatch is checked by the caller (the socket server
    /// has no OS-level identity to cross-check against in this codebase, so
    /// this takes the claimed owner UID and compares).
    pub fn check_owns_uid(&self, owner_uid: u32) -> Result<(), ErrorCode> {
        if self.uid == owner_uid {
            Ok(())
        } else {
            Err(ErrorCode::NoChangeTetheringPermission)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_caller_always_passes_change_permission() {
        let caller = CallerContext::new(0, "system").with_capability(Capability::TetherPrivileged);
        assert!(caller.check_change_permission(true).is_ok());
    }

    #[test]
    fn write_settings_fails_when_provisioning_required() {
        let caller = CallerContext::new(10_100, "com.example.app").with_capability(Capability::WriteSettings);
        assert_eq!(caller.check_change_permission(true), Err(ErrorCode::NoChangeTetheringPermission));
        assert!(caller.check_change_permission(false).is_ok());
    }

    #[test]
    fn unprivileged_caller_fails_change_permission() {
        let caller = CallerContext::new(10_100, "com.example.app");
        assert_eq!(caller.check_change_permission(false), Err(ErrorCode::NoChangeTetheringPermission));
    }

    #[test]
    fn callback_registration_requires_privileged_or_access_network_state() {
        let plain = CallerContext::new(10_100, "com.example.app");
        assert!(plain.check_callback_permission().is_err());
        let access = plain.with_capability(Capability::AccessNetworkState);
        assert!(access.check_callback_permission().is_ok());
    }
}
