//! USB gadget function state (§4.5, §12 Open Question Decision (c)). The
//! kernel configfs gadget exposes RNDIS and NCM as independent functions;
//! this models them as an unordered bitset rather than enforcing a
//! precedence between them, matching the decision recorded for this spec.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbFunctionState {
    pub rndis: bool,
    pub ncm: bool,
}

impl UsbFunctionState {
    pub fn none() -> Self {
        UsbFunctionState::default()
    }

    pub fn is_any_enabled(&self) -> bool {
        self.rndis || self.ncm
    }

    /// Applies `force_usb_ncm` (§6.3): when set, USB tethering always comes
    /// up as NCM regardless of what the caller asked for.
    pub fn requested(prefer_ncm: bool, force_usb_ncm: bool) -> Self {
        if force_usb_ncm || prefer_ncm {
            UsbFunctionState { rndis: false, ncm: true }
        } else {
            UsbFunctionState { rndis: true, ncm: false }
        }
    }

    pub fn disabled() -> Self {
        UsbFunctionState::default()
    }
}
