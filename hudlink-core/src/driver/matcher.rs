//! Descriptor matching policy.
//!
//! HUD vendors rarely publish their USB identifiers, so drivers fall
//! back to heuristics. The policy makes that tunable from config: an
//! operator can pin exact ids, deny misbehaving ones, or drop the
//! heuristics entirely.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::descriptor::{PeripheralDescriptor, UsbId, class};

/// Vendor ids of common USB-serial converter chips (FTDI, Silicon Labs,
/// Prolific, WCH).
pub const SERIAL_CONVERTER_VENDORS: [u16; 4] = [0x0403, 0x10C4, 0x067B, 0x1A86];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Only the driver's known id or the allow-list.
    Exact,
    /// Also USB-serial converters and CDC / vendor-specific classes.
    #[default]
    Heuristic,
    /// Accept anything not denied.
    Permissive,
}

/// Why a descriptor was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    Denied,
    ExactId,
    AllowListed,
    SerialConverter,
    TransportClass,
    Permissive,
    NoMatch,
}

impl MatchVerdict {
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Denied | Self::NoMatch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    pub strictness: Strictness,
    /// Always accepted, at any strictness.
    pub allow_list: Vec<UsbId>,
    /// Never accepted, at any strictness.
    pub deny_list: Vec<UsbId>,
}

impl MatchPolicy {
    pub fn with_strictness(strictness: Strictness) -> Self {
        Self {
            strictness,
            ..Default::default()
        }
    }

    /// Evaluate `descriptor` for a driver whose exact id is `known`.
    pub fn evaluate(&self, known: Option<UsbId>, descriptor: &PeripheralDescriptor) -> MatchVerdict {
        let id = descriptor.usb_id();
        if self.deny_list.contains(&id) {
            return MatchVerdict::Denied;
        }
        if known == Some(id) {
            return MatchVerdict::ExactId;
        }
        if self.allow_list.contains(&id) {
            return MatchVerdict::AllowListed;
        }

        let verdict = match self.strictness {
            Strictness::Exact => MatchVerdict::NoMatch,
            Strictness::Heuristic | Strictness::Permissive => {
                if SERIAL_CONVERTER_VENDORS.contains(&descriptor.vendor_id) {
                    MatchVerdict::SerialConverter
                } else if [class::CDC, class::CDC_DATA, class::VENDOR_SPECIFIC]
                    .iter()
                    .any(|&c| descriptor.has_class(c))
                {
                    MatchVerdict::TransportClass
                } else if self.strictness == Strictness::Permissive {
                    MatchVerdict::Permissive
                } else {
                    MatchVerdict::NoMatch
                }
            }
        };

        // Enough detail to add the device to `allow_list` by hand.
        debug!(
            "heuristic match {:?} for {} (add \"{id}\" to allow_list to pin it)",
            verdict,
            descriptor.summary()
        );
        verdict
    }
}
