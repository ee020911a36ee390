//! HUD device drivers.
//!
//! A driver pairs stateless identification logic with a stateful
//! connection to one device. Drivers are blocking; the connection
//! manager runs every call that touches the transport on a worker
//! thread.
//!
//! ```text
//!   DriverRegistry ──compatible──► DriverPrototype ──instantiate──► Box<dyn HudDriver>
//!                                                                          │
//!                          TelemetryMessage ◄── send_position ─────────────┤
//!                                 │                                        │
//!                                 └──────────► transmit ──► DeviceHandle::bulk_transfer
//! ```

mod ecoti;
mod matcher;
mod registry;

pub use ecoti::{EcotiDriver, EcotiPrototype};
pub use matcher::{MatchPolicy, MatchVerdict, Strictness};
pub use registry::DriverRegistry;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cot::PositionFix;
use crate::descriptor::PeripheralDescriptor;
use crate::error::DriverError;

// ── TransferStatus ───────────────────────────────────────────────

/// Outcome of a transfer the device did not reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Complete { sent: usize },
    /// The device accepted fewer bytes than offered. Telemetry favours
    /// liveness, so this is a warning rather than a failure.
    Partial { sent: usize, expected: usize },
}

impl TransferStatus {
    pub fn from_counts(sent: usize, expected: usize) -> Self {
        if sent < expected {
            Self::Partial { sent, expected }
        } else {
            Self::Complete { sent }
        }
    }

    pub fn sent(&self) -> usize {
        match *self {
            Self::Complete { sent } | Self::Partial { sent, .. } => sent,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete { sent } => write!(f, "sent {sent} bytes"),
            Self::Partial { sent, expected } => write!(f, "partial send: {sent}/{expected} bytes"),
        }
    }
}

// ── DriverConfig ─────────────────────────────────────────────────

/// Settings shared by the built-in drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// How eagerly unknown devices are accepted.
    pub policy: MatchPolicy,
    /// Deadline for each blocking bulk transfer.
    pub transfer_timeout_ms: u64,
    /// Detach kernel drivers when claiming the interface.
    pub force_claim: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::default(),
            transfer_timeout_ms: 1000,
            force_claim: true,
        }
    }
}

impl DriverConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms.max(1))
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// One HUD peripheral family.
pub trait HudDriver: Send {
    fn name(&self) -> &str;

    fn manufacturer(&self) -> &str;

    /// Whether this driver can handle `descriptor`.
    fn identify(&self, descriptor: &PeripheralDescriptor) -> bool;

    /// Open the device, claim its transport interface and resolve the
    /// outbound endpoint. On failure the driver is left disconnected
    /// and [`last_error`](Self::last_error) describes why.
    fn connect(&mut self, descriptor: &PeripheralDescriptor) -> Result<(), DriverError>;

    /// Release the transport. Idempotent.
    fn disconnect(&mut self);

    /// True only while both the transport handle and the outbound
    /// endpoint are held.
    fn is_connected(&self) -> bool;

    /// Blocking transfer of raw bytes.
    fn transmit(&mut self, payload: &[u8]) -> Result<TransferStatus, DriverError>;

    /// Send a pre-encoded CoT message.
    fn send_cot(&mut self, xml: &str) -> Result<TransferStatus, DriverError> {
        self.transmit(xml.as_bytes())
    }

    /// Encode `fix` as a telemetry message and transmit it.
    fn send_position(&mut self, fix: &PositionFix) -> Result<TransferStatus, DriverError>;

    fn last_error(&self) -> Option<&str>;

    /// Human-readable connection status.
    fn status(&self) -> String;
}

/// Registry entry: identification plus a factory for fresh drivers.
pub trait DriverPrototype: Send + Sync {
    fn name(&self) -> &str;

    fn identify(&self, descriptor: &PeripheralDescriptor) -> bool;

    fn instantiate(&self) -> Box<dyn HudDriver>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_status_from_counts() {
        assert_eq!(
            TransferStatus::from_counts(10, 10),
            TransferStatus::Complete { sent: 10 }
        );
        let partial = TransferStatus::from_counts(4, 10);
        assert!(partial.is_partial());
        assert_eq!(partial.sent(), 4);
        assert_eq!(partial.to_string(), "partial send: 4/10 bytes");
    }

    #[test]
    fn config_defaults() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.transfer_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.policy.strictness, Strictness::Heuristic);
    }
}
