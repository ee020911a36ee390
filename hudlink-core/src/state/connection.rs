//! Connection state machine for the HUD link.
//!
//! Provides a `ConnectionPhase` enum that models the full lifecycle
//! of the single HUD connection, with validated transitions that
//! return `Result` instead of panicking.

use std::fmt;
use std::time::Instant;

use crate::descriptor::DeviceId;
use crate::error::ConnectionError;

// ── ConnectionPhase ──────────────────────────────────────────────

/// The current phase of the HUD connection.
///
/// ```text
///  Idle ──► PermissionPending ──► Connecting ──► Connected
///   ▲  │            │                 │    │        │
///   │  └────────────┼───────────────► │    └──────► ▼
///   │               ▼                 ▼        Disconnecting
///   └───────────────┴─────────────────┴─────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No connection and no attempt in progress.
    #[default]
    Idle,

    /// Waiting for the platform permission prompt to be answered.
    PermissionPending { device: DeviceId },

    /// Opening the device on a worker thread.
    Connecting { device: DeviceId },

    /// A driver holds the device and transmissions are allowed.
    Connected {
        device: DeviceId,
        driver: String,
        /// When the connection entered the `Connected` state.
        since: Instant,
    },

    /// The driver is releasing the device on a worker thread.
    Disconnecting { device: DeviceId },
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::PermissionPending { device } => write!(f, "PermissionPending({device})"),
            Self::Connecting { device } => write!(f, "Connecting({device})"),
            Self::Connected { device, driver, .. } => write!(f, "Connected({device} via {driver})"),
            Self::Disconnecting { device } => write!(f, "Disconnecting({device})"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The device this phase refers to, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Idle => None,
            Self::PermissionPending { device }
            | Self::Connecting { device }
            | Self::Connected { device, .. }
            | Self::Disconnecting { device } => Some(device),
        }
    }

    /// How long the connection has been in the `Connected` state.
    pub fn connected_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `PermissionPending`.
    ///
    /// Valid from: `Idle`.
    pub fn await_permission(&mut self, device: DeviceId) -> Result<(), ConnectionError> {
        match self {
            Self::Idle => {
                *self = Self::PermissionPending { device };
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot request permission: not Idle",
            )),
        }
    }

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Idle` (access already granted) or
    /// `PermissionPending` for the same device.
    pub fn begin_connect(&mut self, device: DeviceId) -> Result<(), ConnectionError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting { device };
                Ok(())
            }
            Self::PermissionPending { device: pending } if *pending == device => {
                *self = Self::Connecting { device };
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot connect: not Idle or awaiting permission for this device",
            )),
        }
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self, driver: impl Into<String>) -> Result<(), ConnectionError> {
        match self {
            Self::Connecting { device } => {
                *self = Self::Connected {
                    device: device.clone(),
                    driver: driver.into(),
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot complete connect: not Connecting",
            )),
        }
    }

    /// Abandon an attempt and return to `Idle`.
    ///
    /// Valid from: `PermissionPending`, `Connecting`.
    pub fn abandon_attempt(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::PermissionPending { .. } | Self::Connecting { .. } => {
                *self = Self::Idle;
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot abandon: no attempt in progress",
            )),
        }
    }

    /// Abandon an attempt whose worker still holds the device.
    ///
    /// Valid from: `Connecting`.
    pub fn cancel_connect(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::Connecting { device } => {
                *self = Self::Disconnecting {
                    device: device.clone(),
                };
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot cancel connect: not Connecting",
            )),
        }
    }

    /// Transition to `Disconnecting`.
    ///
    /// Valid from: `Connected`.
    pub fn begin_teardown(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::Connected { device, .. } => {
                *self = Self::Disconnecting {
                    device: device.clone(),
                };
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot tear down: not Connected",
            )),
        }
    }

    /// Transition to `Idle`.
    ///
    /// Valid from: `Disconnecting`.
    pub fn finish_teardown(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::Disconnecting { .. } => {
                *self = Self::Idle;
                Ok(())
            }
            _ => Err(ConnectionError::InvalidTransition(
                "cannot finish teardown: not Disconnecting",
            )),
        }
    }

    /// Force-reset to `Idle` regardless of current state.
    pub fn force_idle(&mut self) {
        *self = Self::Idle;
    }
}

// ── Tests ────────────────────────────────────────────────────────
