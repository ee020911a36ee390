//! Domain-specific error types for the HUD link.
//!
//! Each layer has its own enum: the platform boundary (`HostError`),
//! device drivers (`DriverError`), the connection manager
//! (`ConnectionError`), the streaming scheduler (`StreamError`) and the
//! CoT parser (`CotError`). All of them are `Clone` so they can be
//! fanned out to observers over broadcast channels.
//!
//! Nothing here is fatal: every failure degrades to "not connected" or
//! "not streaming" with a human-readable reason.

use std::time::Duration;

use thiserror::Error;

use crate::descriptor::DeviceId;

// ── HostError ────────────────────────────────────────────────────

/// Failures reported by the platform USB host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The device is no longer present in the platform registry.
    #[error("device {0} not found")]
    NotFound(DeviceId),

    /// The platform refused access to the device.
    #[error("access denied")]
    AccessDenied,

    /// The device was unplugged while a handle was open.
    #[error("device disconnected")]
    Disconnected,

    /// A blocking transfer did not complete before its deadline.
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    /// Any other platform I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

// ── DriverError ──────────────────────────────────────────────────

/// Failures of a single driver instance.
///
/// Every variant leaves the driver disconnected, except
/// `TransferFailed`, which is reported per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("no USB permission for device")]
    NoPermission,

    #[error("failed to open USB device connection: {0}")]
    OpenFailed(HostError),

    #[error("failed to claim USB interface {interface}: {source}")]
    ClaimFailed { interface: u8, source: HostError },

    #[error("no OUT endpoint found on USB device")]
    NoOutboundEndpoint,

    #[error("USB device has no interfaces")]
    NoInterfaces,

    #[error("failed to send data to device: {0}")]
    TransferFailed(HostError),

    #[error("not connected to device")]
    NotConnected,

    /// Latitude or longitude was not a finite number.
    #[error("invalid position: {0}")]
    InvalidPosition(String),
}

// ── ConnectionError ──────────────────────────────────────────────

/// Failures surfaced by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The operator declined the platform permission prompt.
    #[error("USB permission denied for device {0}")]
    PermissionDenied(DeviceId),

    /// No registered driver accepts the descriptor.
    #[error("no compatible HUD driver found for device {0}")]
    NoCompatibleDriver(DeviceId),

    /// The requested device is not currently attached.
    #[error("invalid selection: device {0} is not attached")]
    InvalidSelection(DeviceId),

    /// Another connection attempt or connection is active.
    #[error("connection busy: currently {0}")]
    Busy(String),

    /// The previous connection is still being torn down.
    #[error("previous connection is still being torn down")]
    TeardownInFlight,

    /// The target device was unplugged before the attempt completed.
    #[error("device {0} detached")]
    DeviceDetached(DeviceId),

    /// The attempt was abandoned by an explicit disconnect.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// An operation needed an active connection and there was none.
    #[error("not connected to HUD device")]
    NotConnected,

    /// A driver accepted the device but failed to connect or transmit.
    #[error("{driver} driver: {source}")]
    Driver {
        driver: String,
        #[source]
        source: DriverError,
    },

    /// A state machine transition was attempted from the wrong phase.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// A blocking worker died before reporting back.
    #[error("worker failed: {0}")]
    Worker(String),

    /// The manager task is gone.
    #[error("connection manager channel closed")]
    ChannelClosed,
}

// ── StreamError ──────────────────────────────────────────────────

/// Failures surfaced by the streaming scheduler controls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("not connected to HUD device")]
    NotConnected,

    #[error("streaming scheduler channel closed")]
    ChannelClosed,
}

// ── CotError ─────────────────────────────────────────────────────

/// Failures parsing a CoT event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CotError {
    #[error("empty CoT message")]
    Empty,

    #[error("malformed CoT XML: {0}")]
    Malformed(String),

    #[error("not a CoT event: root element is {0}")]
    NotAnEvent(String),

    #[error("invalid timestamp in {attribute}: {value}")]
    InvalidTimestamp {
        attribute: &'static str,
        value: String,
    },
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ConnectionError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ConnectionError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ConnectionError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ConnectionError::ChannelClosed
    }
}

impl From<ConnectionError> for StreamError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::ChannelClosed => StreamError::ChannelClosed,
            _ => StreamError::NotConnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = DriverError::ClaimFailed {
            interface: 1,
            source: HostError::AccessDenied,
        };
        assert!(e.to_string().contains("interface 1"));

        let e = ConnectionError::PermissionDenied(DeviceId::new("/dev/bus/usb/001/004"));
        assert!(e.to_string().contains("permission denied"));
        assert!(e.to_string().contains("001/004"));
    }

    #[test]
    fn driver_error_is_wrapped_with_driver_name() {
        let e = ConnectionError::Driver {
            driver: "ECOTI".into(),
            source: DriverError::NoOutboundEndpoint,
        };
        assert_eq!(e.to_string(), "ECOTI driver: no OUT endpoint found on USB device");
    }

    #[test]
    fn stream_error_from_connection_error() {
        let e: StreamError = ConnectionError::NotConnected.into();
        assert_eq!(e, StreamError::NotConnected);
        let e: StreamError = ConnectionError::ChannelClosed.into();
        assert_eq!(e, StreamError::ChannelClosed);
    }

    #[tokio::test]
    async fn from_closed_oneshot() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        drop(tx);
        let e: ConnectionError = rx.await.unwrap_err().into();
        assert_eq!(e, ConnectionError::ChannelClosed);
    }
}
