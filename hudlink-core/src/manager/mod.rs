//! Connection manager.
//!
//! A single actor task owns the HUD connection. Callers talk to it
//! through a cloneable [`ConnectionHandle`]; platform notifications
//! (permission answers, attach, detach) arrive on a separate channel
//! and are serialized onto the same task. Anything that blocks on the
//! transport runs on tokio's blocking pool and reports back through an
//! internal completion channel, so hotplug delivery is never stalled
//! by a slow device.
//!
//! ```text
//!   ConnectionHandle ──Command──►┐
//!   UsbHost ──PlatformEvent─────►├──► ConnectionManager ──spawn_blocking──► HudDriver
//!   blocking workers ─Completion►┘            │
//!                                             └──broadcast──► ConnectionEvent observers
//! ```
//!
//! Every accepted connection attempt ends in exactly one
//! [`ConnectionEvent::Connected`] or [`ConnectionEvent::ConnectionFailed`].
//! A connection that reached `Connected` ends in exactly one
//! [`ConnectionEvent::Disconnected`].

mod actor;

pub use actor::ConnectionManager;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::cot::PositionFix;
use crate::descriptor::{DeviceId, PeripheralDescriptor};
use crate::driver::TransferStatus;
use crate::error::ConnectionError;
use crate::state::ConnectionPhase;

/// Callsign used by [`ConnectionHandle::send_test_position`] when the
/// caller passes an empty one.
pub const TEST_CALLSIGN: &str = "TEST";

// ── Events ───────────────────────────────────────────────────────

/// Notifications fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        device: DeviceId,
        driver: String,
        /// The driver's status line at connect time.
        status: String,
    },
    Disconnected {
        device: DeviceId,
    },
    ConnectionFailed {
        device: DeviceId,
        reason: ConnectionError,
    },
    /// The supported device list changed. Never triggers a connection.
    DevicesChanged(Vec<PeripheralDescriptor>),
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub phase: ConnectionPhase,
    /// Status line of the active driver.
    pub status: Option<String>,
    /// Most recent failure, kept for display.
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    pub fn status_line(&self) -> String {
        match (&self.status, &self.last_error) {
            (Some(status), _) if self.phase.is_connected() => status.clone(),
            (_, Some(error)) => format!("Not connected ({error})"),
            _ => "Not connected".to_string(),
        }
    }
}

// ── Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Pending caller commands before `ConnectionHandle` calls wait.
    pub command_capacity: usize,
    /// Observer events buffered per subscriber before it lags.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            command_capacity: 32,
            event_capacity: 64,
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
pub(crate) enum Payload {
    Position(PositionFix),
    Cot(String),
}

#[derive(Debug)]
pub(crate) enum Command {
    ListAvailable(Reply<Vec<PeripheralDescriptor>>),
    Connect {
        device: DeviceId,
        reply: Reply<Result<(), ConnectionError>>,
    },
    Disconnect(Reply<()>),
    Transmit {
        payload: Payload,
        reply: Reply<Result<TransferStatus, ConnectionError>>,
    },
    IsReady(Reply<bool>),
    Snapshot(Reply<ConnectionSnapshot>),
}

// ── ConnectionHandle ─────────────────────────────────────────────

/// Cloneable front end of the [`ConnectionManager`] actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await?;
        Ok(rx.await?)
    }

    /// Attached peripherals some registered driver accepts, in
    /// enumeration order.
    pub async fn list_available(&self) -> Result<Vec<PeripheralDescriptor>, ConnectionError> {
        self.call(Command::ListAvailable).await
    }

    /// Start a connection attempt.
    ///
    /// `Ok` means the attempt was accepted; its outcome arrives as a
    /// `Connected` or `ConnectionFailed` event. Requests that cannot
    /// start an attempt are rejected here and produce no event.
    pub async fn request_connection(&self, device: &DeviceId) -> Result<(), ConnectionError> {
        let device = device.clone();
        self.call(|reply| Command::Connect { device, reply }).await?
    }

    /// Tear down the connection or abandon the pending attempt, and
    /// wait until the device is released. A no-op when idle.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.call(Command::Disconnect).await
    }

    /// Encode `fix` and send it to the HUD.
    pub async fn send_position(&self, fix: PositionFix) -> Result<TransferStatus, ConnectionError> {
        let payload = Payload::Position(fix);
        self.call(|reply| Command::Transmit { payload, reply }).await?
    }

    /// Send a pre-encoded CoT message.
    pub async fn send_cot(&self, xml: impl Into<String>) -> Result<TransferStatus, ConnectionError> {
        let payload = Payload::Cot(xml.into());
        self.call(|reply| Command::Transmit { payload, reply }).await?
    }

    /// Send the fixed test fix, for an operator's "test connection".
    pub async fn send_test_position(
        &self,
        callsign: &str,
    ) -> Result<TransferStatus, ConnectionError> {
        let callsign = if callsign.is_empty() { TEST_CALLSIGN } else { callsign };
        self.send_position(PositionFix::test_pattern(callsign)).await
    }

    /// True when a driver is bound and reports connected. False once
    /// the manager has shut down.
    pub async fn is_ready(&self) -> bool {
        self.call(Command::IsReady).await.unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, ConnectionError> {
        self.call(Command::Snapshot).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// True once the manager task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}
