//! Platform USB host boundary.
//!
//! The host owns the device registry, the permission prompt and
//! hotplug notifications. Notifications are pushed asynchronously into
//! a [`PlatformSender`] registered by the connection manager.

mod sim;
#[cfg(feature = "usb")]
mod usb;

pub use sim::{SimBehavior, SimulatedHost};
#[cfg(feature = "usb")]
pub use usb::NusbHost;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::descriptor::{DeviceId, PeripheralDescriptor};
use crate::error::HostError;

// ── PlatformEvent ────────────────────────────────────────────────

/// Out-of-band notifications delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Response to a [`UsbHost::request_permission`] prompt.
    Permission { device: DeviceId, granted: bool },
    Attached(PeripheralDescriptor),
    Detached(DeviceId),
}

pub type PlatformSender = mpsc::UnboundedSender<PlatformEvent>;
pub type PlatformReceiver = mpsc::UnboundedReceiver<PlatformEvent>;

// ── Traits ───────────────────────────────────────────────────────

/// The platform USB registry.
pub trait UsbHost: Send + Sync {
    /// All currently attached peripherals, in enumeration order.
    fn enumerate(&self) -> Vec<PeripheralDescriptor>;

    fn has_permission(&self, device: &DeviceId) -> bool;

    /// Prompt for access. The answer arrives later as
    /// [`PlatformEvent::Permission`].
    fn request_permission(&self, device: &PeripheralDescriptor);

    /// Open a device. Blocking.
    fn open(&self, device: &PeripheralDescriptor) -> Result<Box<dyn DeviceHandle>, HostError>;

    /// Start delivering notifications to `events`, replacing any
    /// previous listener.
    fn register_listener(&self, events: PlatformSender);

    fn unregister_listener(&self);
}

/// An open device. Dropping the handle must release it.
pub trait DeviceHandle: Send {
    /// Claim an interface, detaching a kernel driver when `force` is set.
    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<(), HostError>;

    fn release_interface(&mut self, interface: u8);

    /// Blocking bulk OUT transfer. Returns the number of bytes the
    /// device accepted, which may be less than `data.len()`.
    fn bulk_transfer(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, HostError>;

    fn close(&mut self);
}

// ── ListenerGuard ────────────────────────────────────────────────

/// Scoped registration of a platform listener.
///
/// Registers on construction and unregisters on drop, so the listener
/// never outlives the component that owns the guard.
pub struct ListenerGuard {
    host: Arc<dyn UsbHost>,
}

impl ListenerGuard {
    pub fn register(host: Arc<dyn UsbHost>, events: PlatformSender) -> Self {
        host.register_listener(events);
        Self { host }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.host.unregister_listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PeripheralDescriptor;

    #[test]
    fn listener_guard_unregisters_on_drop() {
        let host = Arc::new(SimulatedHost::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let guard = ListenerGuard::register(host.clone(), tx);
        let dev = PeripheralDescriptor::new(DeviceId::new("a"), 1, 2);
        host.attach(dev.clone());
        assert_eq!(rx.try_recv().unwrap(), PlatformEvent::Attached(dev));

        drop(guard);
        host.detach(&DeviceId::new("a"));
        assert!(rx.try_recv().is_err());
    }
}
