//! In-process USB host for tests and the console harness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::{DeviceHandle, PlatformEvent, PlatformSender, UsbHost};
use crate::descriptor::{DeviceId, PeripheralDescriptor};
use crate::error::HostError;

/// Injectable failure modes for one simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    pub open_fails: bool,
    pub claim_fails: bool,
    pub transfer_fails: bool,
    /// Accept at most this many bytes per transfer.
    pub short_write: Option<usize>,
    /// Time each transfer takes; longer than the timeout means timeout.
    pub transfer_delay: Duration,
    /// Time claiming an interface takes. The handle stays open meanwhile.
    pub claim_delay: Duration,
}

struct SimDevice {
    descriptor: PeripheralDescriptor,
    permitted: bool,
    behavior: SimBehavior,
}

#[derive(Default)]
struct Inner {
    devices: Vec<SimDevice>,
    listener: Option<PlatformSender>,
    auto_permission: Option<bool>,
    permission_requests: Vec<DeviceId>,
    writes: HashMap<DeviceId, Vec<Vec<u8>>>,
    open_handles: HashMap<DeviceId, usize>,
}

impl Inner {
    fn device(&self, id: &DeviceId) -> Option<&SimDevice> {
        self.devices.iter().find(|d| &d.descriptor.id == id)
    }

    fn device_mut(&mut self, id: &DeviceId) -> Option<&mut SimDevice> {
        self.devices.iter_mut().find(|d| &d.descriptor.id == id)
    }

    fn emit(&self, event: PlatformEvent) {
        if let Some(listener) = &self.listener {
            let _ = listener.send(event);
        }
    }
}

/// A scriptable stand-in for the platform USB registry.
#[derive(Clone, Default)]
pub struct SimulatedHost {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    // ── Scripting ────────────────────────────────────────────────

    /// Plug in a device without access permission.
    pub fn attach(&self, descriptor: PeripheralDescriptor) {
        self.attach_with(descriptor, false);
    }

    /// Plug in a device the platform already trusts.
    pub fn attach_permitted(&self, descriptor: PeripheralDescriptor) {
        self.attach_with(descriptor, true);
    }

    fn attach_with(&self, descriptor: PeripheralDescriptor, permitted: bool) {
        let mut inner = self.lock();
        inner.devices.retain(|d| d.descriptor.id != descriptor.id);
        inner.devices.push(SimDevice {
            descriptor: descriptor.clone(),
            permitted,
            behavior: SimBehavior::default(),
        });
        debug!("sim: attached {}", descriptor.summary());
        inner.emit(PlatformEvent::Attached(descriptor));
    }

    /// Unplug a device. Open handles start failing with `Disconnected`.
    pub fn detach(&self, id: &DeviceId) {
        let mut inner = self.lock();
        let before = inner.devices.len();
        inner.devices.retain(|d| &d.descriptor.id != id);
        if inner.devices.len() != before {
            debug!("sim: detached {id}");
            inner.emit(PlatformEvent::Detached(id.clone()));
        }
    }

    pub fn set_permission(&self, id: &DeviceId, permitted: bool) {
        if let Some(device) = self.lock().device_mut(id) {
            device.permitted = permitted;
        }
    }

    /// Answer a permission prompt with a grant.
    pub fn grant(&self, id: &DeviceId) {
        let mut inner = self.lock();
        if let Some(device) = inner.device_mut(id) {
            device.permitted = true;
        }
        inner.emit(PlatformEvent::Permission {
            device: id.clone(),
            granted: true,
        });
    }

    /// Answer a permission prompt with a denial.
    pub fn deny(&self, id: &DeviceId) {
        self.lock().emit(PlatformEvent::Permission {
            device: id.clone(),
            granted: false,
        });
    }

    /// Answer every future permission prompt immediately.
    pub fn set_auto_permission(&self, answer: Option<bool>) {
        self.lock().auto_permission = answer;
    }

    pub fn set_behavior(&self, id: &DeviceId, behavior: SimBehavior) {
        if let Some(device) = self.lock().device_mut(id) {
            device.behavior = behavior;
        }
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn permission_requests(&self) -> Vec<DeviceId> {
        self.lock().permission_requests.clone()
    }

    /// Every transfer accepted by `id`, in order.
    pub fn writes(&self, id: &DeviceId) -> Vec<Vec<u8>> {
        self.lock().writes.get(id).cloned().unwrap_or_default()
    }

    /// Accepted transfers decoded as UTF-8 text.
    pub fn written_messages(&self, id: &DeviceId) -> Vec<String> {
        self.writes(id)
            .into_iter()
            .map(|w| String::from_utf8_lossy(&w).into_owned())
            .collect()
    }

    pub fn open_handles(&self, id: &DeviceId) -> usize {
        self.lock().open_handles.get(id).copied().unwrap_or(0)
    }

    pub fn has_listener(&self) -> bool {
        self.lock().listener.is_some()
    }
}

impl UsbHost for SimulatedHost {
    fn enumerate(&self) -> Vec<PeripheralDescriptor> {
        self.lock()
            .devices
            .iter()
            .map(|d| d.descriptor.clone())
            .collect()
    }

    fn has_permission(&self, device: &DeviceId) -> bool {
        self.lock().device(device).is_some_and(|d| d.permitted)
    }

    fn request_permission(&self, device: &PeripheralDescriptor) {
        let mut inner = self.lock();
        inner.permission_requests.push(device.id.clone());
        if let Some(granted) = inner.auto_permission {
            if let Some(sim) = inner.device_mut(&device.id) {
                sim.permitted |= granted;
            }
            inner.emit(PlatformEvent::Permission {
                device: device.id.clone(),
                granted,
            });
        }
    }

    fn open(&self, device: &PeripheralDescriptor) -> Result<Box<dyn DeviceHandle>, HostError> {
        let mut inner = self.lock();
        let sim = inner
            .device(&device.id)
            .ok_or_else(|| HostError::NotFound(device.id.clone()))?;
        if !sim.permitted {
            return Err(HostError::AccessDenied);
        }
        if sim.behavior.open_fails {
            return Err(HostError::Io("open failed".into()));
        }
        *inner.open_handles.entry(device.id.clone()).or_default() += 1;
        Ok(Box::new(SimHandle {
            inner: Arc::clone(&self.inner),
            device: device.id.clone(),
            claimed: Vec::new(),
            open: true,
        }))
    }

    fn register_listener(&self, events: PlatformSender) {
        self.lock().listener = Some(events);
    }

    fn unregister_listener(&self) {
        self.lock().listener = None;
    }
}

// ── SimHandle ────────────────────────────────────────────────────

struct SimHandle {
    inner: Arc<Mutex<Inner>>,
    device: DeviceId,
    claimed: Vec<u8>,
    open: bool,
}

impl DeviceHandle for SimHandle {
    fn claim_interface(&mut self, interface: u8, _force: bool) -> Result<(), HostError> {
        if !self.open {
            return Err(HostError::Io("handle closed".into()));
        }
        let delay = lock(&self.inner)
            .device(&self.device)
            .map(|d| d.behavior.claim_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let inner = lock(&self.inner);
        let sim = inner.device(&self.device).ok_or(HostError::Disconnected)?;
        if sim.behavior.claim_fails {
            return Err(HostError::Io("interface busy".into()));
        }
        if !sim.descriptor.interfaces.iter().any(|i| i.number == interface) {
            return Err(HostError::Io(format!("no interface {interface}")));
        }
        drop(inner);
        self.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) {
        self.claimed.retain(|&i| i != interface);
    }

    fn bulk_transfer(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        if !self.open {
            return Err(HostError::Io("handle closed".into()));
        }
        let behavior = {
            let inner = lock(&self.inner);
            let sim = inner.device(&self.device).ok_or(HostError::Disconnected)?;
            let claimed = sim.descriptor.interfaces.iter().any(|i| {
                self.claimed.contains(&i.number)
                    && i.endpoints.iter().any(|ep| ep.address == endpoint && ep.is_out())
            });
            if !claimed {
                return Err(HostError::Io(format!("endpoint {endpoint:#04x} not claimed")));
            }
            sim.behavior.clone()
        };

        if !behavior.transfer_delay.is_zero() {
            std::thread::sleep(behavior.transfer_delay.min(timeout));
            if behavior.transfer_delay > timeout {
                return Err(HostError::Timeout(timeout));
            }
        }
        if behavior.transfer_fails {
            return Err(HostError::Io("transfer aborted".into()));
        }

        let accepted = behavior.short_write.map_or(data.len(), |max| max.min(data.len()));
        let mut inner = lock(&self.inner);
        if inner.device(&self.device).is_none() {
            return Err(HostError::Disconnected);
        }
        inner
            .writes
            .entry(self.device.clone())
            .or_default()
            .push(data[..accepted].to_vec());
        Ok(accepted)
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.claimed.clear();
        let mut inner = lock(&self.inner);
        if let Some(count) = inner.open_handles.get_mut(&self.device) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor, class};

    fn device() -> PeripheralDescriptor {
        PeripheralDescriptor::new(DeviceId::new("sim-1"), 0x0403, 0x6001).with_interface(
            InterfaceDescriptor::new(0, class::VENDOR_SPECIFIC, 0)
                .with_endpoint(EndpointDescriptor::bulk_out(0x02)),
        )
    }

    #[test]
    fn open_requires_permission() {
        let host = SimulatedHost::new();
        host.attach(device());
        assert_eq!(host.open(&device()).err(), Some(HostError::AccessDenied));
        host.set_permission(&device().id, true);
        assert!(host.open(&device()).is_ok());
    }

    #[test]
    fn transfer_records_and_short_writes() {
        let host = SimulatedHost::new();
        host.attach_permitted(device());
        let mut handle = host.open(&device()).unwrap();
        handle.claim_interface(0, true).unwrap();

        let n = handle.bulk_transfer(0x02, b"hello", Duration::from_secs(1)).unwrap();
        assert_eq!(n, 5);

        host.set_behavior(
            &device().id,
            SimBehavior {
                short_write: Some(2),
                ..Default::default()
            },
        );
        let n = handle.bulk_transfer(0x02, b"world", Duration::from_secs(1)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(host.writes(&device().id), vec![b"hello".to_vec(), b"wo".to_vec()]);
    }

    #[test]
    fn transfer_requires_claimed_out_endpoint() {
        let host = SimulatedHost::new();
        host.attach_permitted(device());
        let mut handle = host.open(&device()).unwrap();
        assert!(handle.bulk_transfer(0x02, b"x", Duration::from_secs(1)).is_err());
        handle.claim_interface(0, true).unwrap();
        assert!(handle.bulk_transfer(0x81, b"x", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn detach_breaks_open_handles() {
        let host = SimulatedHost::new();
        host.attach_permitted(device());
        let mut handle = host.open(&device()).unwrap();
        handle.claim_interface(0, true).unwrap();
        host.detach(&device().id);
        assert_eq!(
            handle.bulk_transfer(0x02, b"x", Duration::from_secs(1)),
            Err(HostError::Disconnected)
        );
    }

    #[test]
    fn dropping_handle_releases_it() {
        let host = SimulatedHost::new();
        host.attach_permitted(device());
        let handle = host.open(&device()).unwrap();
        assert_eq!(host.open_handles(&device().id), 1);
        drop(handle);
        assert_eq!(host.open_handles(&device().id), 0);
    }

    #[test]
    fn auto_permission_answers_immediately() {
        let host = SimulatedHost::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        host.register_listener(tx);
        host.attach(device());
        let _ = rx.try_recv();

        host.set_auto_permission(Some(true));
        host.request_permission(&device());
        assert_eq!(
            rx.try_recv().unwrap(),
            PlatformEvent::Permission {
                device: device().id,
                granted: true
            }
        );
        assert!(host.has_permission(&device().id));
        assert_eq!(host.permission_requests(), vec![device().id]);
    }
}
