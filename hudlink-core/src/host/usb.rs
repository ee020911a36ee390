//! `nusb`-backed host for desktop platforms.
//!
//! Desktop systems have no runtime permission prompt: access is decided
//! by the OS (udev rules, driver binding). A device counts as permitted
//! when it can be opened, and `request_permission` answers immediately.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{self, EndpointType, TransferError};
use tracing::{debug, info, warn};

use super::{DeviceHandle, PlatformEvent, PlatformSender, UsbHost};
use crate::descriptor::{
    DeviceId, Direction, EndpointDescriptor, InterfaceDescriptor, PeripheralDescriptor,
    TransferKind,
};
use crate::error::HostError;
use crate::task::ScopedTask;

type IdMap = Arc<Mutex<HashMap<nusb::DeviceId, DeviceId>>>;

/// The system USB registry, through `nusb`.
#[derive(Default)]
pub struct NusbHost {
    ids: IdMap,
    /// Hotplug task and the listener it feeds.
    watcher: Mutex<Option<(ScopedTask, PlatformSender)>>,
}

impl NusbHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, id: &DeviceId) -> Option<nusb::DeviceInfo> {
        let mut devices = match nusb::list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("USB enumeration failed: {}", e);
                return None;
            }
        };
        devices.find(|info| &device_id(info.bus_number(), info.device_address()) == id)
    }
}

impl UsbHost for NusbHost {
    fn enumerate(&self) -> Vec<PeripheralDescriptor> {
        let devices = match nusb::list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("USB enumeration failed: {}", e);
                return Vec::new();
            }
        };
        let mut ids = lock(&self.ids);
        devices
            .map(|info| {
                let descriptor = describe(&info);
                ids.insert(info.id(), descriptor.id.clone());
                descriptor
            })
            .collect()
    }

    fn has_permission(&self, device: &DeviceId) -> bool {
        self.find(device).is_some_and(|info| info.open().is_ok())
    }

    fn request_permission(&self, device: &PeripheralDescriptor) {
        let granted = self.has_permission(&device.id);
        debug!("USB access to {} is {}", device.id, if granted { "open" } else { "denied" });
        if let Some((_, events)) = lock(&self.watcher).as_ref() {
            let _ = events.send(PlatformEvent::Permission {
                device: device.id.clone(),
                granted,
            });
        }
    }

    fn open(&self, device: &PeripheralDescriptor) -> Result<Box<dyn DeviceHandle>, HostError> {
        let info = self
            .find(&device.id)
            .ok_or_else(|| HostError::NotFound(device.id.clone()))?;
        let handle = info.open().map_err(|e| io_error(&device.id, e))?;
        Ok(Box::new(NusbHandle {
            id: device.id.clone(),
            device: Some(handle),
            layout: device.interfaces.clone(),
            claimed: HashMap::new(),
        }))
    }

    fn register_listener(&self, events: PlatformSender) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No async runtime, USB hotplug disabled");
            return;
        }
        let watch = match nusb::watch_devices() {
            Ok(watch) => watch,
            Err(e) => {
                warn!("USB hotplug unavailable: {}", e);
                return;
            }
        };
        let ids = self.ids.clone();
        let sender = events.clone();
        let task = ScopedTask::spawn(async move {
            let mut watch = std::pin::pin!(watch);
            while let Some(event) = watch.next().await {
                let event = match event {
                    HotplugEvent::Connected(info) => {
                        let descriptor = describe(&info);
                        lock(&ids).insert(info.id(), descriptor.id.clone());
                        PlatformEvent::Attached(descriptor)
                    }
                    HotplugEvent::Disconnected(nusb_id) => match lock(&ids).remove(&nusb_id) {
                        Some(id) => PlatformEvent::Detached(id),
                        None => continue,
                    },
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
        });
        *lock(&self.watcher) = Some((task, events));
        info!("USB hotplug watcher started");
    }

    fn unregister_listener(&self) {
        lock(&self.watcher).take();
    }
}

// ── NusbHandle ───────────────────────────────────────────────────

struct NusbHandle {
    id: DeviceId,
    device: Option<nusb::Device>,
    layout: Vec<InterfaceDescriptor>,
    claimed: HashMap<u8, nusb::Interface>,
}

impl NusbHandle {
    /// The claimed interface that owns `endpoint`.
    fn interface_for(&self, endpoint: u8) -> Option<&nusb::Interface> {
        self.layout
            .iter()
            .find(|i| i.endpoints.iter().any(|ep| ep.address == endpoint))
            .and_then(|i| self.claimed.get(&i.number))
            .or_else(|| self.claimed.values().next())
    }
}

impl DeviceHandle for NusbHandle {
    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<(), HostError> {
        let device = self.device.as_ref().ok_or(HostError::Disconnected)?;
        let claimed = if force {
            device.detach_and_claim_interface(interface)
        } else {
            device.claim_interface(interface)
        }
        .map_err(|e| io_error(&self.id, e))?;
        self.claimed.insert(interface, claimed);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) {
        self.claimed.remove(&interface);
    }

    fn bulk_transfer(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        let interface = self
            .interface_for(endpoint)
            .ok_or_else(|| HostError::Io(format!("no claimed interface for endpoint {endpoint:#04x}")))?;
        let transfer = interface.bulk_out(endpoint, data.to_vec());

        let completion = match tokio::runtime::Handle::try_current() {
            // Dropping the future on timeout cancels the transfer.
            Ok(rt) => rt
                .block_on(tokio::time::timeout(timeout, transfer))
                .map_err(|_| HostError::Timeout(timeout))?,
            Err(_) => futures::executor::block_on(transfer),
        };
        completion.status.map_err(transfer_error)?;
        Ok(completion.data.actual_length())
    }

    fn close(&mut self) {
        self.claimed.clear();
        self.device.take();
    }
}

// ── Conversions ──────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stable platform id from bus number and device address.
fn device_id(bus: u8, address: u8) -> DeviceId {
    DeviceId::new(format!("usb:{bus:03}:{address:03}"))
}

/// Build a descriptor from `info`. Endpoint layout needs the device
/// open; without access only interface classes are reported.
fn describe(info: &nusb::DeviceInfo) -> PeripheralDescriptor {
    let mut descriptor = PeripheralDescriptor::new(
        device_id(info.bus_number(), info.device_address()),
        info.vendor_id(),
        info.product_id(),
    )
    .with_class(info.class(), info.subclass());
    if let Some(name) = info.product_string() {
        descriptor = descriptor.with_product_name(name);
    }

    let layout = info.open().ok().and_then(|device| {
        let config = device.active_configuration().ok()?;
        let interfaces: Vec<InterfaceDescriptor> = config
            .interface_alt_settings()
            .filter(|alt| alt.alternate_setting() == 0)
            .map(|alt| {
                alt.endpoints().fold(
                    InterfaceDescriptor::new(alt.interface_number(), alt.class(), alt.subclass()),
                    |iface, ep| {
                        iface.with_endpoint(endpoint(
                            ep.address(),
                            ep.direction(),
                            ep.transfer_type(),
                            ep.max_packet_size(),
                        ))
                    },
                )
            })
            .collect();
        Some(interfaces)
    });

    let interfaces = layout.unwrap_or_else(|| {
        info.interfaces()
            .map(|i| InterfaceDescriptor::new(i.interface_number(), i.class(), i.subclass()))
            .collect()
    });
    for interface in interfaces {
        descriptor = descriptor.with_interface(interface);
    }
    descriptor
}

fn endpoint(
    address: u8,
    direction: transfer::Direction,
    kind: EndpointType,
    max_packet_size: usize,
) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        direction: match direction {
            transfer::Direction::In => Direction::In,
            transfer::Direction::Out => Direction::Out,
        },
        kind: match kind {
            EndpointType::Control => TransferKind::Control,
            EndpointType::Isochronous => TransferKind::Isochronous,
            EndpointType::Bulk => TransferKind::Bulk,
            EndpointType::Interrupt => TransferKind::Interrupt,
        },
        max_packet_size: u16::try_from(max_packet_size).unwrap_or(u16::MAX),
    }
}

fn io_error(id: &DeviceId, e: io::Error) -> HostError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => HostError::AccessDenied,
        io::ErrorKind::NotFound => HostError::NotFound(id.clone()),
        _ => HostError::Io(e.to_string()),
    }
}

fn transfer_error(e: TransferError) -> HostError {
    match e {
        TransferError::Disconnected => HostError::Disconnected,
        other => HostError::Io(other.to_string()),
    }
}

// ── Tests ────────────────────────────────────────────────────────
