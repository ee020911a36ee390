//! ECOTI thermal / night-vision HUD, attached through a USB-C adapter.
//!
//! ECOTI has not published a vendor/product pair, so identification
//! relies on the [`MatchPolicy`] heuristics unless an exact id is
//! configured.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{DriverConfig, DriverPrototype, HudDriver, MatchPolicy, TransferStatus};
use crate::cot::{PositionFix, TelemetryMessage};
use crate::descriptor::{InterfaceDescriptor, PeripheralDescriptor, UsbId};
use crate::error::DriverError;
use crate::host::{DeviceHandle, UsbHost};

const NAME: &str = "ECOTI";
const MANUFACTURER: &str = "ECOTI";

// ── EcotiPrototype ───────────────────────────────────────────────

/// Registry entry producing [`EcotiDriver`] instances.
pub struct EcotiPrototype {
    host: Arc<dyn UsbHost>,
    config: DriverConfig,
    known_id: Option<UsbId>,
}

impl EcotiPrototype {
    pub fn new(host: Arc<dyn UsbHost>, config: DriverConfig) -> Self {
        Self {
            host,
            config,
            known_id: None,
        }
    }

    /// Pin the exact vendor/product pair once it is known.
    pub fn with_known_id(mut self, id: UsbId) -> Self {
        self.known_id = Some(id);
        self
    }
}

impl DriverPrototype for EcotiPrototype {
    fn name(&self) -> &str {
        NAME
    }

    fn identify(&self, descriptor: &PeripheralDescriptor) -> bool {
        identify(&self.config.policy, self.known_id, descriptor)
    }

    fn instantiate(&self) -> Box<dyn HudDriver> {
        let mut driver = EcotiDriver::new(Arc::clone(&self.host), self.config.clone());
        driver.known_id = self.known_id;
        Box::new(driver)
    }
}

fn identify(policy: &MatchPolicy, known: Option<UsbId>, descriptor: &PeripheralDescriptor) -> bool {
    policy.evaluate(known, descriptor).accepted()
}

// ── EcotiDriver ──────────────────────────────────────────────────

pub struct EcotiDriver {
    host: Arc<dyn UsbHost>,
    config: DriverConfig,
    known_id: Option<UsbId>,

    // Held only while connected.
    handle: Option<Box<dyn DeviceHandle>>,
    interface: Option<u8>,
    endpoint_out: Option<u8>,
    device_name: Option<String>,

    last_error: Option<String>,
}

impl EcotiDriver {
    pub fn new(host: Arc<dyn UsbHost>, config: DriverConfig) -> Self {
        Self {
            host,
            config,
            known_id: None,
            handle: None,
            interface: None,
            endpoint_out: None,
            device_name: None,
            last_error: None,
        }
    }

    fn fail(&mut self, e: DriverError) -> DriverError {
        error!("{NAME}: {e}");
        self.last_error = Some(e.to_string());
        e
    }

    fn try_connect(&mut self, descriptor: &PeripheralDescriptor) -> Result<(), DriverError> {
        if !self.host.has_permission(&descriptor.id) {
            return Err(DriverError::NoPermission);
        }

        let handle = self.host.open(descriptor).map_err(DriverError::OpenFailed)?;
        let handle = self.handle.insert(handle);

        let iface = select_interface(descriptor).ok_or(DriverError::NoInterfaces)?;
        handle
            .claim_interface(iface.number, self.config.force_claim)
            .map_err(|source| DriverError::ClaimFailed {
                interface: iface.number,
                source,
            })?;
        self.interface = Some(iface.number);

        let endpoint = iface
            .outbound_endpoint()
            .ok_or(DriverError::NoOutboundEndpoint)?;
        self.endpoint_out = Some(endpoint.address);
        self.device_name = Some(descriptor.display_name().to_string());
        Ok(())
    }
}

/// The interface carrying the first OUT endpoint, else interface 0.
fn select_interface(descriptor: &PeripheralDescriptor) -> Option<&InterfaceDescriptor> {
    descriptor
        .interfaces
        .iter()
        .find(|i| i.outbound_endpoint().is_some())
        .or_else(|| descriptor.interfaces.first())
}

impl HudDriver for EcotiDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn manufacturer(&self) -> &str {
        MANUFACTURER
    }

    fn identify(&self, descriptor: &PeripheralDescriptor) -> bool {
        identify(&self.config.policy, self.known_id, descriptor)
    }

    fn connect(&mut self, descriptor: &PeripheralDescriptor) -> Result<(), DriverError> {
        self.disconnect();
        match self.try_connect(descriptor) {
            Ok(()) => {
                self.last_error = None;
                info!(
                    "{NAME}: connected to {} (endpoint {:#04x})",
                    descriptor.display_name(),
                    self.endpoint_out.unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                self.disconnect();
                Err(self.fail(e))
            }
        }
    }

    fn disconnect(&mut self) {
        let released = self.handle.is_some();
        if let Some(mut handle) = self.handle.take() {
            if let Some(interface) = self.interface {
                handle.release_interface(interface);
            }
            handle.close();
        }
        self.interface = None;
        self.endpoint_out = None;
        self.device_name = None;
        if released {
            debug!("{NAME}: disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some() && self.endpoint_out.is_some()
    }

    fn transmit(&mut self, payload: &[u8]) -> Result<TransferStatus, DriverError> {
        let timeout = self.config.transfer_timeout();
        let (Some(handle), Some(endpoint)) = (self.handle.as_mut(), self.endpoint_out) else {
            return Err(self.fail(DriverError::NotConnected));
        };

        match handle.bulk_transfer(endpoint, payload, timeout) {
            Ok(sent) => {
                let status = TransferStatus::from_counts(sent, payload.len());
                if status.is_partial() {
                    warn!("{NAME}: {status}");
                } else {
                    debug!("{NAME}: {status}");
                }
                Ok(status)
            }
            Err(e) => Err(self.fail(DriverError::TransferFailed(e))),
        }
    }

    fn send_position(&mut self, fix: &PositionFix) -> Result<TransferStatus, DriverError> {
        if !fix.is_valid() {
            return Err(self.fail(DriverError::InvalidPosition(format!(
                "lat={} lon={}",
                fix.lat, fix.lon
            ))));
        }
        let message = TelemetryMessage::position(fix);
        self.transmit(&message.to_bytes())
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn status(&self) -> String {
        match (&self.device_name, self.is_connected()) {
            (Some(name), true) => format!("Connected to {name}"),
            (None, true) => format!("Connected to {NAME}"),
            _ => "Not connected".to_string(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
