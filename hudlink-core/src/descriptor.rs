//! Read-only snapshots of attached USB peripherals.
//!
//! A [`PeripheralDescriptor`] is captured by the platform at
//! enumeration time and never mutated afterwards; a fresh one replaces
//! it on every enumeration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Class codes ──────────────────────────────────────────────────

/// USB class codes used by the driver heuristics.
pub mod class {
    /// Class is defined per interface.
    pub const PER_INTERFACE: u8 = 0x00;
    /// Communications Device Class (control interface).
    pub const CDC: u8 = 0x02;
    /// CDC data interface.
    pub const CDC_DATA: u8 = 0x0A;
    /// Vendor-specific class.
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

// ── DeviceId ─────────────────────────────────────────────────────

/// Opaque platform handle identifying one physical device
/// (e.g. `/dev/bus/usb/001/004`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── UsbId ────────────────────────────────────────────────────────

/// A vendor/product identifier pair, written `vvvv:pppp` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected vvvv:pppp, got {s:?}"))?;
        let parse = |part: &str| {
            let part = part.trim();
            let part = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            u16::from_str_radix(part, 16).map_err(|e| format!("invalid id {part:?} in {s:?}: {e}"))
        };
        Ok(Self::new(parse(vendor)?, parse(product)?))
    }
}

impl TryFrom<String> for UsbId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<UsbId> for String {
    fn from(id: UsbId) -> Self {
        id.to_string()
    }
}

// ── Endpoints & interfaces ───────────────────────────────────────

/// Data direction of an endpoint, relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// USB transfer type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn bulk_out(address: u8) -> Self {
        Self {
            address,
            direction: Direction::Out,
            kind: TransferKind::Bulk,
            max_packet_size: 64,
        }
    }

    pub fn bulk_in(address: u8) -> Self {
        Self {
            address,
            direction: Direction::In,
            kind: TransferKind::Bulk,
            max_packet_size: 64,
        }
    }

    pub fn interrupt_in(address: u8) -> Self {
        Self {
            address,
            direction: Direction::In,
            kind: TransferKind::Interrupt,
            max_packet_size: 16,
        }
    }

    pub fn is_out(&self) -> bool {
        self.direction == Direction::Out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(number: u8, class: u8, subclass: u8) -> Self {
        Self {
            number,
            class,
            subclass,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// The first OUT endpoint, preferring bulk over other transfer types.
    pub fn outbound_endpoint(&self) -> Option<&EndpointDescriptor> {
        self.endpoints
            .iter()
            .find(|ep| ep.is_out() && ep.kind == TransferKind::Bulk)
            .or_else(|| self.endpoints.iter().find(|ep| ep.is_out()))
    }
}

// ── PeripheralDescriptor ─────────────────────────────────────────

/// Snapshot of an attached peripheral's identity and interface layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub product_name: Option<String>,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl PeripheralDescriptor {
    pub fn new(id: DeviceId, vendor_id: u16, product_id: u16) -> Self {
        Self {
            id,
            vendor_id,
            product_id,
            class: class::PER_INTERFACE,
            subclass: 0,
            product_name: None,
            interfaces: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: u8, subclass: u8) -> Self {
        self.class = class;
        self.subclass = subclass;
        self
    }

    pub fn with_product_name(mut self, name: impl Into<String>) -> Self {
        self.product_name = Some(name.into());
        self
    }

    pub fn with_interface(mut self, interface: InterfaceDescriptor) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn usb_id(&self) -> UsbId {
        UsbId::new(self.vendor_id, self.product_id)
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Name shown to operators: the product string, or the platform id.
    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or(self.id.as_str())
    }

    /// Whether the device or any of its interfaces carries `class`.
    pub fn has_class(&self, class: u8) -> bool {
        self.class == class || self.interfaces.iter().any(|i| i.class == class)
    }

    /// One-line summary with enough detail to hand-tune a match later.
    pub fn summary(&self) -> String {
        let classes: Vec<String> = self
            .interfaces
            .iter()
            .map(|i| format!("#{}={:02x}/{:02x}", i.number, i.class, i.subclass))
            .collect();
        format!(
            "{} [{}] class={:02x}/{:02x} product={:?} interfaces=[{}]",
            self.id,
            self.usb_id(),
            self.class,
            self.subclass,
            self.product_name.as_deref().unwrap_or("?"),
            classes.join(" "),
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cdc_device() -> PeripheralDescriptor {
        PeripheralDescriptor::new(DeviceId::new("/dev/bus/usb/001/002"), 0x2341, 0x0043)
            .with_class(class::CDC, 0)
            .with_product_name("HUD Adapter")
            .with_interface(
                InterfaceDescriptor::new(0, class::CDC, 2)
                    .with_endpoint(EndpointDescriptor::interrupt_in(0x82)),
            )
            .with_interface(
                InterfaceDescriptor::new(1, class::CDC_DATA, 0)
                    .with_endpoint(EndpointDescriptor::bulk_in(0x81))
                    .with_endpoint(EndpointDescriptor::bulk_out(0x01)),
            )
    }

    #[test]
    fn usb_id_display_and_parse() {
        let id = UsbId::new(0x0403, 0x6001);
        assert_eq!(id.to_string(), "0403:6001");
        assert_eq!("0403:6001".parse::<UsbId>().unwrap(), id);
        assert_eq!("0x0403:0x6001".parse::<UsbId>().unwrap(), id);
        assert!("04036001".parse::<UsbId>().is_err());
        assert!("zzzz:0001".parse::<UsbId>().is_err());
    }

    #[test]
    fn outbound_endpoint_prefers_bulk() {
        let iface = InterfaceDescriptor::new(0, class::VENDOR_SPECIFIC, 0)
            .with_endpoint(EndpointDescriptor {
                address: 0x03,
                direction: Direction::Out,
                kind: TransferKind::Interrupt,
                max_packet_size: 8,
            })
            .with_endpoint(EndpointDescriptor::bulk_out(0x02));
        assert_eq!(iface.outbound_endpoint().unwrap().address, 0x02);

        let iface = InterfaceDescriptor::new(0, class::CDC, 0)
            .with_endpoint(EndpointDescriptor::interrupt_in(0x81));
        assert!(iface.outbound_endpoint().is_none());
    }

    #[test]
    fn descriptor_queries() {
        let d = cdc_device();
        assert_eq!(d.interface_count(), 2);
        assert!(d.has_class(class::CDC_DATA));
        assert!(!d.has_class(class::VENDOR_SPECIFIC));
        assert_eq!(d.display_name(), "HUD Adapter");
        let summary = d.summary();
        assert!(summary.contains("2341:0043"));
        assert!(summary.contains("#1=0a/00"));
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let d = PeripheralDescriptor::new(DeviceId::new("/dev/bus/usb/002/007"), 1, 2);
        assert_eq!(d.display_name(), "/dev/bus/usb/002/007");
    }
}
