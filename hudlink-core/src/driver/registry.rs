use std::sync::Arc;

use super::{DriverConfig, DriverPrototype, EcotiPrototype};
use crate::descriptor::PeripheralDescriptor;
use crate::host::UsbHost;

/// Ordered set of known drivers. Registration order breaks ties:
/// the first prototype that identifies a descriptor wins.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    prototypes: Vec<Arc<dyn DriverPrototype>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in driver.
    pub fn with_defaults(host: Arc<dyn UsbHost>, config: &DriverConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EcotiPrototype::new(host, config.clone())));
        registry
    }

    pub fn register(&mut self, prototype: Arc<dyn DriverPrototype>) {
        self.prototypes.push(prototype);
    }

    /// Every prototype accepting `descriptor`, in registration order.
    pub fn compatible<'a>(
        &'a self,
        descriptor: &'a PeripheralDescriptor,
    ) -> impl Iterator<Item = Arc<dyn DriverPrototype>> + 'a {
        self.prototypes
            .iter()
            .filter(move |p| p.identify(descriptor))
            .cloned()
    }

    pub fn supports(&self, descriptor: &PeripheralDescriptor) -> bool {
        self.prototypes.iter().any(|p| p.identify(descriptor))
    }

    /// Keep the devices some driver accepts, preserving order.
    pub fn filter(&self, devices: Vec<PeripheralDescriptor>) -> Vec<PeripheralDescriptor> {
        devices.into_iter().filter(|d| self.supports(d)).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.prototypes.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cot::PositionFix;
    use crate::descriptor::DeviceId;
    use crate::driver::{HudDriver, TransferStatus};
    use crate::error::DriverError;

    /// Accepts descriptors whose vendor id is in `vendors`.
    struct VendorDriver {
        name: &'static str,
        vendors: Vec<u16>,
    }

    impl DriverPrototype for VendorDriver {
        fn name(&self) -> &str {
            self.name
        }

        fn identify(&self, descriptor: &PeripheralDescriptor) -> bool {
            self.vendors.contains(&descriptor.vendor_id)
        }

        fn instantiate(&self) -> Box<dyn HudDriver> {
            Box::new(NullDriver)
        }
    }

    struct NullDriver;

    impl HudDriver for NullDriver {
        fn name(&self) -> &str {
            "null"
        }
        fn manufacturer(&self) -> &str {
            "none"
        }
        fn identify(&self, _: &PeripheralDescriptor) -> bool {
            false
        }
        fn connect(&mut self, _: &PeripheralDescriptor) -> Result<(), DriverError> {
            Err(DriverError::NoInterfaces)
        }
        fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            false
        }
        fn transmit(&mut self, _: &[u8]) -> Result<TransferStatus, DriverError> {
            Err(DriverError::NotConnected)
        }
        fn send_position(&mut self, _: &PositionFix) -> Result<TransferStatus, DriverError> {
            Err(DriverError::NotConnected)
        }
        fn last_error(&self) -> Option<&str> {
            None
        }
        fn status(&self) -> String {
            "Not connected".into()
        }
    }

    fn registry() -> DriverRegistry {
        let mut r = DriverRegistry::new();
        r.register(Arc::new(VendorDriver {
            name: "first",
            vendors: vec![1, 2],
        }));
        r.register(Arc::new(VendorDriver {
            name: "second",
            vendors: vec![2, 3],
        }));
        r
    }

    fn device(vendor: u16) -> PeripheralDescriptor {
        PeripheralDescriptor::new(DeviceId::new(format!("dev-{vendor}")), vendor, 0)
    }

    #[test]
    fn first_registered_wins() {
        let r = registry();
        let first = |vendor| r.compatible(&device(vendor)).next().map(|p| p.name().to_string());
        assert_eq!(first(2).as_deref(), Some("first"));
        assert_eq!(first(3).as_deref(), Some("second"));
        assert_eq!(first(4), None);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn compatible_lists_all_in_order() {
        let r = registry();
        let names: Vec<String> = r
            .compatible(&device(2))
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn filter_preserves_enumeration_order() {
        let r = registry();
        let kept = r.filter(vec![device(3), device(9), device(1)]);
        let vendors: Vec<u16> = kept.iter().map(|d| d.vendor_id).collect();
        assert_eq!(vendors, [3, 1]);
    }

    #[test]
    fn empty_registry_supports_nothing() {
        let r = DriverRegistry::new();
        assert!(r.is_empty());
        assert!(!r.supports(&device(1)));
        assert!(r.filter(vec![device(1)]).is_empty());
    }
}
