//! Composition root.
//!
//! `HudLink` wires a platform host, the driver registry, the
//! connection manager and the streaming scheduler together and owns
//! their tasks. Dropping it cancels everything; [`HudLink::shutdown`]
//! additionally waits until the device has been released.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::driver::{DriverConfig, DriverRegistry};
use crate::host::UsbHost;
use crate::manager::{ConnectionHandle, ConnectionManager, ManagerConfig};
use crate::streaming::{PositionSource, StreamingConfig, StreamingHandle, StreamingScheduler};
use crate::task::TaskGroup;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub driver: DriverConfig,
    pub streaming: StreamingConfig,
    pub manager: ManagerConfig,
}

pub struct HudLink {
    connection: ConnectionHandle,
    streaming: StreamingHandle,
    tasks: TaskGroup,
}

impl HudLink {
    /// Start the link with every built-in driver.
    pub fn start(
        host: Arc<dyn UsbHost>,
        source: Arc<dyn PositionSource>,
        config: &LinkConfig,
    ) -> Self {
        let registry = DriverRegistry::with_defaults(Arc::clone(&host), &config.driver);
        Self::with_registry(host, registry, source, config)
    }

    pub fn with_registry(
        host: Arc<dyn UsbHost>,
        registry: DriverRegistry,
        source: Arc<dyn PositionSource>,
        config: &LinkConfig,
    ) -> Self {
        let mut tasks = TaskGroup::new();

        let (manager, connection) = ConnectionManager::new(host, registry, &config.manager);
        let (scheduler, streaming) =
            StreamingScheduler::new(connection.clone(), source, &config.streaming);

        tasks.spawn("connection-manager", |token| manager.run(token));
        tasks.spawn("streaming-scheduler", |token| scheduler.run(token));
        info!("HUD link started with {} tasks", tasks.len());

        Self {
            connection,
            streaming,
            tasks,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn streaming(&self) -> &StreamingHandle {
        &self.streaming
    }

    /// Stop streaming, release the device and wait for every task.
    pub async fn shutdown(mut self) {
        self.streaming.stop().await;
        self.tasks.shutdown().await;
        info!("HUD link disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cot::PositionFix;
    use crate::descriptor::{
        DeviceId, EndpointDescriptor, InterfaceDescriptor, PeripheralDescriptor, class,
    };
    use crate::host::SimulatedHost;
    use crate::manager::ConnectionEvent;
    use crate::streaming::{LatestPosition, UpdateRate};

    #[test]
    fn config_sections_default_independently() {
        let cfg: LinkConfig = toml::from_str(
            r#"
            [streaming]
            rate = "10hz"

            [driver.policy]
            strictness = "permissive"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.streaming.rate, UpdateRate::Hz10);
        assert_eq!(cfg.driver.transfer_timeout_ms, 1000);
        assert_eq!(cfg.manager, ManagerConfig::default());
    }

    #[tokio::test]
    async fn shutdown_releases_connected_device() {
        let host = SimulatedHost::new();
        let id = DeviceId::new("hud");
        host.attach_permitted(
            PeripheralDescriptor::new(id.clone(), 0x0403, 0x6015).with_interface(
                InterfaceDescriptor::new(0, class::VENDOR_SPECIFIC, 0)
                    .with_endpoint(EndpointDescriptor::bulk_out(0x01)),
            ),
        );
        let source = Arc::new(LatestPosition::with_fix(PositionFix::test_pattern("T")));
        let link = HudLink::start(Arc::new(host.clone()), source, &LinkConfig::default());

        let mut events = link.connection().subscribe();
        link.connection().request_connection(&id).await.unwrap();
        loop {
            if let ConnectionEvent::Connected { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        link.streaming().start().await.unwrap();
        assert_eq!(host.open_handles(&id), 1);

        link.shutdown().await;
        assert_eq!(host.open_handles(&id), 0);
        assert!(!host.has_listener());
    }
}
