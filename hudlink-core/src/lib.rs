//! # hudlink-core
//!
//! HUD peripheral connection and telemetry streaming.
//!
//! This crate contains:
//! - **Descriptor**: `PeripheralDescriptor`, `UsbId` and interface/endpoint layout
//! - **Host**: `UsbHost` / `DeviceHandle` platform boundary, `SimulatedHost`,
//!   and `NusbHost` behind the `usb` feature
//! - **CoT**: `TelemetryMessage` encoder, `CotData` parser, `format_for_hud`
//! - **Driver**: `HudDriver` trait, the ECOTI driver, `MatchPolicy`, `DriverRegistry`
//! - **State**: validated `ConnectionPhase` machine
//! - **Manager**: `ConnectionManager` actor and its `ConnectionHandle`
//! - **Streaming**: `StreamingScheduler` merging push and timer triggers
//! - **Task**: `ScopedTask` and `TaskGroup` ownership helpers
//! - **Link**: `HudLink`, the composition root
//! - **Error**: typed, `thiserror`-based error hierarchy

pub mod cot;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod host;
pub mod link;
pub mod manager;
pub mod state;
pub mod streaming;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use cot::{Affiliation, CotData, PositionFix, TelemetryMessage, format_for_hud};
pub use descriptor::{DeviceId, PeripheralDescriptor, UsbId};
pub use driver::{
    DriverConfig, DriverPrototype, DriverRegistry, EcotiDriver, EcotiPrototype, HudDriver,
    MatchPolicy, Strictness, TransferStatus,
};
pub use error::{ConnectionError, CotError, DriverError, HostError, StreamError};
pub use host::{DeviceHandle, PlatformEvent, SimBehavior, SimulatedHost, UsbHost};
#[cfg(feature = "usb")]
pub use host::NusbHost;
pub use link::{HudLink, LinkConfig};
pub use manager::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionSnapshot};
pub use state::ConnectionPhase;
pub use streaming::{
    LatestPosition, PositionSource, StreamStatus, StreamingConfig, StreamingHandle, UpdateRate,
};
pub use task::{ScopedTask, TaskGroup};
