//! Configuration for the simulation harness.

use std::path::Path;

use serde::{Deserialize, Serialize};

use hudlink_core::descriptor::{
    DeviceId, EndpointDescriptor, InterfaceDescriptor, PeripheralDescriptor, class,
};
use hudlink_core::manager::ManagerConfig;
use hudlink_core::{DriverConfig, LinkConfig, StreamingConfig, UsbId};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Driver matching and transfer settings.
    pub driver: DriverConfig,
    /// Streaming rate and trigger queue.
    pub streaming: StreamingConfig,
    /// Connection manager channel sizes.
    pub manager: ManagerConfig,
    /// The scripted run.
    pub scenario: ScenarioConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// What the simulated operator and hardware do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Identity of the simulated HUD.
    pub device: UsbId,
    pub product_name: String,
    /// Platform path of the simulated HUD.
    pub device_path: String,
    /// Skip the permission prompt.
    pub pre_granted: bool,
    /// How long the operator takes to answer the prompt.
    pub grant_delay_ms: u64,
    /// Answer the prompt with a denial.
    pub deny: bool,
    /// Accept at most this many bytes per transfer (0 = unlimited).
    pub short_write: usize,
    /// Unplug the HUD after this many seconds (0 = never).
    pub detach_after_secs: u64,
    /// Chance per 100 ms step that the host pushes a position change.
    pub push_probability: f64,
    /// RNG seed for the track (0 = random).
    pub seed: u64,
    pub track: TrackConfig,
}

/// The simulated operator's movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub callsign: String,
    pub lat: f64,
    pub lon: f64,
    pub hae: f64,
    /// Initial heading in degrees.
    pub heading: f64,
    /// Ground speed in meters per second.
    pub speed_mps: f64,
    /// Maximum heading change per step, in degrees.
    pub heading_jitter: f64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            device: UsbId::new(0x0403, 0x6015),
            product_name: "ECOTI HUD".into(),
            device_path: "/dev/bus/usb/001/004".into(),
            pre_granted: false,
            grant_delay_ms: 500,
            deny: false,
            short_write: 0,
            detach_after_secs: 8,
            push_probability: 0.3,
            seed: 0,
            track: TrackConfig::default(),
        }
    }
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            callsign: "HUDLink-SIM".into(),
            lat: 38.8895,
            lon: -77.0353,
            hae: 18.0,
            heading: 90.0,
            speed_mps: 1.4,
            heading_jitter: 5.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SimConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig {
            driver: self.driver.clone(),
            streaming: self.streaming.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl ScenarioConfig {
    /// Descriptor of the simulated HUD: a vendor-specific interface
    /// with one bulk endpoint each way.
    pub fn descriptor(&self) -> PeripheralDescriptor {
        PeripheralDescriptor::new(
            DeviceId::new(self.device_path.clone()),
            self.device.vendor_id,
            self.device.product_id,
        )
        .with_product_name(self.product_name.clone())
        .with_interface(
            InterfaceDescriptor::new(0, class::VENDOR_SPECIFIC, 0xFF)
                .with_endpoint(EndpointDescriptor::bulk_in(0x81))
                .with_endpoint(EndpointDescriptor::bulk_out(0x02)),
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hudlink_core::{Strictness, UpdateRate};

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&SimConfig::default()).unwrap();
        assert!(text.contains("[scenario]"));
        assert!(text.contains("device = \"0403:6015\""));
        assert!(text.contains("rate = \"1hz\""));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&SimConfig::default()).unwrap();
        let parsed: SimConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.scenario.grant_delay_ms, 500);
        assert_eq!(parsed.driver.policy.strictness, Strictness::Heuristic);
        assert_eq!(parsed.streaming.rate, UpdateRate::Hz1);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let parsed: SimConfig = toml::from_str(
            r#"
            [streaming]
            rate = "5hz"

            [scenario]
            pre_granted = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.streaming.rate, UpdateRate::Hz5);
        assert!(parsed.scenario.pre_granted);
        assert_eq!(parsed.scenario.track.callsign, "HUDLink-SIM");
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = SimConfig::load(Path::new("/nonexistent/hudlink-sim.toml"));
        assert_eq!(cfg.scenario.detach_after_secs, 8);
    }

    #[test]
    fn descriptor_matches_scenario() {
        let desc = ScenarioConfig::default().descriptor();
        assert_eq!(desc.usb_id(), UsbId::new(0x0403, 0x6015));
        assert_eq!(desc.display_name(), "ECOTI HUD");
        assert_eq!(desc.interface_count(), 1);
    }
}
