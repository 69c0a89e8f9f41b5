//! TOML config file loading and validation.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::device::DeviceIdentity;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub sensor: SensorConfig,
    pub relay: RelayConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SensorConfig {
    pub object_id: String,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub unit_of_measurement: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub object_id: String,
    pub name: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    /// Seconds between sampling windows.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_sec: u64,
    /// Probe settle delay between power-up and measurement.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Readings strictly below this voltage trigger watering.
    #[serde(default = "default_threshold")]
    pub moisture_threshold_volts: f64,
    /// Relay on-time per activation; the cutoff deadline.
    #[serde(default = "default_relay_on")]
    pub relay_on_sec: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_sec: u64,
    /// Awake window before deep sleep. 0 keeps the node awake forever.
    #[serde(default)]
    pub awake_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct HardwareConfig {
    /// I2C address of the ADS1115.
    #[serde(default = "default_adc_addr")]
    pub adc_addr: u16,
    /// BCM pin switching the probe's power rail.
    #[serde(default = "default_probe_power_pin")]
    pub probe_power_pin: u8,
    /// BCM pin driving the pump relay.
    #[serde(default = "default_relay_pin")]
    pub relay_pin: u8,
    #[serde(default)]
    pub relay_active_low: bool,
}

fn default_port() -> u16 {
    1883
}

fn default_sample_interval() -> u64 {
    60
}

fn default_settle_ms() -> u64 {
    200
}

fn default_threshold() -> f64 {
    1.0
}

fn default_relay_on() -> u64 {
    5
}

fn default_heartbeat() -> u64 {
    30
}

fn default_adc_addr() -> u16 {
    0x48
}

fn default_probe_power_pin() -> u8 {
    23
}

fn default_relay_pin() -> u8 {
    17
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sample_interval_sec: default_sample_interval(),
            settle_ms: default_settle_ms(),
            moisture_threshold_volts: default_threshold(),
            relay_on_sec: default_relay_on(),
            heartbeat_sec: default_heartbeat(),
            awake_sec: 0,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            adc_addr: default_adc_addr(),
            probe_power_pin: default_probe_power_pin(),
            relay_pin: default_relay_pin(),
            relay_active_low: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn sensor_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            component: "sensor".to_string(),
            node_id: self.device.node_id.clone(),
            object_id: self.sensor.object_id.clone(),
            name: self.sensor.name.clone(),
            icon: self.sensor.icon.clone(),
            unit_of_measurement: self.sensor.unit_of_measurement.clone(),
            commandable: false,
        }
    }

    pub fn relay_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            component: "switch".to_string(),
            node_id: self.device.node_id.clone(),
            object_id: self.relay.object_id.clone(),
            name: self.relay.name.clone(),
            icon: self.relay.icon.clone(),
            unit_of_measurement: None,
            commandable: true,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.control.sample_interval_sec)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.control.settle_ms)
    }

    pub fn relay_on_duration(&self) -> Duration {
        Duration::from_secs(self.control.relay_on_sec)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.control.heartbeat_sec)
    }

    /// `None` means stay awake forever.
    pub fn awake_window(&self) -> Option<Duration> {
        (self.control.awake_sec > 0).then(|| Duration::from_secs(self.control.awake_sec))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.broker.host.trim().is_empty() {
            errors.push("broker: host is empty".to_string());
        }
        if self.broker.username.is_some() != self.broker.password.is_some() {
            errors.push("broker: username and password must be set together".to_string());
        }

        self.sensor_identity().collect_violations("sensor", &mut errors);
        self.relay_identity().collect_violations("relay", &mut errors);
        if self.sensor.object_id == self.relay.object_id {
            errors.push(format!(
                "sensor/relay: object_id '{}' used by both devices",
                self.sensor.object_id
            ));
        }

        self.validate_control(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if c.sample_interval_sec == 0 {
            errors.push("control: sample_interval_sec must be positive".to_string());
        }
        if c.settle_ms == 0 {
            errors.push("control: settle_ms must be positive".to_string());
        }
        if c.relay_on_sec == 0 {
            errors.push("control: relay_on_sec must be positive".to_string());
        }
        if c.heartbeat_sec == 0 {
            errors.push("control: heartbeat_sec must be positive".to_string());
        }
        // The probe tops out at the 3.3 V rail.
        if !(0.0..=3.3).contains(&c.moisture_threshold_volts) {
            errors.push(format!(
                "control: moisture_threshold_volts {} out of range [0.0, 3.3]",
                c.moisture_threshold_volts
            ));
        }
        // The settle delay must fit inside a sampling interval.
        if c.settle_ms >= c.sample_interval_sec.saturating_mul(1000) {
            errors.push(format!(
                "control: settle_ms ({}) must be shorter than sample_interval_sec ({})",
                c.settle_ms, c.sample_interval_sec
            ));
        }
        if c.awake_sec > 0 && c.awake_sec < c.sample_interval_sec {
            errors.push(format!(
                "control: awake_sec ({}) is shorter than sample_interval_sec ({}) — \
                 the node would sleep before its first sample",
                c.awake_sec, c.sample_interval_sec
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_toml() -> &'static str {
        r#"
[broker]
host = "mqtt.local"

[device]
node_id = "esp1"

[sensor]
object_id = "moisture1"
unit_of_measurement = "V"

[relay]
object_id = "relay1"
name = "Pump switch"
"#
    }

    fn valid_config() -> Config {
        toml::from_str(valid_toml()).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let cfg = valid_config();
        assert_eq!(cfg.broker.host, "mqtt.local");
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.device.node_id, "esp1");
        assert_eq!(cfg.control.sample_interval_sec, 60);
        assert_eq!(cfg.control.awake_sec, 0);
        assert_eq!(cfg.hardware.adc_addr, 0x48);
    }

    #[test]
    fn parse_full_config() {
        let cfg: Config = toml::from_str(
            r#"
[broker]
host = "10.0.0.2"
port = 8883
username = "node"
password = "secret"

[device]
node_id = "greenhouse"

[sensor]
object_id = "bed1"
name = "Bed 1 moisture"
icon = "mdi:water-percent"
unit_of_measurement = "V"

[relay]
object_id = "pump1"

[control]
sample_interval_sec = 120
settle_ms = 500
moisture_threshold_volts = 1.2
relay_on_sec = 8
heartbeat_sec = 60
awake_sec = 600

[hardware]
adc_addr = 0x49
probe_power_pin = 24
relay_pin = 27
relay_active_low = true
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.control.moisture_threshold_volts, 1.2);
        assert_eq!(cfg.awake_window(), Some(Duration::from_secs(600)));
        assert!(cfg.hardware.relay_active_low);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn empty_host_rejected() {
        let mut cfg = valid_config();
        cfg.broker.host = "  ".into();
        assert_validation_err(&cfg, "host is empty");
    }

    #[test]
    fn username_without_password_rejected() {
        let mut cfg = valid_config();
        cfg.broker.username = Some("node".into());
        assert_validation_err(&cfg, "must be set together");
    }

    #[test]
    fn empty_node_id_rejected() {
        let mut cfg = valid_config();
        cfg.device.node_id = "".into();
        assert_validation_err(&cfg, "node_id is empty");
    }

    #[test]
    fn wildcard_object_id_rejected() {
        let mut cfg = valid_config();
        cfg.sensor.object_id = "moist#1".into();
        assert_validation_err(&cfg, "topic separator or wildcard");
    }

    #[test]
    fn oversize_name_rejected() {
        let mut cfg = valid_config();
        cfg.relay.name = Some("x".repeat(51));
        assert_validation_err(&cfg, "relay: name is 51 chars");
    }

    #[test]
    fn shared_object_id_rejected() {
        let mut cfg = valid_config();
        cfg.relay.object_id = cfg.sensor.object_id.clone();
        assert_validation_err(&cfg, "used by both devices");
    }

    #[test]
    fn zero_sample_interval_rejected() {
        let mut cfg = valid_config();
        cfg.control.sample_interval_sec = 0;
        assert_validation_err(&cfg, "sample_interval_sec must be positive");
    }

    #[test]
    fn zero_relay_on_rejected() {
        let mut cfg = valid_config();
        cfg.control.relay_on_sec = 0;
        assert_validation_err(&cfg, "relay_on_sec must be positive");
    }

    #[test]
    fn threshold_above_rail_rejected() {
        let mut cfg = valid_config();
        cfg.control.moisture_threshold_volts = 3.4;
        assert_validation_err(&cfg, "out of range [0.0, 3.3]");
    }

    #[test]
    fn threshold_negative_rejected() {
        let mut cfg = valid_config();
        cfg.control.moisture_threshold_volts = -0.1;
        assert_validation_err(&cfg, "out of range [0.0, 3.3]");
    }

    #[test]
    fn settle_longer_than_interval_rejected() {
        let mut cfg = valid_config();
        cfg.control.sample_interval_sec = 1;
        cfg.control.settle_ms = 1000;
        assert_validation_err(&cfg, "must be shorter than sample_interval_sec");
    }

    #[test]
    fn awake_shorter_than_interval_rejected() {
        let mut cfg = valid_config();
        cfg.control.awake_sec = 30;
        cfg.control.sample_interval_sec = 60;
        assert_validation_err(&cfg, "would sleep before its first sample");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.broker.host = "".into();
        cfg.device.node_id = "".into();
        cfg.control.relay_on_sec = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("host is empty"), "{msg}");
        assert!(msg.contains("node_id is empty"), "{msg}");
        assert!(msg.contains("relay_on_sec"), "{msg}");
    }

    // -- Derived values ---------------------------------------------------

    #[test]
    fn identities_inherit_node_id() {
        let cfg = valid_config();
        let sensor = cfg.sensor_identity();
        let relay = cfg.relay_identity();
        assert_eq!(sensor.node_id, "esp1");
        assert_eq!(relay.node_id, "esp1");
        assert!(!sensor.commandable);
        assert!(relay.commandable);
    }

    #[test]
    fn zero_awake_means_no_window() {
        assert_eq!(valid_config().awake_window(), None);
    }
}
