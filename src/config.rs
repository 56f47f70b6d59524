//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. built-in defaults (the bench's Hall-probe x/y/z stage on a PM1000)
//! 2. a TOML file (`config/default.toml` unless another path is given)
//! 3. environment variables prefixed with `HALLPROBE_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use hallprobe_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // HALLPROBE_CONTROLLER__PORT=/dev/ttyUSB1 overrides the file
//! let settings = Settings::load_from("config/default.toml")?;
//! println!("Controller on {}", settings.controller.port);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::axis::AxisKind;
use crate::hardware::protocol::{ControllerVariant, Parity, SerialParams};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link to the motor controller
    pub controller: ControllerSettings,
    /// Motion polling and timeouts
    pub motion: MotionSettings,
    /// Scan execution parameters
    pub scan: ScanSettings,
    /// Axis definitions
    pub axes: Vec<AxisSettings>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Serial link settings.
///
/// Baud rate, data bits, parity and stop bits default to the controller
/// variant's factory settings and only need to be given when the physical
/// unit has been reconfigured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Protocol variant spoken by the controller
    #[serde(default)]
    pub variant: ControllerVariant,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM1")
    pub port: String,
    /// Baud rate override
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Data bits override (7 or 8)
    #[serde(default)]
    pub data_bits: Option<u8>,
    /// Parity override
    #[serde(default)]
    pub parity: Option<Parity>,
    /// Stop bits override (1 or 2)
    #[serde(default)]
    pub stop_bits: Option<u8>,
    /// Per-read timeout on the channel
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Pause before re-reading after a non-OK status line
    #[serde(with = "humantime_serde", default = "default_retry_grace")]
    pub retry_grace: Duration,
    /// Pause before reading the multi-line query-all report
    #[serde(with = "humantime_serde", default = "default_query_delay")]
    pub query_delay: Duration,
}

/// Motion polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    /// Interval between position polls while waiting for a move
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Extra time added to the travel-time estimate of a move
    #[serde(with = "humantime_serde", default = "default_move_grace")]
    pub move_grace: Duration,
    /// Attempts at reading a position before giving up
    #[serde(default = "default_position_retries")]
    pub position_retries: u32,
    /// Interval between write-port polls while waiting for a trigger pulse
    #[serde(with = "humantime_serde", default = "default_pulse_poll_interval")]
    pub pulse_poll_interval: Duration,
}

/// Scan execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Field readings averaged per point
    #[serde(default = "default_averages")]
    pub averages: u32,
    /// Pause between arriving at a point and sampling
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
    /// Pause at the start of each on-the-fly sweep
    #[serde(with = "humantime_serde", default = "default_sweep_settle")]
    pub sweep_settle: Duration,
    /// Minimum trigger output on-time in milliseconds
    #[serde(default = "default_trigger_on_time")]
    pub trigger_on_time_ms: u32,
    /// Controller write port used for trigger pulses (1-8)
    #[serde(default = "default_trigger_port")]
    pub trigger_port: u8,
    /// Distance driven past the last nominal point of a sweep
    #[serde(default = "default_overshoot")]
    pub overshoot: f64,
    /// Pause after commanding a sweep before watching for pulses
    #[serde(with = "humantime_serde", default = "default_trigger_lead_in")]
    pub trigger_lead_in: Duration,
    /// Coordinate resolution for random-sample points
    #[serde(default = "default_random_resolution")]
    pub random_resolution: f64,
    /// Output directory for CSV and summary files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// One controller axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSettings {
    /// Logical name, e.g. "x"
    pub name: String,
    /// Additional names accepted by lookups
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Controller-assigned axis number
    pub id: u8,
    /// Steps per mm (linear) or per degree (rotary)
    pub scale: f64,
    /// Maximum slew speed in units/s
    pub max_speed: f64,
    /// Acceleration in units/s²
    pub acceleration: f64,
    /// Linear or rotary
    #[serde(default)]
    pub kind: AxisKind,
}

// Default value functions
fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_query_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_move_grace() -> Duration {
    Duration::from_secs(60)
}

fn default_position_retries() -> u32 {
    5
}

fn default_pulse_poll_interval() -> Duration {
    Duration::from_millis(5)
}

fn default_averages() -> u32 {
    10
}

fn default_settle() -> Duration {
    Duration::from_millis(100)
}

fn default_sweep_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_trigger_on_time() -> u32 {
    20
}

fn default_trigger_port() -> u8 {
    1
}

fn default_overshoot() -> f64 {
    0.1
}

fn default_trigger_lead_in() -> Duration {
    Duration::from_millis(50)
}

fn default_random_resolution() -> f64 {
    0.01
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            move_grace: default_move_grace(),
            position_retries: default_position_retries(),
            pulse_poll_interval: default_pulse_poll_interval(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            averages: default_averages(),
            settle: default_settle(),
            sweep_settle: default_sweep_settle(),
            trigger_on_time_ms: default_trigger_on_time(),
            trigger_port: default_trigger_port(),
            overshoot: default_overshoot(),
            trigger_lead_in: default_trigger_lead_in(),
            random_resolution: default_random_resolution(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            variant: ControllerVariant::default(),
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: None,
            data_bits: None,
            parity: None,
            stop_bits: None,
            read_timeout: default_read_timeout(),
            retry_grace: default_retry_grace(),
            query_delay: default_query_delay(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let axis = |name: &str, id, scale, max_speed, acceleration| AxisSettings {
            name: name.to_string(),
            aliases: vec![format!("hp {name}")],
            id,
            scale,
            max_speed,
            acceleration,
            kind: AxisKind::Linear,
        };
        Self {
            application: ApplicationConfig {
                name: "Hall probe scanner".to_string(),
                log_level: "info".to_string(),
            },
            controller: ControllerSettings::default(),
            motion: MotionSettings::default(),
            scan: ScanSettings::default(),
            axes: vec![
                axis("x", 3, 3200.0, 6.0, 0.5),
                axis("y", 4, 3200.0, 6.0, 0.75),
                axis("z", 5, 1000.0, 50.0, 10.0),
            ],
        }
    }
}

impl ControllerSettings {
    /// Serial parameters: the variant's factory settings with any overrides applied.
    pub fn serial_params(&self) -> SerialParams {
        let base = self.variant.default_serial();
        SerialParams {
            baud_rate: self.baud_rate.unwrap_or(base.baud_rate),
            data_bits: self.data_bits.unwrap_or(base.data_bits),
            parity: self.parity.unwrap_or(base.parity),
            stop_bits: self.stop_bits.unwrap_or(base.stop_bits),
        }
    }
}

impl Settings {
    /// Load configuration from the default path and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and validate it.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Example override: `HALLPROBE_SCAN__AVERAGES=20`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HALLPROBE_").split("__"))
            .extract()?;
        settings.validate().map_err(DaqError::Configuration)?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let serial = self.controller.serial_params();
        if !(7..=8).contains(&serial.data_bits) {
            return Err(format!("Invalid data_bits {}. Must be 7 or 8", serial.data_bits));
        }
        if !(1..=2).contains(&serial.stop_bits) {
            return Err(format!("Invalid stop_bits {}. Must be 1 or 2", serial.stop_bits));
        }

        if self.scan.averages == 0 {
            return Err("scan.averages must be at least 1".to_string());
        }
        if !(1..=8).contains(&self.scan.trigger_port) {
            return Err(format!(
                "Invalid trigger_port {}. Must be 1-8",
                self.scan.trigger_port
            ));
        }
        if self.scan.overshoot < 0.0 || self.scan.random_resolution <= 0.0 {
            return Err("scan.overshoot must be >= 0 and scan.random_resolution > 0".to_string());
        }

        // Names and aliases share one namespace, compared case-insensitively
        let mut names = HashSet::new();
        for axis in &self.axes {
            for name in std::iter::once(&axis.name).chain(axis.aliases.iter()) {
                if !names.insert(name.to_lowercase()) {
                    return Err(format!("Duplicate axis name or alias: {name}"));
                }
            }
            if axis.scale == 0.0 || !axis.scale.is_finite() {
                return Err(format!("Axis {} has invalid scale {}", axis.name, axis.scale));
            }
            if axis.max_speed <= 0.0 {
                return Err(format!(
                    "Axis {} has invalid max_speed {}",
                    axis.name, axis.max_speed
                ));
            }
        }
        for required in ["x", "y", "z"] {
            if !names.contains(required) {
                return Err(format!("No axis named '{required}' configured"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.axes.len(), 3);
        assert_eq!(settings.controller.serial_params().baud_rate, 38400);
    }

    #[test]
    fn test_config_validation() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scan.trigger_port = 9;
        assert!(settings.validate().unwrap_err().contains("trigger_port"));

        let mut settings = Settings::default();
        settings.axes[1].aliases.push("X".to_string());
        assert!(settings.validate().unwrap_err().contains("Duplicate"));

        let mut settings = Settings::default();
        settings.axes.retain(|a| a.name != "z");
        assert!(settings.validate().unwrap_err().contains("'z'"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench"
log_level = "debug"

[controller]
variant = "pm600"
port = "/dev/ttyS3"
read_timeout = "250ms"

[scan]
averages = 3
settle = "20ms"

[[axes]]
name = "x"
id = 1
scale = 100.0
max_speed = 5.0
acceleration = 1.0

[[axes]]
name = "y"
id = 2
scale = 100.0
max_speed = 5.0
acceleration = 1.0

[[axes]]
name = "z"
id = 3
scale = 100.0
max_speed = 5.0
acceleration = 1.0
kind = "linear"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.name, "bench");
        assert_eq!(settings.controller.variant, ControllerVariant::Pm600);
        assert_eq!(settings.controller.read_timeout, Duration::from_millis(250));
        assert_eq!(settings.controller.retry_grace, Duration::from_secs(2));
        assert_eq!(settings.scan.averages, 3);
        assert_eq!(settings.scan.settle, Duration::from_millis(20));
        assert_eq!(settings.scan.trigger_port, 1);
        assert_eq!(settings.axes[0].id, 1);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.axes.len(), 3);
        assert_eq!(settings.motion.position_retries, 5);
    }
}
