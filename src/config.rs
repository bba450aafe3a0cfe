//! Configuration using Figment
//!
//! Strongly-typed configuration for the pipettor engine. Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/pipettor.toml` by default)
//! 2. environment variables prefixed with `PIPETTOR_`, nested with `__`
//!
//! Every field has a default, so a missing file yields a working single-channel setup.
//!
//! # Example
//! ```no_run
//! use pipettor_plus::config::PipettorConfig;
//!
//! let config = PipettorConfig::load()?;
//! println!("Tip capacity: {} µl", config.tip_capacity());
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! Environment override: `PIPETTOR_PLANNING__MAX_BATCH_SIZE=3`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::hardware::{MovementSpeed, PistonSpeed};
use crate::validation::{is_in_range, is_not_empty};

/// Channels on a multi-channel head.
pub const CHANNELS_IN_MULTI: usize = 8;
/// Default upper bound on targets served by one bulk aspirate or dispense.
pub const MAX_BATCH_SIZE: usize = 5;
/// Lowest reachable Z position, mm.
pub const Z_MAX: f64 = 103.0;
/// Supported tip volumes, µl.
pub const TIP_VOLUMES: [f64; 2] = [200.0, 1000.0];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipettorConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Pipettor head settings
    #[serde(default)]
    pub pipettor: PipettorSettings,
    /// Default actuator speeds applied at connection time
    #[serde(default)]
    pub speeds: SpeedSettings,
    /// Planner limits
    #[serde(default)]
    pub planning: PlanningSettings,
    /// Device driver settings
    #[serde(default)]
    pub driver: DriverSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Pipettor head configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipettorSettings {
    /// Tip volume in µl (200 or 1000)
    #[serde(default = "default_tip_volume")]
    pub tip_volume: f64,
    /// Multi-channel head
    #[serde(default)]
    pub multichannel: bool,
    /// Channels on a multi-channel head
    #[serde(default = "default_channels_in_multi")]
    pub channels_in_multi: usize,
    /// Tip length override in mm; derived from the tip volume when absent
    #[serde(default)]
    pub tip_length: Option<f64>,
    /// Lowest reachable Z, mm
    #[serde(default = "default_z_max")]
    pub z_max: f64,
    /// Approach aspirate targets with liquid-surface detection (single-channel only)
    #[serde(default)]
    pub surface_detection: bool,
    /// Distance kept above a detected surface, mm
    #[serde(default = "default_surface_distance")]
    pub surface_distance: f64,
}

/// Actuator speed defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedSettings {
    /// X speed (1-9)
    #[serde(default = "default_xy_speed")]
    pub x: u8,
    /// Y speed (1-9)
    #[serde(default = "default_xy_speed")]
    pub y: u8,
    /// Z speed (1-9)
    #[serde(default = "default_z_speed")]
    pub z: u8,
    /// Piston inward speed (1-6)
    #[serde(default = "default_piston_speed")]
    pub aspirate: u8,
    /// Piston outward speed (1-6)
    #[serde(default = "default_piston_speed")]
    pub dispense: u8,
}

/// Planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningSettings {
    /// Default batch limit for new operations
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "pipettor-plus".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_tip_volume() -> f64 {
    1000.0
}

fn default_channels_in_multi() -> usize {
    CHANNELS_IN_MULTI
}

fn default_z_max() -> f64 {
    Z_MAX
}

fn default_surface_distance() -> f64 {
    2.0
}

fn default_xy_speed() -> u8 {
    MovementSpeed::DEFAULT_XY.get()
}

fn default_z_speed() -> u8 {
    MovementSpeed::DEFAULT_Z.get()
}

fn default_piston_speed() -> u8 {
    PistonSpeed::DEFAULT.get()
}

fn default_max_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_command_timeout() -> u64 {
    30_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for PipettorSettings {
    fn default() -> Self {
        Self {
            tip_volume: default_tip_volume(),
            multichannel: false,
            channels_in_multi: default_channels_in_multi(),
            tip_length: None,
            z_max: default_z_max(),
            surface_detection: false,
            surface_distance: default_surface_distance(),
        }
    }
}

impl Default for SpeedSettings {
    fn default() -> Self {
        Self {
            x: default_xy_speed(),
            y: default_xy_speed(),
            z: default_z_speed(),
            aspirate: default_piston_speed(),
            dispense: default_piston_speed(),
        }
    }
}

impl Default for PlanningSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl PipettorConfig {
    /// Load configuration from config/pipettor.toml and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/pipettor.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(PipettorConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIPETTOR_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        is_not_empty(&self.application.name).map_err(|e| format!("application.name {e}"))?;

        let pipettor = &self.pipettor;
        if !TIP_VOLUMES.contains(&pipettor.tip_volume) {
            return Err(format!(
                "Invalid tip_volume {}. Must be 200 or 1000",
                pipettor.tip_volume
            ));
        }
        if pipettor.multichannel && pipettor.tip_volume != 1000.0 {
            return Err("Multi-channel heads only take 1000 µl tips".to_string());
        }
        if pipettor.multichannel && pipettor.channels_in_multi < 2 {
            return Err(format!(
                "Invalid channels_in_multi {}. A multi-channel head has at least 2 channels",
                pipettor.channels_in_multi
            ));
        }
        if pipettor.multichannel && pipettor.surface_detection {
            return Err("Surface detection needs a tip sensor, single-channel only".to_string());
        }
        if pipettor.z_max <= 0.0 {
            return Err(format!("Invalid z_max {}. Must be positive", pipettor.z_max));
        }
        if let Some(length) = pipettor.tip_length {
            if length < 0.0 {
                return Err(format!("Invalid tip_length {length}. Must not be negative"));
            }
        }

        for (axis, speed) in [
            ("x", self.speeds.x),
            ("y", self.speeds.y),
            ("z", self.speeds.z),
        ] {
            is_in_range(speed, MovementSpeed::MIN..=MovementSpeed::MAX)
                .map_err(|e| format!("speeds.{axis} {e}"))?;
        }
        for (direction, speed) in [
            ("aspirate", self.speeds.aspirate),
            ("dispense", self.speeds.dispense),
        ] {
            is_in_range(speed, PistonSpeed::MIN..=PistonSpeed::MAX)
                .map_err(|e| format!("speeds.{direction} {e}"))?;
        }

        if self.planning.max_batch_size == 0 {
            return Err("planning.max_batch_size must be at least 1".to_string());
        }
        if self.driver.command_timeout_ms == 0 {
            return Err("driver.command_timeout_ms must be positive".to_string());
        }

        Ok(())
    }

    /// Channels driven in lock-step.
    pub fn channel_count(&self) -> usize {
        if self.pipettor.multichannel {
            self.pipettor.channels_in_multi
        } else {
            1
        }
    }

    /// Per-tip capacity in µl.
    pub fn tip_capacity(&self) -> f64 {
        self.pipettor.tip_volume
    }

    /// Tip length in mm: the override, or the standard length for the tip volume.
    pub fn tip_length(&self) -> f64 {
        self.pipettor
            .tip_length
            .unwrap_or(if self.pipettor.tip_volume <= 200.0 { 38.0 } else { 90.0 })
    }

    /// Piston motor steps per µl for the configured head and tip.
    pub fn steps_per_ul(&self) -> f64 {
        if self.pipettor.multichannel {
            0.2
        } else if self.pipettor.tip_volume <= 200.0 {
            2.0
        } else {
            0.4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = PipettorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_count(), 1);
        assert_eq!(config.tip_capacity(), 1000.0);
        assert_eq!(config.tip_length(), 90.0);
        assert_eq!(config.planning.max_batch_size, 5);
    }

    #[test]
    fn rejects_multichannel_small_tips() {
        let mut config = PipettorConfig::default();
        config.pipettor.multichannel = true;
        config.pipettor.tip_volume = 200.0;
        assert!(config.validate().unwrap_err().contains("1000"));
    }

    #[test]
    fn rejects_out_of_range_speeds() {
        let mut config = PipettorConfig::default();
        config.speeds.aspirate = 7;
        assert!(config.validate().unwrap_err().contains("speeds.aspirate"));

        let mut config = PipettorConfig::default();
        config.speeds.z = 0;
        assert!(config.validate().unwrap_err().contains("speeds.z"));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = PipettorConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_values_follow_tip_and_head() {
        let mut config = PipettorConfig::default();
        config.pipettor.tip_volume = 200.0;
        assert_eq!(config.tip_length(), 38.0);
        assert_eq!(config.steps_per_ul(), 2.0);

        config.pipettor.tip_volume = 1000.0;
        config.pipettor.multichannel = true;
        assert_eq!(config.channel_count(), 8);
        assert_eq!(config.steps_per_ul(), 0.2);

        config.pipettor.tip_length = Some(80.0);
        assert_eq!(config.tip_length(), 80.0);
    }

    #[test]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pipettor]\ntip_volume = 200.0\n\n[planning]\nmax_batch_size = 3"
        )
        .unwrap();

        let config = PipettorConfig::load_from(file.path()).unwrap();
        assert_eq!(config.pipettor.tip_volume, 200.0);
        assert_eq!(config.planning.max_batch_size, 3);
        assert_eq!(config.speeds.x, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bundled_file_sets_only_known_keys() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pipettor.toml");
        let bundled: toml::Table = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let config = PipettorConfig::load_from(&path).unwrap();
        assert!(config.validate().is_ok());

        let known = toml::Value::try_from(&config).unwrap();
        for (section, values) in &bundled {
            for key in values.as_table().unwrap().keys() {
                assert!(
                    known[section.as_str()].get(key).is_some(),
                    "unknown key {section}.{key}"
                );
            }
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = PipettorConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.application.name, "pipettor-plus");
    }
}
