//! Configuration system using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (calibrated values from the bench)
//! 2. `sdl.toml` (or the file passed with `--config`)
//! 3. Environment variables prefixed with `SDL_`, nested keys split on `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SDL_APPLICATION__LOG_LEVEL=debug
//! SDL_APPLICATION__MOCK_HARDWARE=true
//! SDL_SCHEDULER__SELECTION=random
//! SDL_DATABASE__PATH=/var/lib/sdl/lab.db
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sdl_core::config::Config;
//!
//! let config = Config::load(None).unwrap();
//! println!("Pipette capacity: {} uL", config.pipetting.pipette_capacity_ul);
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SdlError, SdlResult};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "sdl.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub application: ApplicationConfig,
    /// Database location
    pub database: DatabaseConfig,
    /// Queue selection and control loop timing
    pub scheduler: SchedulerConfig,
    /// Liquid handling constants
    pub pipetting: PipettingConfig,
    /// Confirmed-actuation retry policy
    pub retry: RetryConfig,
    /// Open-circuit-potential pre-check thresholds
    pub ocp: OcpConfig,
    /// Mixing solver draw bounds
    pub mixing: MixingConfig,
    /// Resource alarm thresholds
    pub resources: ResourcesConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Directory for data files and images
    pub data_dir: PathBuf,
    /// Run against simulated hardware
    pub mock_hardware: bool,
}

/// Output format for the log subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, ANSI coloured
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
}

/// How ties between equal-priority queued experiments are broken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Lowest experiment id wins
    #[default]
    LowestId,
    /// Uniformly random among the tied set
    Random,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tie-break policy
    pub selection: Selection,
    /// Control channel poll interval while waiting for work
    pub poll_interval_ms: u64,
    /// How long to wait for new queue entries before re-checking
    pub wait_window_secs: u64,
    /// Number of experiments in an active-learning campaign
    pub campaign_length: Option<u32>,
    /// Priority assigned to experiments deferred for lack of resources
    pub deferred_priority: i64,
    /// Run a single experiment and exit
    pub one_off: bool,
}

/// Pipetting constants (all volumes in microliters)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipettingConfig {
    /// Pipette tip capacity
    pub pipette_capacity_ul: f64,
    /// Air drawn before liquid to separate it from the plunger
    pub air_gap_ul: f64,
    /// Air drawn after liquid so the tip does not drip in transit
    pub drip_stop_ul: f64,
    /// Extra air drawn when emptying a well
    pub well_extra_withdraw_ul: f64,
    /// Travel height between vessels
    pub safe_z: f64,
    /// Feed rate for gantry moves (mm/min)
    pub feed_rate: f64,
}

/// Retry policy for sensor-confirmed actuations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before reporting failure
    pub max_attempts: u32,
    /// Settle delay between attempts
    pub settle_delay_ms: u64,
    /// Whether the decapper line-break sensor is fitted
    pub sensor_available: bool,
}

/// OCP height-correction thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OcpConfig {
    /// Below this magnitude (V) the electrodes are assumed shorted
    pub short_threshold_v: f64,
    /// Above this magnitude (V) the electrode is assumed out of solution
    pub open_threshold_v: f64,
    /// Electrode raise per retry (mm)
    pub raise_increment_mm: f64,
    /// Electrode raises before a persistent short is fatal
    pub max_raises: u32,
    /// Electrode tip height above the well floor for measurements (mm)
    pub electrode_offset_mm: f64,
}

/// Mixing solver bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixingConfig {
    /// Smallest pipettable draw from a used vial
    pub min_draw_ul: f64,
    /// Largest draw from a single vial
    pub max_draw_ul: f64,
}

/// Resource alarm thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Stock vials below this volume trigger an operator alert
    pub low_stock_ul: f64,
    /// Fraction of stock capacity never handed out by the selector
    pub stock_reserve_fraction: f64,
    /// Decapper lift height after gripping a cap (mm)
    pub decap_lift_mm: f64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sdl".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            data_dir: PathBuf::from("data"),
            mock_hardware: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sdl.db"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            selection: Selection::LowestId,
            poll_interval_ms: 1000,
            wait_window_secs: 60,
            campaign_length: None,
            deferred_priority: 999,
            one_off: false,
        }
    }
}

impl Default for PipettingConfig {
    fn default() -> Self {
        Self {
            pipette_capacity_ul: 200.0,
            air_gap_ul: 40.0,
            drip_stop_ul: 5.0,
            well_extra_withdraw_ul: 20.0,
            safe_z: 0.0,
            feed_rate: 2000.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay_ms: 500,
            sensor_available: true,
        }
    }
}

impl Default for OcpConfig {
    fn default() -> Self {
        Self {
            short_threshold_v: 0.001,
            open_threshold_v: 1.0,
            raise_increment_mm: 0.5,
            max_raises: 3,
            electrode_offset_mm: 1.0,
        }
    }
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            min_draw_ul: 20.0,
            max_draw_ul: 120.0,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            low_stock_ul: 1000.0,
            stock_reserve_fraction: 0.10,
            decap_lift_mm: 20.0,
        }
    }
}

impl SchedulerConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Wait window as a `Duration`.
    pub fn wait_window(&self) -> Duration {
        Duration::from_secs(self.wait_window_secs)
    }
}

impl RetryConfig {
    /// Settle delay as a `Duration`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Config {
    /// Build the layered figment. Exposed so callers can add providers.
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("SDL_").split("__"))
    }

    /// Load and validate configuration.
    pub fn load(path: Option<&Path>) -> SdlResult<Self> {
        let config: Config = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that are parseable but physically meaningless.
    pub fn validate(&self) -> SdlResult<()> {
        let p = &self.pipetting;
        if p.pipette_capacity_ul <= 0.0 {
            return Err(SdlError::Configuration(
                "pipetting.pipette_capacity_ul must be positive".into(),
            ));
        }
        if p.drip_stop_ul < 0.0 || p.air_gap_ul < 0.0 {
            return Err(SdlError::Configuration(
                "air gap and drip stop volumes cannot be negative".into(),
            ));
        }
        if p.drip_stop_ul + p.air_gap_ul >= p.pipette_capacity_ul {
            return Err(SdlError::Configuration(format!(
                "air gap and drip stop ({} uL) leave no room in a {} uL pipette",
                p.drip_stop_ul + p.air_gap_ul,
                p.pipette_capacity_ul
            )));
        }
        if self.mixing.min_draw_ul < 0.0 || self.mixing.min_draw_ul > self.mixing.max_draw_ul {
            return Err(SdlError::Configuration(format!(
                "mixing bounds are inverted: min {} > max {}",
                self.mixing.min_draw_ul, self.mixing.max_draw_ul
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(SdlError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.ocp.max_raises == 0 {
            return Err(SdlError::Configuration(
                "ocp.max_raises must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.resources.stock_reserve_fraction) {
            return Err(SdlError::Configuration(
                "resources.stock_reserve_fraction must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mixing.min_draw_ul, 20.0);
        assert_eq!(config.mixing.max_draw_ul, 120.0);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.scheduler.selection, Selection::LowestId);
    }

    #[test]
    #[serial]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sdl.toml",
                r#"
                [application]
                name = "bench"
                mock_hardware = true

                [scheduler]
                selection = "random"
                campaign_length = 4

                [pipetting]
                air_gap_ul = 25.0
                "#,
            )?;
            jail.set_env("SDL_APPLICATION__LOG_LEVEL", "debug");
            jail.set_env("SDL_RETRY__MAX_ATTEMPTS", "3");

            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.application.name, "bench");
            assert!(config.application.mock_hardware);
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.scheduler.selection, Selection::Random);
            assert_eq!(config.scheduler.campaign_length, Some(4));
            assert_eq!(config.pipetting.air_gap_ul, 25.0);
            assert_eq!(config.pipetting.drip_stop_ul, 5.0);
            assert_eq!(config.retry.max_attempts, 3);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_inverted_mix_bounds() {
        let mut config = Config::default();
        config.mixing.min_draw_ul = 150.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }

    #[test]
    fn test_validation_rejects_drip_stop_over_capacity() {
        let mut config = Config::default();
        config.pipetting.drip_stop_ul = 500.0;
        assert!(config.validate().is_err());
    }
}
