//! Configuration using Figment
//!
//! Settings are loaded from a TOML file and then overridden by environment
//! variables prefixed with `BENCH_DAQ_`. Nested keys are separated by a double
//! underscore:
//!
//! ```text
//! BENCH_DAQ_APPLICATION__LOG_LEVEL=debug
//! BENCH_DAQ_STORAGE__OUTPUT_DIR=/data/pulse
//! BENCH_DAQ_PLANS__SOFT_REST__CYCLE_COUNT=20
//! BENCH_DAQ_PROFILES__DRIVE_CYCLE__PROFILE=/data/profiles/udds.csv
//! ```
//!
//! # Example file
//!
//! ```toml
//! [application]
//! name = "Pack B bench"
//! log_level = "info"
//!
//! [storage]
//! output_dir = "results"
//!
//! [[instruments]]
//! id = "k2281s"
//! device = "keithley_2281s"
//! transport = { kind = "visa", resource = "USB0::0x05E6::0x2281::4587429::INSTR" }
//!
//! [plans.standard]
//! pulse_duration = "10m"
//! rest_duration = "10m"
//! cycle_count = 6
//! current_limit = 1.0
//! voltage_cutoff = 2.8
//! sample_interval = "1s"
//! ```

use crate::adapters::TransportConfig;
use crate::error::AppResult;
use crate::experiment::{CurrentProfilePlan, ModelExportPlan, TestPlan};
use crate::instrument::DeviceSpec;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench_daq.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "BENCH_DAQ_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read into [`Settings`].
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values were read but are inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Result file settings
    pub storage: StorageConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
    /// Pulse test plans by name
    #[serde(default)]
    pub plans: BTreeMap<String, TestPlan>,
    /// Model export plans by name
    #[serde(default)]
    pub model_exports: BTreeMap<String, ModelExportPlan>,
    /// Current profile runs by name
    #[serde(default)]
    pub profiles: BTreeMap<String, CurrentProfilePlan>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub log_json: bool,
    /// Instrument used when the command line does not name one
    #[serde(default)]
    pub default_instrument: Option<String>,
}

/// Result file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory result files are written to, created if missing
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Which command table and envelope an instrument uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSelection {
    /// Name of a built-in device, see [`DeviceSpec::preset_names`].
    Preset(String),
    /// Device described in the configuration file.
    Inline(DeviceSpec),
}

impl DeviceSelection {
    /// The selected device description.
    pub fn resolve(&self) -> Result<DeviceSpec, ConfigError> {
        match self {
            Self::Preset(name) => DeviceSpec::preset(name).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "Unknown device preset '{}'. Must be one of: {}",
                    name,
                    DeviceSpec::preset_names().join(", ")
                ))
            }),
            Self::Inline(spec) => Ok(spec.clone()),
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Device model
    pub device: DeviceSelection,
    /// How the instrument is reached
    pub transport: TransportConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument IDs are unique and every device and transport is usable
    /// - Every plan satisfies its own invariants
    /// - The default instrument, if set, exists
    ///
    /// Plans are checked against device envelopes when they are run, since a plan
    /// may be used with more than one instrument.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            let spec = instrument.device.resolve()?;
            spec.validate()
                .and_then(|()| instrument.transport.validate())
                .map_err(|e| invalid(&format!("instrument '{}'", instrument.id), e))?;
        }

        for (name, plan) in &self.plans {
            plan.validate()
                .map_err(|e| invalid(&format!("plan '{}'", name), e))?;
        }
        for (name, plan) in &self.model_exports {
            plan.validate()
                .map_err(|e| invalid(&format!("model export '{}'", name), e))?;
        }
        for (name, plan) in &self.profiles {
            plan.validate()
                .map_err(|e| invalid(&format!("profile '{}'", name), e))?;
        }

        if let Some(id) = &self.application.default_instrument {
            if self.instrument(id).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "default_instrument '{}' is not defined",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Instrument definition by id.
    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|i| i.id == id)
    }

    /// Instrument named `id`, or the default when `id` is `None`.
    ///
    /// With no default configured, a single defined instrument is used.
    pub fn select_instrument(&self, id: Option<&str>) -> Result<&InstrumentDefinition, ConfigError> {
        let wanted = id.or(self.application.default_instrument.as_deref());
        match (wanted, self.instruments.as_slice()) {
            (Some(id), _) => self.instrument(id).ok_or_else(|| {
                ConfigError::ValidationError(format!("Unknown instrument '{}'", id))
            }),
            (None, [only]) => Ok(only),
            (None, []) => Err(ConfigError::ValidationError(
                "No instruments are configured".to_string(),
            )),
            (None, _) => Err(ConfigError::ValidationError(
                "Several instruments are configured; choose one".to_string(),
            )),
        }
    }

    /// Pulse plan by name.
    pub fn plan(&self, name: &str) -> Result<&TestPlan, ConfigError> {
        self.plans.get(name).ok_or_else(|| {
            ConfigError::ValidationError(format!("Unknown plan '{}'", name))
        })
    }

    /// Model export plan by name.
    pub fn model_export(&self, name: &str) -> Result<&ModelExportPlan, ConfigError> {
        self.model_exports.get(name).ok_or_else(|| {
            ConfigError::ValidationError(format!("Unknown model export '{}'", name))
        })
    }

    /// Current profile run by name.
    pub fn profile(&self, name: &str) -> Result<&CurrentProfilePlan, ConfigError> {
        self.profiles.get(name).ok_or_else(|| {
            ConfigError::ValidationError(format!("Unknown profile '{}'", name))
        })
    }

    /// Resolve and validate the device of instrument `id`.
    pub fn device_spec(&self, id: &str) -> AppResult<DeviceSpec> {
        let definition = self
            .instrument(id)
            .ok_or_else(|| ConfigError::ValidationError(format!("Unknown instrument '{}'", id)))?;
        let spec = definition.device.resolve()?;
        spec.validate()?;
        Ok(spec)
    }
}

fn invalid(context: &str, err: crate::error::DaqError) -> ConfigError {
    ConfigError::ValidationError(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SocketConfig;
    use std::time::Duration;

    fn create_valid_config() -> Settings {
        Settings {
            application: ApplicationConfig {
                name: "Test bench".to_string(),
                log_level: "info".to_string(),
                log_json: false,
                default_instrument: None,
            },
            storage: StorageConfig {
                output_dir: PathBuf::from("results"),
            },
            instruments: vec![InstrumentDefinition {
                id: "k2281s".to_string(),
                device: DeviceSelection::Preset("keithley_2281s".to_string()),
                transport: TransportConfig::Socket(SocketConfig {
                    host: "192.168.1.50".to_string(),
                    port: 5025,
                    timeout: Duration::from_secs(15),
                }),
            }],
            plans: BTreeMap::from([("standard".to_string(), TestPlan::default())]),
            model_exports: BTreeMap::new(),
            profiles: BTreeMap::new(),
        }
    }

    #[test]
    fn test_config_validation_valid() {
        let config = create_valid_config();
        config.validate().unwrap();
        assert_eq!(config.select_instrument(None).unwrap().id, "k2281s");
        assert_eq!(config.device_spec("k2281s").unwrap().max_voltage, 20.0);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_instrument_ids() {
        let mut config = create_valid_config();
        let duplicate = config.instruments[0].clone();
        config.instruments.push(duplicate);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn test_unknown_preset() {
        let mut config = create_valid_config();
        config.instruments[0].device = DeviceSelection::Preset("hp_6632".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keithley_2281s"));
    }

    #[test]
    fn test_invalid_plan_named_in_error() {
        let mut config = create_valid_config();
        config.plans.insert(
            "broken".to_string(),
            TestPlan {
                cycle_count: 0,
                ..TestPlan::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("plan 'broken'"));
    }

    #[test]
    fn test_invalid_profile_named_in_error() {
        let mut config = create_valid_config();
        config.profiles.insert(
            "drive".to_string(),
            CurrentProfilePlan {
                profile: PathBuf::from("drive.csv"),
                mode: Default::default(),
                voltage: -1.0,
                voltage_protection: None,
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("profile 'drive'"));
        assert!(config.profile("missing").is_err());
    }

    #[test]
    fn test_instrument_selection() {
        let mut config = create_valid_config();
        let mut second = config.instruments[0].clone();
        second.id = "sgx".to_string();
        config.instruments.push(second);
        assert!(config.select_instrument(None).is_err());
        assert_eq!(config.select_instrument(Some("sgx")).unwrap().id, "sgx");

        config.application.default_instrument = Some("sgx".to_string());
        config.validate().unwrap();
        assert_eq!(config.select_instrument(None).unwrap().id, "sgx");

        config.application.default_instrument = Some("missing".to_string());
        assert!(config.validate().is_err());
    }
}
