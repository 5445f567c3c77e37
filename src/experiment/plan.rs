//! Test plans.
//!
//! Plans are plain data, usually loaded from the `[plans.<name>]` tables of the
//! configuration file. Durations use humantime strings (`"10m"`, `"500ms"`).

use crate::error::{AppResult, DaqError};
use crate::instrument::{DeviceSpec, OutputMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One step of a current ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampStep {
    /// Current held during the step, in amperes.
    pub current: f64,
    /// How long the step lasts.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// End the pulse phase on the instrument's completion bit instead of a fixed time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionPolicy {
    /// Idle time between status polls. A sample is taken on every poll.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound on the wait, past which the run fails.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Pulse/rest battery test definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// Output path to drive.
    #[serde(default)]
    pub mode: OutputMode,
    /// Output-on time per cycle.
    #[serde(with = "humantime_serde")]
    pub pulse_duration: Duration,
    /// Output-off time per cycle.
    #[serde(with = "humantime_serde")]
    pub rest_duration: Duration,
    /// Number of pulse/rest cycles.
    pub cycle_count: u32,
    /// Pulse current in amperes.
    pub current_limit: f64,
    /// Supply voltage setpoint, or the discharge end voltage in battery-test mode.
    pub voltage_cutoff: f64,
    /// Time between samples.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Optional over-voltage protection threshold.
    #[serde(default)]
    pub voltage_protection: Option<f64>,
    /// Battery-test current limit applied while resting.
    #[serde(default)]
    pub rest_current: Option<f64>,
    /// Steps run before each pulse.
    #[serde(default)]
    pub ramp_up: Vec<RampStep>,
    /// Steps run after each pulse.
    #[serde(default)]
    pub ramp_down: Vec<RampStep>,
    /// Completion-bit wait replacing the fixed pulse duration.
    #[serde(default)]
    pub completion: Option<CompletionPolicy>,
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            mode: OutputMode::PowerSupply,
            pulse_duration: Duration::from_secs(10),
            rest_duration: Duration::from_secs(10),
            cycle_count: 1,
            current_limit: 1.0,
            voltage_cutoff: 3.0,
            sample_interval: Duration::from_secs(1),
            voltage_protection: None,
            rest_current: None,
            ramp_up: Vec::new(),
            ramp_down: Vec::new(),
            completion: None,
        }
    }
}

impl TestPlan {
    /// Check the plan's own invariants.
    pub fn validate(&self) -> AppResult<()> {
        if self.cycle_count < 1 {
            return Err(DaqError::Configuration(
                "cycle_count must be at least 1".to_string(),
            ));
        }
        if self.pulse_duration.is_zero()
            && self.rest_duration.is_zero()
            && self.completion.is_none()
        {
            return Err(DaqError::Configuration(
                "pulse_duration and rest_duration cannot both be zero".to_string(),
            ));
        }
        if !self.pulse_duration.is_zero()
            && !self.rest_duration.is_zero()
            && self.sample_interval > self.pulse_duration.min(self.rest_duration)
        {
            return Err(DaqError::Configuration(format!(
                "sample_interval {:?} exceeds the shorter of pulse and rest ({:?})",
                self.sample_interval,
                self.pulse_duration.min(self.rest_duration)
            )));
        }
        for (what, value) in [
            ("current_limit", Some(self.current_limit)),
            ("voltage_cutoff", Some(self.voltage_cutoff)),
            ("voltage_protection", self.voltage_protection),
            ("rest_current", self.rest_current),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(DaqError::Configuration(format!(
                        "{} must be a non-negative number, got {}",
                        what, v
                    )));
                }
            }
        }
        if let Some(policy) = &self.completion {
            if policy.poll_interval.is_zero() || policy.timeout.is_zero() {
                return Err(DaqError::Configuration(
                    "completion poll_interval and timeout must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Check every current and voltage against the device envelope.
    pub fn check_envelope(&self, spec: &DeviceSpec) -> AppResult<()> {
        let check = |what: &str, value: f64, max: f64| {
            if value.is_finite() && (0.0..=max).contains(&value) {
                Ok(())
            } else {
                Err(DaqError::validation(what, value, 0.0, max))
            }
        };

        check("current_limit", self.current_limit, spec.max_current)?;
        check("voltage_cutoff", self.voltage_cutoff, spec.max_voltage)?;
        if let Some(v) = self.voltage_protection {
            check("voltage_protection", v, spec.max_voltage)?;
        }
        if let Some(i) = self.rest_current {
            check("rest_current", i, spec.max_current)?;
        }
        for step in self.ramp_up.iter().chain(&self.ramp_down) {
            check("ramp current", step.current, spec.max_current)?;
        }
        Ok(())
    }

    /// Nominal run time, ignoring completion waits.
    pub fn nominal_duration(&self) -> Duration {
        let ramps: Duration = self
            .ramp_up
            .iter()
            .chain(&self.ramp_down)
            .map(|s| s.duration)
            .sum();
        (self.pulse_duration + self.rest_duration + ramps) * self.cycle_count
    }
}

/// Discharge run before a model characterization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DischargeSettings {
    /// Discharge end voltage.
    pub end_voltage: f64,
    /// Discharge end current.
    pub end_current: f64,
}

/// Battery model characterization and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelExportPlan {
    /// Internal model slot, 1 to 9.
    pub slot: u8,
    /// Discharge the cell first.
    #[serde(default)]
    pub discharge: Option<DischargeSettings>,
    /// Full-charge voltage for the characterization.
    pub full_voltage: f64,
    /// Characterization current limit.
    pub current_limit: f64,
    /// ESR measurement interval in seconds.
    #[serde(default = "default_esr_interval")]
    pub esr_interval_s: u32,
    /// Lower bound of the saved model's voltage range.
    pub model_min_voltage: f64,
    /// Upper bound of the saved model's voltage range.
    pub model_max_voltage: f64,
    /// Idle time between status polls.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bound on each completion wait.
    #[serde(default = "default_completion_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Number of rows to export; read from the instrument when absent.
    #[serde(default)]
    pub rows: Option<u32>,
}

fn default_esr_interval() -> u32 {
    30
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_completion_timeout() -> Duration {
    Duration::from_secs(8 * 3600)
}

impl ModelExportPlan {
    /// Check the plan's own invariants.
    pub fn validate(&self) -> AppResult<()> {
        if !(1..=9).contains(&self.slot) {
            return Err(DaqError::Configuration(format!(
                "model slot must be 1-9, got {}",
                self.slot
            )));
        }
        let finite = self.model_min_voltage.is_finite() && self.model_max_voltage.is_finite();
        if !finite || self.model_min_voltage >= self.model_max_voltage {
            return Err(DaqError::Configuration(format!(
                "model range {}..{} is empty",
                self.model_min_voltage, self.model_max_voltage
            )));
        }
        if self.esr_interval_s == 0 {
            return Err(DaqError::Configuration(
                "esr_interval_s must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.timeout.is_zero() {
            return Err(DaqError::Configuration(
                "poll_interval and timeout must be greater than zero".to_string(),
            ));
        }
        if matches!(self.rows, Some(n) if n < 2) {
            return Err(DaqError::Configuration(
                "rows must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Check every voltage and current against the device envelope.
    pub fn check_envelope(&self, spec: &DeviceSpec) -> AppResult<()> {
        let voltages = [
            ("full_voltage", self.full_voltage),
            ("model_min_voltage", self.model_min_voltage),
            ("model_max_voltage", self.model_max_voltage),
        ];
        let discharge = self.discharge.map(|d| (d.end_voltage, d.end_current));

        for (what, value) in voltages
            .into_iter()
            .chain(discharge.map(|(v, _)| ("discharge end_voltage", v)))
        {
            if !value.is_finite() || !(0.0..=spec.max_voltage).contains(&value) {
                return Err(DaqError::validation(what, value, 0.0, spec.max_voltage));
            }
        }
        for (what, value) in std::iter::once(("current_limit", self.current_limit))
            .chain(discharge.map(|(_, i)| ("discharge end_current", i)))
        {
            if !value.is_finite() || !(0.0..=spec.max_current).contains(&value) {
                return Err(DaqError::validation(what, value, 0.0, spec.max_current));
            }
        }
        Ok(())
    }
}

/// Current profile replayed from a `time_s,current_a` CSV file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentProfilePlan {
    /// Profile file.
    pub profile: PathBuf,
    /// Output path to drive.
    #[serde(default)]
    pub mode: OutputMode,
    /// Supply voltage setpoint, or the discharge end voltage in battery-test mode.
    pub voltage: f64,
    /// Optional over-voltage protection threshold.
    #[serde(default)]
    pub voltage_protection: Option<f64>,
}

impl CurrentProfilePlan {
    /// Check the plan's own invariants. The profile file is read when the run starts.
    pub fn validate(&self) -> AppResult<()> {
        if self.profile.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "profile file must not be empty".to_string(),
            ));
        }
        for (what, value) in [
            ("voltage", Some(self.voltage)),
            ("voltage_protection", self.voltage_protection),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(DaqError::Configuration(format!(
                        "{} must be a non-negative number, got {}",
                        what, v
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check the voltage settings against the device envelope.
    pub fn check_envelope(&self, spec: &DeviceSpec) -> AppResult<()> {
        for (what, value) in std::iter::once(("voltage", self.voltage))
            .chain(self.voltage_protection.map(|v| ("voltage_protection", v)))
        {
            if !value.is_finite() || !(0.0..=spec.max_voltage).contains(&value) {
                return Err(DaqError::validation(what, value, 0.0, spec.max_voltage));
            }
        }
        Ok(())
    }
}
