//! Instrument control.
//!
//! [`Instrument`] turns semantic operations ("set output voltage to 4.2 V",
//! "measure current") into commands from a [`DeviceSpec`], validates every bounded
//! parameter against the device envelope before any I/O, and parses measurement
//! responses into [`Reading`]s.
//!
//! Measurement queries distinguish two failure kinds:
//!
//! - the instrument answered with text that is not a number: `Ok(Reading::Unavailable)`
//! - the round trip itself failed: `Err(DaqError)` with the transport error

pub mod codec;
pub mod device_spec;
pub mod session;

pub use codec::{Command, CommandTemplate, Reading, Unavailable};
pub use device_spec::{CombinedLayout, CommandKey, DeviceSpec};
pub use session::DeviceSession;

use crate::error::{AppResult, DaqError};
use crate::adapters::TransportChannel;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which output path the instrument is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Plain supply or load output.
    #[default]
    PowerSupply,
    /// Battery-test function with its own output and current-limit commands.
    BatteryTest,
}

/// Voltage and current taken at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Terminal voltage.
    pub voltage: Reading,
    /// Output current.
    pub current: Reading,
}

/// Validate that `value` lies in `[0, max]`.
fn validate_range(parameter: &str, value: f64, max: f64) -> AppResult<()> {
    if value.is_finite() && (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(DaqError::validation(parameter, value, 0.0, max))
    }
}

/// Controller for one instrument over an open session.
pub struct Instrument<T: TransportChannel> {
    session: DeviceSession<T>,
    spec: DeviceSpec,
    mode: OutputMode,
}

impl<T: TransportChannel> Instrument<T> {
    /// Drive `session` using the command table in `spec`.
    pub fn new(session: DeviceSession<T>, spec: DeviceSpec) -> Self {
        Self {
            session,
            spec,
            mode: OutputMode::PowerSupply,
        }
    }

    /// Device description.
    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Underlying session.
    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    /// Mutable access to the underlying session.
    pub fn session_mut(&mut self) -> &mut DeviceSession<T> {
        &mut self.session
    }

    /// Active output mode.
    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Give the session back, e.g. to close it explicitly.
    pub fn into_session(self) -> DeviceSession<T> {
        self.session
    }

    /// Whether the device implements `key`.
    pub fn supports(&self, key: CommandKey) -> bool {
        self.spec.supports(key)
    }

    fn send(&mut self, key: CommandKey, params: &[(&str, f64)]) -> AppResult<()> {
        let command = self.spec.require(key)?.render(params)?;
        self.session.write(&command)
    }

    fn ask(&mut self, key: CommandKey, params: &[(&str, f64)]) -> AppResult<String> {
        let command = self.spec.require(key)?.render(params)?;
        self.session.query(&command)
    }

    /// Send `key` if the device implements it; otherwise do nothing.
    fn send_if_supported(&mut self, key: CommandKey) -> AppResult<()> {
        if self.supports(key) {
            self.send(key, &[])
        } else {
            debug!(command = key.name(), device = %self.spec.name, "not supported, skipped");
            Ok(())
        }
    }

    /// Query the identification string.
    pub fn identify(&mut self) -> AppResult<String> {
        self.ask(CommandKey::Identify, &[])
    }

    /// Clear status registers, if supported.
    pub fn clear_status(&mut self) -> AppResult<()> {
        self.send_if_supported(CommandKey::Clear)
    }

    /// Reset the instrument.
    pub fn reset(&mut self) -> AppResult<()> {
        self.send(CommandKey::Reset, &[])
    }

    /// Take remote control, if supported.
    pub fn remote(&mut self) -> AppResult<()> {
        self.send_if_supported(CommandKey::Remote)
    }

    /// Return to front-panel control, if supported.
    pub fn local(&mut self) -> AppResult<()> {
        self.send_if_supported(CommandKey::Local)
    }

    /// Select the instrument function for `mode`.
    pub fn set_mode(&mut self, mode: OutputMode) -> AppResult<()> {
        match mode {
            OutputMode::PowerSupply => self.send_if_supported(CommandKey::SelectPowerMode)?,
            OutputMode::BatteryTest => self.send(CommandKey::SelectBatteryMode, &[])?,
        }
        self.mode = mode;
        Ok(())
    }

    /// Set the output voltage. Rejects values outside `[0, max_voltage]` without I/O.
    pub fn set_voltage(&mut self, volts: f64) -> AppResult<()> {
        validate_range("voltage", volts, self.spec.max_voltage)?;
        self.send(CommandKey::SetVoltage, &[("value", volts)])
    }

    /// Set the output current. Rejects values outside `[0, max_current]` without I/O.
    pub fn set_current(&mut self, amps: f64) -> AppResult<()> {
        validate_range("current", amps, self.spec.max_current)?;
        self.send(CommandKey::SetCurrent, &[("value", amps)])
    }

    /// Set the over-voltage protection threshold.
    pub fn set_voltage_protection(&mut self, volts: f64) -> AppResult<()> {
        validate_range("voltage protection", volts, self.spec.max_voltage)?;
        self.send(CommandKey::SetVoltageProtection, &[("value", volts)])
    }

    /// Set the current the pulse draws, through the active mode's command.
    pub fn set_pulse_current(&mut self, amps: f64) -> AppResult<()> {
        match self.mode {
            OutputMode::PowerSupply => self.set_current(amps),
            OutputMode::BatteryTest => self.set_battery_current_limit(amps),
        }
    }

    /// Battery-test current limit.
    pub fn set_battery_current_limit(&mut self, amps: f64) -> AppResult<()> {
        validate_range("battery current limit", amps, self.spec.max_current)?;
        self.send(CommandKey::BatteryCurrentLimit, &[("value", amps)])
    }

    /// Battery-test end current.
    pub fn set_battery_end_current(&mut self, amps: f64) -> AppResult<()> {
        validate_range("battery end current", amps, self.spec.max_current)?;
        self.send(CommandKey::BatteryEndCurrent, &[("value", amps)])
    }

    /// Battery-test end (cutoff) voltage.
    pub fn set_battery_end_voltage(&mut self, volts: f64) -> AppResult<()> {
        validate_range("battery end voltage", volts, self.spec.max_voltage)?;
        self.send(CommandKey::BatteryEndVoltage, &[("value", volts)])
    }

    /// Select the battery-test discharge profile.
    pub fn select_discharge(&mut self) -> AppResult<()> {
        self.send(CommandKey::BatteryDischargeMode, &[])
    }

    /// Clear the battery data buffer, if supported.
    pub fn clear_battery_buffer(&mut self) -> AppResult<()> {
        self.send_if_supported(CommandKey::ClearBatteryBuffer)
    }

    /// Energize the output of the active mode.
    pub fn output_on(&mut self) -> AppResult<()> {
        match self.mode {
            OutputMode::PowerSupply => self.send(CommandKey::OutputOn, &[]),
            OutputMode::BatteryTest => self.send(CommandKey::BatteryOutputOn, &[]),
        }
    }

    /// De-energize the output of the active mode.
    pub fn output_off(&mut self) -> AppResult<()> {
        match self.mode {
            OutputMode::PowerSupply => self.send(CommandKey::OutputOff, &[]),
            OutputMode::BatteryTest => self.send(CommandKey::BatteryOutputOff, &[]),
        }
    }

    /// Measure terminal voltage.
    pub fn measure_voltage(&mut self) -> AppResult<Reading> {
        self.ask(CommandKey::MeasureVoltage, &[])
            .map(|raw| codec::parse_scalar(&raw))
    }

    /// Measure output current.
    pub fn measure_current(&mut self) -> AppResult<Reading> {
        self.ask(CommandKey::MeasureCurrent, &[])
            .map(|raw| codec::parse_scalar(&raw))
    }

    /// Output power from voltage and current; unavailable unless both are.
    pub fn measure_power(&mut self) -> AppResult<Reading> {
        let sample = self.sample()?;
        Ok(sample.voltage.combine(&sample.current, |v, i| v * i))
    }

    /// Voltage and current, in one query when the device has a combined read.
    pub fn sample(&mut self) -> AppResult<Sample> {
        if let (Some(layout), true) = (
            self.spec.combined_layout,
            self.supports(CommandKey::MeasureCombined),
        ) {
            let raw = self.ask(CommandKey::MeasureCombined, &[])?;
            let needed = layout.current_index.max(layout.voltage_index) + 1;
            return Ok(match codec::parse_tuple(&raw, needed) {
                Ok(fields) => Sample {
                    voltage: Reading::Value(fields[layout.voltage_index]),
                    current: Reading::Value(fields[layout.current_index]),
                },
                Err(reason) => Sample {
                    voltage: Reading::Unavailable(reason.clone()),
                    current: Reading::Unavailable(reason),
                },
            });
        }

        let voltage = self.measure_voltage()?;
        let current = self.measure_current()?;
        Ok(Sample { voltage, current })
    }

    /// Operation-condition register, `None` if the response is not an integer.
    pub fn operation_condition(&mut self) -> AppResult<Option<u32>> {
        let raw = self.ask(CommandKey::OperationCondition, &[])?;
        Ok(codec::parse_register(&raw))
    }

    /// Whether a battery test or characterization is still running.
    ///
    /// An unparseable register counts as busy, so the caller keeps waiting until
    /// its own timeout.
    pub fn is_busy(&mut self) -> AppResult<bool> {
        match self.operation_condition()? {
            Some(bits) => Ok(bits & self.spec.busy_mask != 0),
            None => {
                warn!(instrument = %self.session.id(), "unreadable operation condition, treating as busy");
                Ok(true)
            }
        }
    }

    /// Block on `*OPC?` until pending operations finish.
    pub fn wait_operation_complete(&mut self) -> AppResult<()> {
        self.ask(CommandKey::OperationComplete, &[]).map(|_| ())
    }

    /// Number of points in the trace buffer.
    pub fn buffer_points(&mut self) -> AppResult<Reading> {
        self.ask(CommandKey::BufferPoints, &[])
            .map(|raw| codec::parse_scalar(&raw))
    }

    /// Configure and start a battery model characterization.
    pub fn start_model_characterization(
        &mut self,
        full_voltage: f64,
        current_limit: f64,
        esr_interval_s: u32,
    ) -> AppResult<()> {
        validate_range("model full voltage", full_voltage, self.spec.max_voltage)?;
        validate_range("model current limit", current_limit, self.spec.max_current)?;
        self.send(CommandKey::ModelFullVoltage, &[("value", full_voltage)])?;
        self.send(CommandKey::ModelCurrentLimit, &[("value", current_limit)])?;
        self.send(
            CommandKey::ModelEsrInterval,
            &[("seconds", f64::from(esr_interval_s))],
        )?;
        self.send(CommandKey::ModelStart, &[])
    }

    /// Set the model voltage range and save the model to `slot`.
    pub fn save_model(&mut self, min_voltage: f64, max_voltage: f64, slot: u8) -> AppResult<()> {
        validate_range("model range minimum", min_voltage, self.spec.max_voltage)?;
        validate_range("model range maximum", max_voltage, self.spec.max_voltage)?;
        self.send(
            CommandKey::ModelRange,
            &[("min", min_voltage), ("max", max_voltage)],
        )?;
        self.send(CommandKey::ModelSave, &[("slot", f64::from(slot))])
    }

    /// Read model row `row` from `slot` as `(open-circuit voltage, ESR)`.
    pub fn model_row(&mut self, slot: u8, row: u32) -> AppResult<Result<(f64, f64), Unavailable>> {
        let raw = self.ask(
            CommandKey::ModelRow,
            &[("slot", f64::from(slot)), ("row", f64::from(row))],
        )?;
        Ok(codec::parse_tuple(&raw, 2).map(|fields| (fields[0], fields[1])))
    }

    /// Best-effort return to a safe state: output off, then front-panel control.
    ///
    /// Every step is attempted even if an earlier one fails. Failures are logged and
    /// returned.
    pub fn restore_safe_state(&mut self) -> Vec<DaqError> {
        let mut steps: Vec<CommandKey> = Vec::new();
        if self.mode == OutputMode::BatteryTest {
            steps.push(CommandKey::BatteryOutputOff);
            steps.extend([CommandKey::BatteryTestStop, CommandKey::BatteryLoggingOff]);
        }
        steps.push(CommandKey::OutputOff);
        steps.push(CommandKey::Local);

        let mut failures = Vec::new();
        for key in steps {
            if !self.supports(key) {
                continue;
            }
            if let Err(err) = self.send(key, &[]) {
                warn!(
                    instrument = %self.session.id(),
                    step = key.name(),
                    error = %err,
                    "safe-state step failed"
                );
                failures.push(err);
            }
        }
        failures
    }
}
