//! Device descriptions: operating envelope plus named command templates.
//!
//! A [`DeviceSpec`] is what the controller needs to drive one instrument model.
//! Built-in presets cover the bench instruments this crate ships with; any other
//! model is described inline in the configuration file.

use super::codec::CommandTemplate;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semantic operations a device may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKey {
    /// `*IDN?`
    Identify,
    /// Clear status and error queue.
    Clear,
    /// Reset to power-on defaults.
    Reset,
    /// Lock the front panel.
    Remote,
    /// Return to front-panel control.
    Local,
    /// Select the plain supply / load function.
    SelectPowerMode,
    /// Select the battery-test function.
    SelectBatteryMode,
    /// Output voltage setpoint, `{value}` in volts.
    SetVoltage,
    /// Output current setpoint, `{value}` in amperes.
    SetCurrent,
    /// Over-voltage protection threshold, `{value}` in volts.
    SetVoltageProtection,
    /// Energize the output.
    OutputOn,
    /// De-energize the output.
    OutputOff,
    /// Energize the output in battery-test mode.
    BatteryOutputOn,
    /// De-energize the output in battery-test mode.
    BatteryOutputOff,
    /// Measure output voltage.
    MeasureVoltage,
    /// Measure output current.
    MeasureCurrent,
    /// Single query returning current and voltage together.
    MeasureCombined,
    /// Battery-test discharge mode.
    BatteryDischargeMode,
    /// Battery-test current limit, `{value}` in amperes.
    BatteryCurrentLimit,
    /// Battery-test end current, `{value}` in amperes.
    BatteryEndCurrent,
    /// Battery-test end voltage, `{value}` in volts.
    BatteryEndVoltage,
    /// Stop a running battery test.
    BatteryTestStop,
    /// Stop battery data logging.
    BatteryLoggingOff,
    /// Clear the battery data buffer.
    ClearBatteryBuffer,
    /// Operation condition status register.
    OperationCondition,
    /// `*OPC?`
    OperationComplete,
    /// Model characterization full-charge voltage, `{value}`.
    ModelFullVoltage,
    /// Model characterization current limit, `{value}`.
    ModelCurrentLimit,
    /// Model characterization ESR interval, `{seconds}`.
    ModelEsrInterval,
    /// Start model characterization.
    ModelStart,
    /// Model voltage range, `{min}` and `{max}`.
    ModelRange,
    /// Save model to internal slot `{slot}`.
    ModelSave,
    /// Number of points in the trace buffer.
    BufferPoints,
    /// Read model row `{row}` from slot `{slot}`.
    ModelRow,
}

impl CommandKey {
    /// Configuration name of the key.
    pub fn name(self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::Clear => "clear",
            Self::Reset => "reset",
            Self::Remote => "remote",
            Self::Local => "local",
            Self::SelectPowerMode => "select_power_mode",
            Self::SelectBatteryMode => "select_battery_mode",
            Self::SetVoltage => "set_voltage",
            Self::SetCurrent => "set_current",
            Self::SetVoltageProtection => "set_voltage_protection",
            Self::OutputOn => "output_on",
            Self::OutputOff => "output_off",
            Self::BatteryOutputOn => "battery_output_on",
            Self::BatteryOutputOff => "battery_output_off",
            Self::MeasureVoltage => "measure_voltage",
            Self::MeasureCurrent => "measure_current",
            Self::MeasureCombined => "measure_combined",
            Self::BatteryDischargeMode => "battery_discharge_mode",
            Self::BatteryCurrentLimit => "battery_current_limit",
            Self::BatteryEndCurrent => "battery_end_current",
            Self::BatteryEndVoltage => "battery_end_voltage",
            Self::BatteryTestStop => "battery_test_stop",
            Self::BatteryLoggingOff => "battery_logging_off",
            Self::ClearBatteryBuffer => "clear_battery_buffer",
            Self::OperationCondition => "operation_condition",
            Self::OperationComplete => "operation_complete",
            Self::ModelFullVoltage => "model_full_voltage",
            Self::ModelCurrentLimit => "model_current_limit",
            Self::ModelEsrInterval => "model_esr_interval",
            Self::ModelStart => "model_start",
            Self::ModelRange => "model_range",
            Self::ModelSave => "model_save",
            Self::BufferPoints => "buffer_points",
            Self::ModelRow => "model_row",
        }
    }
}

/// Field positions in a combined-read response such as `"curr,volt,rel"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedLayout {
    /// Index of the current field.
    pub current_index: usize,
    /// Index of the voltage field.
    pub voltage_index: usize,
}

/// Operating envelope and command table for one instrument model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Model name used in logs.
    pub name: String,
    /// Maximum output voltage in volts.
    pub max_voltage: f64,
    /// Maximum output current in amperes.
    pub max_current: f64,
    /// Maximum output power in watts.
    pub max_power: f64,
    /// Command templates by operation.
    #[serde(default)]
    pub commands: BTreeMap<CommandKey, String>,
    /// Layout of the `measure_combined` response, if the device has one.
    #[serde(default)]
    pub combined_layout: Option<CombinedLayout>,
    /// Operation-condition bits that mean a measurement is still running.
    #[serde(default = "default_busy_mask")]
    pub busy_mask: u32,
}

fn default_busy_mask() -> u32 {
    0x10
}

impl DeviceSpec {
    /// Template for `key`, if the device implements it.
    pub fn template(&self, key: CommandKey) -> Option<CommandTemplate> {
        self.commands.get(&key).map(|t| CommandTemplate::new(t.as_str()))
    }

    /// Whether the device implements `key`.
    pub fn supports(&self, key: CommandKey) -> bool {
        self.commands.contains_key(&key)
    }

    /// Template for `key`, or a configuration error naming the device.
    pub fn require(&self, key: CommandKey) -> AppResult<CommandTemplate> {
        self.template(key).ok_or_else(|| {
            DaqError::Configuration(format!(
                "device '{}' has no '{}' command",
                self.name,
                key.name()
            ))
        })
    }

    /// Check the envelope and the command table.
    pub fn validate(&self) -> AppResult<()> {
        for (what, value) in [
            ("max_voltage", self.max_voltage),
            ("max_current", self.max_current),
            ("max_power", self.max_power),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "device '{}': {} must be positive, got {}",
                    self.name, what, value
                )));
            }
        }
        if self.supports(CommandKey::MeasureCombined) && self.combined_layout.is_none() {
            return Err(DaqError::Configuration(format!(
                "device '{}': measure_combined requires combined_layout",
                self.name
            )));
        }
        for key in [CommandKey::OutputOn, CommandKey::OutputOff] {
            self.require(key)?;
        }
        Ok(())
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "keithley_2281s" => Some(Self::keithley_2281s()),
            "sorensen_sgx400_12" => Some(Self::sorensen_sgx400_12()),
            "prodigit_34205a" => Some(Self::prodigit_34205a()),
            _ => None,
        }
    }

    /// Names accepted by [`DeviceSpec::preset`].
    pub fn preset_names() -> &'static [&'static str] {
        &["keithley_2281s", "sorensen_sgx400_12", "prodigit_34205a"]
    }

    /// Keithley 2281S-20-6 battery simulator / precision supply.
    pub fn keithley_2281s() -> Self {
        use CommandKey::*;
        Self {
            name: "Keithley 2281S-20-6".to_string(),
            max_voltage: 20.0,
            max_current: 6.0,
            max_power: 120.0,
            commands: table(&[
                (Identify, "*IDN?"),
                (Clear, "*CLS"),
                (Reset, "*RST"),
                (Remote, "SYST:REM"),
                (Local, "SYST:LOC"),
                (SelectPowerMode, ":ENTRy:FUNC POWer"),
                (SelectBatteryMode, ":ENTRy:FUNC TEST"),
                (SetVoltage, ":SOUR:VOLT {value}"),
                (SetCurrent, ":SOUR:CURR {value}"),
                (SetVoltageProtection, ":VOLT:PROT {value}"),
                (OutputOn, ":OUTP ON"),
                (OutputOff, ":OUTP OFF"),
                (BatteryOutputOn, ":BATT:OUTP ON"),
                (BatteryOutputOff, ":BATT:OUTP OFF"),
                (MeasureVoltage, ":MEAS:VOLT?"),
                (MeasureCurrent, ":MEAS:CURR?"),
                (MeasureCombined, ":READ?"),
                (BatteryDischargeMode, ":BATT:TEST:MODE DIS"),
                (BatteryCurrentLimit, ":BATT:TEST:CURR:LIM:SOUR {value}"),
                (BatteryEndCurrent, ":BATT:TEST:CURR:END {value}"),
                (BatteryEndVoltage, ":BATT:TEST:VOLT {value}"),
                (BatteryTestStop, ":BATT:TEST:EXEC STOP"),
                (BatteryLoggingOff, ":BATT:DATA:STAT OFF"),
                (ClearBatteryBuffer, ":BATT1:DATA:CLE"),
                (OperationCondition, ":STAT:OPER:INST:ISUM:COND?"),
                (OperationComplete, "*OPC?"),
                (ModelFullVoltage, ":BATT:TEST:SENS:AH:VFUL {value}"),
                (ModelCurrentLimit, ":BATT:TEST:SENS:AH:ILIM {value}"),
                (ModelEsrInterval, ":BATT:TEST:SENS:AH:ESRInterval S{seconds}"),
                (ModelStart, ":BATT:TEST:SENS:AH:EXEC STAR"),
                (ModelRange, ":BATT:TEST:SENS:AH:GMOD:RANG {min},{max}"),
                (ModelSave, ":BATT:TEST:SENS:AH:GMOD:SAVE:INTernal {slot}"),
                (BufferPoints, ":TRACe:POINts:ACTual?"),
                (ModelRow, ":BATT:MOD{slot}:ROW{row}?"),
            ]),
            combined_layout: Some(CombinedLayout {
                current_index: 0,
                voltage_index: 1,
            }),
            busy_mask: default_busy_mask(),
        }
    }

    /// Sorensen SGX400-12 DC supply.
    pub fn sorensen_sgx400_12() -> Self {
        use CommandKey::*;
        Self {
            name: "Sorensen SGX400-12".to_string(),
            max_voltage: 400.0,
            max_current: 12.0,
            max_power: 4800.0,
            commands: table(&[
                (Identify, "*IDN?"),
                (Clear, "*CLS"),
                (Reset, "*RST"),
                (SetVoltage, "SOUR:VOLT {value}"),
                (SetCurrent, "SOUR:CURR {value}"),
                (SetVoltageProtection, "SOUR:VOLT:PROT {value}"),
                (OutputOn, "OUTP:STAT ON"),
                (OutputOff, "OUTP:STAT OFF"),
                (MeasureVoltage, "MEAS:VOLT?"),
                (MeasureCurrent, "MEAS:CURR?"),
            ]),
            combined_layout: None,
            busy_mask: default_busy_mask(),
        }
    }

    /// Prodigit 34205A electronic load, driven in constant-current mode.
    pub fn prodigit_34205a() -> Self {
        use CommandKey::*;
        Self {
            name: "Prodigit 34205A".to_string(),
            max_voltage: 600.0,
            max_current: 160.0,
            max_power: 5000.0,
            commands: table(&[
                (SelectPowerMode, "MODE CC"),
                (SetCurrent, "CC:HIGH {value}"),
                (OutputOn, "LOAD ON"),
                (OutputOff, "LOAD OFF"),
                (MeasureVoltage, "MEAS:VOLT?"),
                (MeasureCurrent, "MEAS:CURR?"),
            ]),
            combined_layout: None,
            busy_mask: default_busy_mask(),
        }
    }
}

fn table(entries: &[(CommandKey, &str)]) -> BTreeMap<CommandKey, String> {
    entries
        .iter()
        .map(|(key, template)| (*key, (*template).to_string()))
        .collect()
}
