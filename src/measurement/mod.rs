//! Measurement records produced by test runs.

use crate::instrument::Reading;
use chrono::{DateTime, Local};
use std::fmt;
use std::time::Duration;

/// Segment of a pulse cycle a sample was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Output on at pulse current.
    Pulse,
    /// Output off.
    Rest,
    /// Stepping up toward the pulse current.
    RampUp,
    /// Stepping down after the pulse.
    RampDown,
}

impl Phase {
    /// Label written to result files.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pulse => "PULSE",
            Self::Rest => "REST",
            Self::RampUp => "RAMP-UP",
            Self::RampDown => "RAMP-DN",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One sample taken during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Wall-clock time of the sample.
    pub timestamp: DateTime<Local>,
    /// Time since the run started.
    pub elapsed: Duration,
    /// 1-based cycle number.
    pub cycle: u32,
    /// Phase the sample belongs to.
    pub phase: Phase,
    /// Terminal voltage.
    pub voltage: Reading,
    /// Output current.
    pub current: Reading,
}

/// Ordered, append-only sequence of measurements from one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestResult {
    measurements: Vec<Measurement>,
}

impl TestResult {
    /// Empty result.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
    }

    /// Number of measurements.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Measurements in recording order.
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Measurements of one phase.
    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = &Measurement> {
        self.measurements.iter().filter(move |m| m.phase == phase)
    }

    /// Measurements with at least one unavailable reading.
    pub fn unavailable_count(&self) -> usize {
        self.measurements
            .iter()
            .filter(|m| !m.voltage.is_available() || !m.current.is_available())
            .count()
    }
}

/// One row of an exported battery model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRow {
    /// State of charge in percent.
    pub soc_pct: f64,
    /// Open-circuit voltage in volts.
    pub volt_v: f64,
    /// Equivalent series resistance in ohms.
    pub esr_ohm: f64,
}

/// One step of a replayed current profile, sampled at the end of its dwell.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    /// Wall-clock time of the sample.
    pub timestamp: DateTime<Local>,
    /// Time since the run started.
    pub elapsed: Duration,
    /// 1-based step number.
    pub step: usize,
    /// Current commanded for the step.
    pub current_set: f64,
    /// Measured output current.
    pub current: Reading,
    /// Terminal voltage.
    pub voltage: Reading,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Unavailable;

    fn sample(phase: Phase, voltage: Reading) -> Measurement {
        Measurement {
            timestamp: Local::now(),
            elapsed: Duration::ZERO,
            cycle: 1,
            phase,
            voltage,
            current: Reading::Value(0.0),
        }
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(Phase::Pulse.to_string(), "PULSE");
        assert_eq!(Phase::RampDown.label(), "RAMP-DN");
    }

    #[test]
    fn test_result_preserves_order_and_counts_gaps() {
        let mut result = TestResult::new();
        result.push(sample(Phase::Pulse, Reading::Value(3.9)));
        result.push(sample(
            Phase::Rest,
            Reading::Unavailable(Unavailable::Malformed("?".into())),
        ));
        result.push(sample(Phase::Rest, Reading::Value(3.95)));

        assert_eq!(result.len(), 3);
        assert_eq!(result.measurements()[0].phase, Phase::Pulse);
        assert_eq!(result.in_phase(Phase::Rest).count(), 2);
        assert_eq!(result.unavailable_count(), 1);
    }
}
