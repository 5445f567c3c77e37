//! Current profile replay.
//!
//! A profile is a CSV file with `time_s` and `current_a` columns. Each row sets the
//! output current, which is held until the next row's time. Voltage and current are
//! sampled at the end of every step and streamed to a [`ResultSink`] of
//! [`ProfileRow`]s.
//!
//! ```text
//! time_s,current_a
//! 0,0.5
//! 30,2.0
//! 40,0.5
//! ```

use super::plan::CurrentProfilePlan;
use super::waiter::{Clock, Interrupt, SystemClock};
use crate::adapters::TransportChannel;
use crate::data::storage::ResultSink;
use crate::error::{AppResult, DaqError};
use crate::instrument::{DeviceSpec, Instrument, OutputMode, Reading};
use crate::measurement::ProfileRow;
use chrono::Local;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shortest dwell, used when two rows share a time stamp.
const MIN_DWELL: Duration = Duration::from_millis(10);

/// Dwell of the last step when the profile has a single row.
const SINGLE_STEP_DWELL: Duration = Duration::from_secs(1);

/// One row of a profile file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ProfileStep {
    /// Start of the step relative to the profile start, in seconds.
    pub time_s: f64,
    /// Current held during the step, in amperes.
    pub current_a: f64,
}

/// Validated profile with per-step dwell times.
///
/// Each step lasts until the next step's start, at least [`MIN_DWELL`]. The last
/// step repeats the previous dwell.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentProfile {
    steps: Vec<ProfileStep>,
    dwells: Vec<Duration>,
}

impl CurrentProfile {
    /// Build a profile from steps in file order.
    pub fn new(steps: Vec<ProfileStep>) -> AppResult<Self> {
        if steps.is_empty() {
            return Err(DaqError::Configuration(
                "current profile has no steps".to_string(),
            ));
        }
        if let Some((i, bad)) = steps
            .iter()
            .enumerate()
            .find(|(_, s)| !s.time_s.is_finite() || !s.current_a.is_finite())
        {
            return Err(DaqError::Configuration(format!(
                "profile row {} is not numeric: time_s={}, current_a={}",
                i + 1,
                bad.time_s,
                bad.current_a
            )));
        }

        let mut dwells = Vec::with_capacity(steps.len());
        for pair in steps.windows(2) {
            let gap = Duration::try_from_secs_f64(pair[1].time_s - pair[0].time_s)
                .unwrap_or(Duration::ZERO);
            dwells.push(gap.max(MIN_DWELL));
        }
        dwells.push(dwells.last().copied().unwrap_or(SINGLE_STEP_DWELL));

        Ok(Self { steps, dwells })
    }

    /// Read a profile file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            DaqError::Configuration(format!("cannot open profile '{}': {}", path.display(), e))
        })?;
        let profile = Self::from_reader(file)?;
        info!(
            file = %path.display(),
            steps = profile.len(),
            duration = ?profile.total_duration(),
            "current profile loaded"
        );
        Ok(profile)
    }

    /// Parse profile CSV from `reader`. Columns other than `time_s` and `current_a`
    /// are ignored.
    pub fn from_reader<R: Read>(reader: R) -> AppResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let steps = csv_reader
            .deserialize::<ProfileStep>()
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(steps)
    }

    /// Steps in replay order.
    pub fn steps(&self) -> &[ProfileStep] {
        &self.steps
    }

    /// Dwell of each step, parallel to [`steps`](Self::steps).
    pub fn dwells(&self) -> &[Duration] {
        &self.dwells
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for a constructed profile.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of all dwells.
    pub fn total_duration(&self) -> Duration {
        self.dwells.iter().sum()
    }

    /// Check every step current against the device envelope.
    pub fn check_envelope(&self, spec: &DeviceSpec) -> AppResult<()> {
        match self
            .steps
            .iter()
            .find(|s| !(0.0..=spec.max_current).contains(&s.current_a))
        {
            Some(step) => Err(DaqError::validation(
                "profile current",
                step.current_a,
                0.0,
                spec.max_current,
            )),
            None => Ok(()),
        }
    }
}

/// One replay of a current profile.
pub struct ProfileRun<T, S, C = SystemClock>
where
    T: TransportChannel,
    S: ResultSink<ProfileRow>,
    C: Clock,
{
    instrument: Instrument<T>,
    plan: CurrentProfilePlan,
    profile: CurrentProfile,
    sink: S,
    clock: C,
    interrupt: Interrupt,
    rows: Vec<ProfileRow>,
    run_start: Option<Instant>,
    started: bool,
    cleaned_up: bool,
}

impl<T, S> ProfileRun<T, S, SystemClock>
where
    T: TransportChannel,
    S: ResultSink<ProfileRow>,
{
    /// Replay on the wall clock.
    pub fn new(
        instrument: Instrument<T>,
        plan: CurrentProfilePlan,
        profile: CurrentProfile,
        sink: S,
    ) -> Self {
        Self::with_clock(instrument, plan, profile, sink, SystemClock)
    }
}

impl<T, S, C> ProfileRun<T, S, C>
where
    T: TransportChannel,
    S: ResultSink<ProfileRow>,
    C: Clock,
{
    /// Replay on `clock`.
    pub fn with_clock(
        instrument: Instrument<T>,
        plan: CurrentProfilePlan,
        profile: CurrentProfile,
        sink: S,
        clock: C,
    ) -> Self {
        Self {
            instrument,
            plan,
            profile,
            sink,
            clock,
            interrupt: Interrupt::new(),
            rows: Vec::new(),
            run_start: None,
            started: false,
            cleaned_up: false,
        }
    }

    /// Observe `interrupt` for operator aborts.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Rows recorded so far.
    pub fn rows(&self) -> &[ProfileRow] {
        &self.rows
    }

    /// The result sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The controlled instrument.
    pub fn instrument(&self) -> &Instrument<T> {
        &self.instrument
    }

    /// Replay the profile and return the number of rows written.
    ///
    /// Plan, profile and envelope errors are returned before any command is sent.
    /// After that the output is always switched off and the instrument returned to
    /// local control, and cleanup failures of an otherwise successful run surface as
    /// [`DaqError::ShutdownFailed`].
    pub fn run(&mut self) -> AppResult<usize> {
        if self.started {
            return Err(DaqError::Configuration("profile run already ran".to_string()));
        }
        self.plan.validate()?;
        self.plan.check_envelope(self.instrument.spec())?;
        self.profile.check_envelope(self.instrument.spec())?;
        self.started = true;

        let outcome = self.execute();
        match &outcome {
            Err(DaqError::TestAborted) => warn!(rows = self.rows.len(), "profile run aborted"),
            Err(err) => error!(rows = self.rows.len(), error = %err, "profile run failed"),
            Ok(()) => {}
        }

        let cleanup_failures = self.cleanup();
        if let Err(err) = self.sink.finalize() {
            warn!(error = %err, "profile sink did not close cleanly");
        }

        match outcome {
            Ok(()) if !cleanup_failures.is_empty() => {
                Err(DaqError::ShutdownFailed(cleanup_failures))
            }
            Ok(()) => {
                info!(steps = self.rows.len(), "current profile complete");
                Ok(self.rows.len())
            }
            Err(err) => Err(err),
        }
    }

    fn execute(&mut self) -> AppResult<()> {
        if !self.instrument.session().is_open() {
            return Err(DaqError::NotConnected);
        }
        self.run_start = Some(self.clock.now());

        self.instrument.clear_status()?;
        self.instrument.remote()?;
        self.instrument.set_mode(self.plan.mode)?;
        match self.plan.mode {
            OutputMode::PowerSupply => {
                self.instrument.set_voltage(self.plan.voltage)?;
                if let Some(ovp) = self.plan.voltage_protection {
                    self.instrument.set_voltage_protection(ovp)?;
                }
            }
            OutputMode::BatteryTest => {
                self.instrument.select_discharge()?;
                self.instrument.set_battery_end_voltage(self.plan.voltage)?;
                self.instrument.clear_battery_buffer()?;
            }
        }
        info!(
            steps = self.profile.len(),
            duration = ?self.profile.total_duration(),
            "replaying current profile"
        );

        let mut output_on = false;
        for index in 0..self.profile.len() {
            if self.interrupt.is_triggered() {
                return Err(DaqError::TestAborted);
            }
            let step = self.profile.steps()[index];
            let dwell = self.profile.dwells()[index];

            self.instrument.set_pulse_current(step.current_a)?;
            if !output_on {
                self.instrument.output_on()?;
                output_on = true;
            }
            if self.clock.sleep(dwell, &self.interrupt) {
                return Err(DaqError::TestAborted);
            }

            let row = self.sample_step(index + 1, step.current_a)?;
            debug!(
                step = row.step,
                set = row.current_set,
                current = %row.current,
                voltage = %row.voltage,
                "profile step"
            );
            self.sink.append(&row)?;
            self.rows.push(row);
        }
        Ok(())
    }

    fn sample_step(&mut self, step: usize, current_set: f64) -> AppResult<ProfileRow> {
        let (voltage, current) = match self.instrument.sample() {
            Ok(sample) => (sample.voltage, sample.current),
            Err(err) if err.is_transport() => {
                warn!(step, error = %err, "sample failed, recorded as unavailable");
                let reading = Reading::transport_failed(&err);
                (reading.clone(), reading)
            }
            Err(err) => return Err(err),
        };
        let elapsed = self
            .run_start
            .map_or(Duration::ZERO, |start| self.clock.now().duration_since(start));
        Ok(ProfileRow {
            timestamp: Local::now(),
            elapsed,
            step,
            current_set,
            current,
            voltage,
        })
    }

    fn cleanup(&mut self) -> Vec<DaqError> {
        if self.cleaned_up {
            return Vec::new();
        }
        self.cleaned_up = true;
        let failures = self.instrument.restore_safe_state();
        self.instrument.session_mut().close();
        failures
    }
}

impl<T, S, C> Drop for ProfileRun<T, S, C>
where
    T: TransportChannel,
    S: ResultSink<ProfileRow>,
    C: Clock,
{
    fn drop(&mut self) {
        if self.started && !self.cleaned_up {
            let _ = self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{Fault, MockHandle};
    use crate::adapters::MockAdapter;
    use crate::data::storage::MemorySink;
    use crate::experiment::waiter::ManualClock;
    use crate::instrument::DeviceSession;
    use std::path::PathBuf;

    type MockProfileRun = ProfileRun<MockAdapter, MemorySink<ProfileRow>, ManualClock>;

    fn plan() -> CurrentProfilePlan {
        CurrentProfilePlan {
            profile: PathBuf::from("profile.csv"),
            mode: OutputMode::PowerSupply,
            voltage: 4.2,
            voltage_protection: None,
        }
    }

    fn profile(rows: &[(f64, f64)]) -> CurrentProfile {
        CurrentProfile::new(
            rows.iter()
                .map(|&(time_s, current_a)| ProfileStep { time_s, current_a })
                .collect(),
        )
        .unwrap()
    }

    fn replay(
        plan: CurrentProfilePlan,
        profile: CurrentProfile,
    ) -> (MockProfileRun, MockHandle, ManualClock) {
        let adapter = MockAdapter::battery_simulator();
        let handle = adapter.handle();
        let session = DeviceSession::open("k2281s", adapter).unwrap();
        let instrument = Instrument::new(session, DeviceSpec::keithley_2281s());
        let clock = ManualClock::new();
        let run =
            ProfileRun::with_clock(instrument, plan, profile, MemorySink::new(), clock.clone());
        (run, handle, clock)
    }

    #[test]
    fn test_dwells_follow_row_times() {
        let p = profile(&[(0.0, 1.0), (2.0, 0.5), (5.0, 2.0)]);
        assert_eq!(
            p.dwells(),
            &[
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
        assert_eq!(p.total_duration(), Duration::from_secs(8));

        let same_time = profile(&[(1.0, 1.0), (1.0, 0.5)]);
        assert_eq!(same_time.dwells()[0], MIN_DWELL);

        let single = profile(&[(0.0, 1.0)]);
        assert_eq!(single.dwells(), &[SINGLE_STEP_DWELL]);
    }

    #[test]
    fn test_profile_from_csv() {
        let text = "time_s, current_a, note\n0, 0.5, rest\n30, 2.0, pulse\n40, 0.5, rest\n";
        let p = CurrentProfile::from_reader(text.as_bytes()).unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.steps()[1].current_a, 2.0);
        assert_eq!(p.dwells()[0], Duration::from_secs(30));
    }

    #[test]
    fn test_profile_rejects_bad_files() {
        let missing_column = "time,current\n0,1.0\n";
        assert!(matches!(
            CurrentProfile::from_reader(missing_column.as_bytes()),
            Err(DaqError::Csv(_))
        ));

        let empty = "time_s,current_a\n";
        assert!(matches!(
            CurrentProfile::from_reader(empty.as_bytes()),
            Err(DaqError::Configuration(_))
        ));

        assert!(CurrentProfile::load("/nonexistent/profile.csv").is_err());
    }

    #[test]
    fn test_replay_sets_current_then_samples_each_step() {
        let (mut run, handle, clock) = replay(plan(), profile(&[(0.0, 1.0), (2.0, 0.5), (5.0, 2.0)]));
        assert_eq!(run.run().unwrap(), 3);

        assert_eq!(
            handle.writes(),
            vec![
                "*CLS",
                "SYST:REM",
                ":ENTRy:FUNC POWer",
                ":SOUR:VOLT 4.2",
                ":SOUR:CURR 1",
                ":OUTP ON",
                ":SOUR:CURR 0.5",
                ":SOUR:CURR 2",
                ":OUTP OFF",
                "SYST:LOC",
            ]
        );
        assert_eq!(clock.elapsed(), Duration::from_secs(8));

        let rows = run.rows();
        let elapsed: Vec<u64> = rows.iter().map(|r| r.elapsed.as_secs()).collect();
        assert_eq!(elapsed, vec![2, 5, 8]);
        let steps: Vec<usize> = rows.iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(rows[1].current_set, 0.5);
        assert!(rows.iter().all(|r| r.voltage.is_available()));
        assert_eq!(run.sink().rows().len(), 3);
        assert!(run.sink().is_finalized());
        assert!(!run.instrument().session().is_open());
    }

    #[test]
    fn test_failed_sample_keeps_replaying() {
        let (mut run, handle, _clock) = replay(plan(), profile(&[(0.0, 1.0), (1.0, 0.5), (2.0, 1.0)]));
        handle.inject(":READ?", 2, Fault::Timeout);
        assert_eq!(run.run().unwrap(), 3);
        assert!(!run.rows()[1].voltage.is_available());
        assert!(run.rows()[2].voltage.is_available());
    }

    #[test]
    fn test_interrupt_turns_output_off() {
        let (run, handle, _clock) = replay(plan(), profile(&[(0.0, 1.0), (2.0, 0.5), (5.0, 2.0)]));
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        handle.on_command(move |cmd| {
            if cmd == ":SOUR:CURR 0.5" {
                trigger.trigger();
            }
        });
        let mut run = run.with_interrupt(interrupt);

        assert!(matches!(run.run(), Err(DaqError::TestAborted)));
        assert_eq!(run.rows().len(), 1);
        assert_eq!(handle.count(":OUTP OFF"), 1);
        let writes = handle.writes();
        assert_eq!(writes.last().map(String::as_str), Some("SYST:LOC"));
        assert!(run.run().is_err());
    }

    #[test]
    fn test_out_of_envelope_profile_sends_nothing() {
        let (mut run, handle, _clock) = replay(plan(), profile(&[(0.0, 1.0), (2.0, 8.0)]));
        assert!(matches!(run.run(), Err(DaqError::Validation { .. })));
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn test_battery_mode_uses_battery_limit() {
        let (mut run, handle, _clock) = replay(
            CurrentProfilePlan {
                mode: OutputMode::BatteryTest,
                voltage: 2.8,
                ..plan()
            },
            profile(&[(0.0, 1.0), (1.0, 0.5)]),
        );
        run.run().unwrap();
        let writes = handle.writes();
        assert!(writes.contains(&":BATT:TEST:VOLT 2.8".to_string()));
        assert!(writes.contains(&":BATT:TEST:CURR:LIM:SOUR 0.5".to_string()));
        assert!(writes.contains(&":BATT:OUTP ON".to_string()));
        assert_eq!(writes.last().map(String::as_str), Some("SYST:LOC"));
    }
}
