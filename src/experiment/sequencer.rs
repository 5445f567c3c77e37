//! Pulse/rest test sequencer.
//!
//! The sequencer drives one instrument through `cycle_count` pulse/rest cycles:
//!
//! ```text
//! Idle -> Armed -> [Ramping] -> PulseOn -> [Ramping] -> Resting -> ... -> Complete
//!                                                                   \-> Aborted | Error
//! ```
//!
//! Measurements are taken every `sample_interval` in each phase, appended to the
//! in-memory [`TestResult`] and streamed to the [`ResultSink`]. Sampling failures
//! on the transport are recorded as unavailable readings; failures of a state
//! transition command (output on/off, setpoints) end the run in `Error`.
//!
//! Whatever ends the run, the instrument is commanded output-off and local exactly
//! once before the session is released.

use super::plan::{RampStep, TestPlan};
use super::waiter::{Clock, Interrupt, PollingWaiter, SystemClock};
use crate::adapters::TransportChannel;
use crate::data::storage::ResultSink;
use crate::error::{AppResult, DaqError};
use crate::instrument::{Instrument, OutputMode, Reading};
use crate::measurement::{Measurement, Phase, TestResult};
use chrono::Local;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Sequencer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Not started.
    Idle,
    /// Configuration sent.
    Armed,
    /// Stepping the current before or after a pulse.
    Ramping,
    /// Output on at pulse current.
    PulseOn,
    /// Output off.
    Resting,
    /// All cycles finished.
    Complete,
    /// Stopped by an operator interrupt.
    Aborted,
    /// Stopped by a failure.
    Error,
}

impl SequencerState {
    /// True for `Complete`, `Aborted` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Error)
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::Ramping => "RAMPING",
            Self::PulseOn => "PULSE_ON",
            Self::Resting => "RESTING",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Runs one [`TestPlan`] against one instrument.
pub struct TestSequencer<T, S, C = SystemClock>
where
    T: TransportChannel,
    S: ResultSink<Measurement>,
    C: Clock,
{
    instrument: Instrument<T>,
    plan: TestPlan,
    sink: S,
    clock: C,
    interrupt: Interrupt,
    state: SequencerState,
    result: TestResult,
    run_start: Option<Instant>,
    cycle: u32,
    output_on: bool,
    cleaned_up: bool,
}

impl<T, S> TestSequencer<T, S, SystemClock>
where
    T: TransportChannel,
    S: ResultSink<Measurement>,
{
    /// Sequencer on the wall clock.
    pub fn new(instrument: Instrument<T>, plan: TestPlan, sink: S) -> Self {
        Self::with_clock(instrument, plan, sink, SystemClock)
    }
}

impl<T, S, C> TestSequencer<T, S, C>
where
    T: TransportChannel,
    S: ResultSink<Measurement>,
    C: Clock,
{
    /// Sequencer on `clock`.
    pub fn with_clock(instrument: Instrument<T>, plan: TestPlan, sink: S, clock: C) -> Self {
        Self {
            instrument,
            plan,
            sink,
            clock,
            interrupt: Interrupt::new(),
            state: SequencerState::Idle,
            result: TestResult::new(),
            run_start: None,
            cycle: 0,
            output_on: false,
            cleaned_up: false,
        }
    }

    /// Observe `interrupt` for operator aborts.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Handle that aborts this run when triggered.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Measurements recorded so far.
    pub fn result(&self) -> &TestResult {
        &self.result
    }

    /// The result sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The plan being run.
    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    /// The instrument controller.
    pub fn instrument(&self) -> &Instrument<T> {
        &self.instrument
    }

    /// Execute the plan to completion.
    ///
    /// Plan and envelope errors are returned before any command is sent. Once the
    /// state machine starts, every exit runs the safe-state cleanup. If the run
    /// itself succeeded but cleanup did not, the cleanup failures are returned as
    /// [`DaqError::ShutdownFailed`].
    pub fn run(&mut self) -> AppResult<()> {
        if self.state != SequencerState::Idle {
            return Err(DaqError::Configuration(format!(
                "sequencer already ran (state {})",
                self.state
            )));
        }
        self.plan.validate()?;
        self.plan.check_envelope(self.instrument.spec())?;

        let outcome = self.execute();
        let final_state = match &outcome {
            Ok(()) => SequencerState::Complete,
            Err(DaqError::TestAborted) => SequencerState::Aborted,
            Err(_) => SequencerState::Error,
        };
        if let Err(err) = &outcome {
            error!(state = %self.state, cycle = self.cycle, error = %err, "run failed");
        }

        let cleanup_failures = self.cleanup();
        if let Err(err) = self.sink.finalize() {
            warn!(error = %err, "result sink did not close cleanly");
        }

        match outcome {
            Ok(()) if !cleanup_failures.is_empty() => {
                self.transition(SequencerState::Error);
                Err(DaqError::ShutdownFailed(cleanup_failures))
            }
            Ok(()) => {
                self.transition(final_state);
                info!(
                    samples = self.result.len(),
                    unavailable = self.result.unavailable_count(),
                    "run complete"
                );
                Ok(())
            }
            Err(err) => {
                self.transition(final_state);
                Err(err)
            }
        }
    }

    fn transition(&mut self, next: SequencerState) {
        if self.state != next {
            info!(from = %self.state, to = %next, cycle = self.cycle, "state change");
            self.state = next;
        }
    }

    fn execute(&mut self) -> AppResult<()> {
        self.arm()?;
        let cycles = self.plan.cycle_count;
        for cycle in 1..=cycles {
            self.cycle = cycle;
            info!(cycle, cycles, "cycle start");

            let ramp_up = self.plan.ramp_up.clone();
            self.run_ramp(&ramp_up, Phase::RampUp)?;
            self.run_pulse()?;
            let ramp_down = self.plan.ramp_down.clone();
            self.run_ramp(&ramp_down, Phase::RampDown)?;
            self.run_rest()?;
        }
        Ok(())
    }

    fn arm(&mut self) -> AppResult<()> {
        if !self.instrument.session().is_open() {
            return Err(DaqError::NotConnected);
        }
        self.run_start = Some(self.clock.now());

        self.instrument.clear_status()?;
        self.instrument.remote()?;
        self.instrument.set_mode(self.plan.mode)?;
        match self.plan.mode {
            OutputMode::PowerSupply => {
                self.instrument.set_voltage(self.plan.voltage_cutoff)?;
                self.instrument.set_current(self.plan.current_limit)?;
                if let Some(ovp) = self.plan.voltage_protection {
                    self.instrument.set_voltage_protection(ovp)?;
                }
            }
            OutputMode::BatteryTest => {
                self.instrument.select_discharge()?;
                self.instrument
                    .set_battery_current_limit(self.plan.current_limit)?;
                self.instrument
                    .set_battery_end_voltage(self.plan.voltage_cutoff)?;
                self.instrument.clear_battery_buffer()?;
            }
        }
        self.transition(SequencerState::Armed);
        Ok(())
    }

    fn ensure_output_on(&mut self) -> AppResult<()> {
        if !self.output_on {
            self.instrument.output_on()?;
            self.output_on = true;
        }
        Ok(())
    }

    fn run_ramp(&mut self, steps: &[RampStep], phase: Phase) -> AppResult<()> {
        if steps.is_empty() {
            return Ok(());
        }
        self.transition(SequencerState::Ramping);
        for step in steps {
            self.instrument.set_pulse_current(step.current)?;
            self.ensure_output_on()?;
            self.sample_for(phase, step.duration)?;
        }
        Ok(())
    }

    fn run_pulse(&mut self) -> AppResult<()> {
        self.check_interrupt()?;
        let needs_reset = !self.plan.ramp_up.is_empty()
            || !self.plan.ramp_down.is_empty()
            || self.plan.rest_current.is_some();
        if needs_reset {
            self.instrument.set_pulse_current(self.plan.current_limit)?;
        }
        self.ensure_output_on()?;
        self.transition(SequencerState::PulseOn);

        match self.plan.completion {
            Some(policy) => self.sample_until_complete(policy.poll_interval, policy.timeout),
            None => self.sample_for(Phase::Pulse, self.plan.pulse_duration),
        }
    }

    fn run_rest(&mut self) -> AppResult<()> {
        self.check_interrupt()?;
        self.instrument.output_off()?;
        self.output_on = false;
        if let (OutputMode::BatteryTest, Some(rest)) = (self.plan.mode, self.plan.rest_current) {
            self.instrument.set_battery_current_limit(rest)?;
        }
        self.transition(SequencerState::Resting);
        self.sample_for(Phase::Rest, self.plan.rest_duration)
    }

    fn check_interrupt(&self) -> AppResult<()> {
        if self.interrupt.is_triggered() {
            Err(DaqError::TestAborted)
        } else {
            Ok(())
        }
    }

    /// Idle until `deadline`, aborting on interrupt.
    fn sleep_until(&self, deadline: Instant) -> AppResult<()> {
        let now = self.clock.now();
        if deadline > now && self.clock.sleep(deadline - now, &self.interrupt) {
            return Err(DaqError::TestAborted);
        }
        Ok(())
    }

    /// Sample `phase` on the plan cadence for `duration`.
    ///
    /// Samples fall at `start + k * sample_interval` for every such instant before
    /// the phase ends. A zero interval takes a single sample at phase start.
    fn sample_for(&mut self, phase: Phase, duration: Duration) -> AppResult<()> {
        let start = self.clock.now();
        let end = start + duration;
        if duration.is_zero() {
            return self.check_interrupt();
        }

        let interval = self.plan.sample_interval;
        let mut k: u32 = 0;
        loop {
            let target = start + interval * k;
            if target >= end || (interval.is_zero() && k > 0) {
                break;
            }
            self.sleep_until(target)?;
            self.check_interrupt()?;
            self.take_sample(phase)?;
            k += 1;
        }
        self.sleep_until(end)
    }

    /// Sample on every poll until the busy bit clears or `timeout` passes.
    fn sample_until_complete(&mut self, poll_interval: Duration, timeout: Duration) -> AppResult<()> {
        info!(?poll_interval, ?timeout, "waiting for completion bit");
        let waiter = PollingWaiter::new(&self.clock, &self.interrupt);
        let instrument = &mut self.instrument;
        let result = &mut self.result;
        let sink = &mut self.sink;
        let run_start = self.run_start;
        let clock = &self.clock;
        let cycle = self.cycle;

        waiter.wait_until(
            || {
                let measurement =
                    build_measurement(instrument, clock, run_start, cycle, Phase::Pulse)?;
                sink.append(&measurement)?;
                result.push(measurement);
                instrument.is_busy().map(|busy| !busy)
            },
            poll_interval,
            timeout,
        )
    }

    fn take_sample(&mut self, phase: Phase) -> AppResult<()> {
        let measurement = build_measurement(
            &mut self.instrument,
            &self.clock,
            self.run_start,
            self.cycle,
            phase,
        )?;
        self.sink.append(&measurement)?;
        self.result.push(measurement);
        Ok(())
    }

    /// Safe-state cleanup, at most once per sequencer.
    fn cleanup(&mut self) -> Vec<DaqError> {
        if self.cleaned_up {
            return Vec::new();
        }
        self.cleaned_up = true;
        info!(instrument = %self.instrument.session().id(), "restoring safe state");
        let failures = self.instrument.restore_safe_state();
        self.output_on = false;
        self.instrument.session_mut().close();
        failures
    }
}

/// Take one sample, downgrading transport failures to unavailable readings.
fn build_measurement<T: TransportChannel, C: Clock>(
    instrument: &mut Instrument<T>,
    clock: &C,
    run_start: Option<Instant>,
    cycle: u32,
    phase: Phase,
) -> AppResult<Measurement> {
    let (voltage, current) = match instrument.sample() {
        Ok(sample) => (sample.voltage, sample.current),
        Err(err) if err.is_transport() => {
            warn!(cycle, %phase, error = %err, "sample failed, recorded as unavailable");
            let reading = Reading::transport_failed(&err);
            (reading.clone(), reading)
        }
        Err(err) => return Err(err),
    };
    let now = clock.now();
    let elapsed = run_start.map_or(Duration::ZERO, |start| now.duration_since(start));
    Ok(Measurement {
        timestamp: Local::now(),
        elapsed,
        cycle,
        phase,
        voltage,
        current,
    })
}

impl<T, S, C> Drop for TestSequencer<T, S, C>
where
    T: TransportChannel,
    S: ResultSink<Measurement>,
    C: Clock,
{
    fn drop(&mut self) {
        if self.state != SequencerState::Idle && !self.cleaned_up {
            let _ = self.cleanup();
        }
    }
}
