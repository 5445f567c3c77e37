//! End-to-end pulse test runs against the simulated battery.

use bench_daq::adapters::mock::{Fault, MockHandle};
use bench_daq::adapters::MockAdapter;
use bench_daq::data::{CsvSink, MemorySink};
use bench_daq::error::DaqError;
use bench_daq::experiment::{Interrupt, ManualClock, SequencerState, TestPlan, TestSequencer};
use bench_daq::instrument::{DeviceSession, DeviceSpec, Instrument, Reading, Unavailable};
use bench_daq::measurement::{Measurement, Phase, TestResult};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn keithley() -> (Instrument<MockAdapter>, MockHandle) {
    let adapter = MockAdapter::battery_simulator();
    let handle = adapter.handle();
    let session = DeviceSession::open("k2281s", adapter).unwrap();
    (Instrument::new(session, DeviceSpec::keithley_2281s()), handle)
}

fn two_cycle_plan() -> TestPlan {
    TestPlan {
        pulse_duration: Duration::from_secs(2),
        rest_duration: Duration::from_secs(2),
        cycle_count: 2,
        current_limit: 1.0,
        voltage_cutoff: 4.2,
        sample_interval: Duration::from_secs(1),
        ..TestPlan::default()
    }
}

fn output_writes(handle: &MockHandle) -> Vec<String> {
    handle
        .writes()
        .into_iter()
        .filter(|w| w.contains("OUTP") || w.starts_with("SYST:LOC"))
        .collect()
}

/// The flushed file holds exactly the rows of `result`, in order.
fn assert_file_matches(path: &Path, result: &TestResult) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(records.len(), result.len());
    for (record, measurement) in records.iter().zip(result.measurements()) {
        assert_eq!(&record[1], measurement.phase.label());
        let volt: f64 = record[2].parse().unwrap();
        assert_eq!(Some(volt), measurement.voltage.value());
    }
}

#[test]
fn test_two_cycles_sample_every_phase() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pulse.csv");
    let (instrument, handle) = keithley();
    let sink = CsvSink::create(&path).unwrap();
    let clock = ManualClock::new();

    let mut sequencer = TestSequencer::with_clock(instrument, two_cycle_plan(), sink, clock.clone());
    sequencer.run().unwrap();

    assert_eq!(sequencer.state(), SequencerState::Complete);
    assert_eq!(clock.elapsed(), Duration::from_secs(8));

    let result = sequencer.result();
    assert_eq!(result.len(), 8);
    let phases: Vec<Phase> = result.measurements().iter().map(|m| m.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Pulse,
            Phase::Pulse,
            Phase::Rest,
            Phase::Rest,
            Phase::Pulse,
            Phase::Pulse,
            Phase::Rest,
            Phase::Rest
        ]
    );
    let elapsed: Vec<u64> = result
        .measurements()
        .iter()
        .map(|m| m.elapsed.as_secs())
        .collect();
    assert_eq!(elapsed, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(result.measurements().iter().all(|m| m.voltage.is_available()));

    // loaded voltage sags below open circuit, rest recovers
    let pulse_v = result.measurements()[0].voltage.value().unwrap();
    let rest_v = result.measurements()[2].voltage.value().unwrap();
    assert!(pulse_v < rest_v);

    assert_eq!(
        output_writes(&handle),
        vec![":OUTP ON", ":OUTP OFF", ":OUTP ON", ":OUTP OFF", ":OUTP OFF", "SYST:LOC"]
    );
    assert!(!sequencer.instrument().session().is_open());

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 9);
    assert_eq!(text.lines().next(), Some("elapsed_s,phase,volt_v,curr_a"));
}

#[test]
fn test_failed_sample_recorded_as_unavailable() {
    let (instrument, handle) = keithley();
    handle.inject(":READ?", 3, Fault::Timeout);

    let mut sequencer = TestSequencer::with_clock(
        instrument,
        two_cycle_plan(),
        MemorySink::<Measurement>::new(),
        ManualClock::new(),
    );
    sequencer.run().unwrap();

    assert_eq!(sequencer.state(), SequencerState::Complete);
    let result = sequencer.result();
    assert_eq!(result.len(), 8);
    assert_eq!(result.unavailable_count(), 1);

    let gap = &result.measurements()[2];
    assert_eq!(gap.phase, Phase::Rest);
    assert!(matches!(
        gap.voltage,
        Reading::Unavailable(Unavailable::TransportFailed(_))
    ));
    assert!(!gap.current.is_available());
    assert_eq!(sequencer.sink().rows().len(), 8);
    assert_eq!(handle.count("SYST:LOC"), 1);
}

#[test]
fn test_interrupt_during_run_aborts_through_cleanup() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("aborted.csv");
    let (instrument, handle) = keithley();
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    handle.on_command(move |cmd| {
        if cmd == ":OUTP OFF" {
            trigger.trigger();
        }
    });

    let mut sequencer = TestSequencer::with_clock(
        instrument,
        two_cycle_plan(),
        CsvSink::create(&path).unwrap(),
        ManualClock::new(),
    )
    .with_interrupt(interrupt);

    let err = sequencer.run().unwrap_err();
    assert!(matches!(err, DaqError::TestAborted));
    assert_eq!(sequencer.state(), SequencerState::Aborted);

    // one transition off, one cleanup off, one local
    assert_eq!(handle.count(":OUTP OFF"), 2);
    assert_eq!(handle.count("SYST:LOC"), 1);
    assert_eq!(handle.count(":OUTP ON"), 1);

    let result = sequencer.result();
    assert_eq!(result.len(), 2);
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), result.len() + 1);
}

#[test]
fn test_interrupt_after_rest_samples_keeps_flushed_rows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("aborted_rest.csv");
    let (instrument, handle) = keithley();
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    let mut reads = 0;
    // second rest sample of cycle 1, before the sleep to the end of rest
    handle.on_command(move |cmd| {
        if cmd == ":READ?" {
            reads += 1;
            if reads == 4 {
                trigger.trigger();
            }
        }
    });

    let mut sequencer = TestSequencer::with_clock(
        instrument,
        two_cycle_plan(),
        CsvSink::create(&path).unwrap(),
        ManualClock::new(),
    )
    .with_interrupt(interrupt);

    assert!(matches!(sequencer.run(), Err(DaqError::TestAborted)));
    assert_eq!(sequencer.state(), SequencerState::Aborted);

    let result = sequencer.result();
    let phases: Vec<Phase> = result.measurements().iter().map(|m| m.phase).collect();
    assert_eq!(phases, vec![Phase::Pulse, Phase::Pulse, Phase::Rest, Phase::Rest]);
    assert_file_matches(&path, result);

    assert_eq!(handle.count(":OUTP ON"), 1);
    assert_eq!(handle.count(":OUTP OFF"), 2);
    assert_eq!(handle.count("SYST:LOC"), 1);
}

#[test]
fn test_interrupt_wakes_rest_sleep_on_wall_clock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("aborted_wall.csv");
    let (instrument, handle) = keithley();
    let plan = TestPlan {
        pulse_duration: Duration::from_millis(300),
        rest_duration: Duration::from_secs(1),
        sample_interval: Duration::from_millis(100),
        ..two_cycle_plan()
    };
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    let operator = thread::spawn(move || {
        thread::sleep(Duration::from_millis(650));
        trigger.trigger();
    });

    let mut sequencer =
        TestSequencer::new(instrument, plan, CsvSink::create(&path).unwrap()).with_interrupt(interrupt);
    let outcome = sequencer.run();
    operator.join().unwrap();

    assert!(matches!(outcome, Err(DaqError::TestAborted)));
    assert_eq!(sequencer.state(), SequencerState::Aborted);

    let result = sequencer.result();
    let rest = result
        .measurements()
        .iter()
        .filter(|m| m.phase == Phase::Rest)
        .count();
    assert!(rest >= 2, "expected rest samples before the interrupt, got {}", rest);
    assert!(result.measurements()[..3].iter().all(|m| m.phase == Phase::Pulse));
    assert_file_matches(&path, result);

    assert_eq!(handle.count(":OUTP ON"), 1);
    assert_eq!(handle.count(":OUTP OFF"), 2);
    assert_eq!(handle.count("SYST:LOC"), 1);
}

#[test]
fn test_battery_mode_rest_current() {
    let (instrument, handle) = keithley();
    let plan = TestPlan {
        mode: bench_daq::instrument::OutputMode::BatteryTest,
        rest_current: Some(0.1),
        cycle_count: 1,
        ..two_cycle_plan()
    };
    let mut sequencer =
        TestSequencer::with_clock(instrument, plan, MemorySink::new(), ManualClock::new());
    sequencer.run().unwrap();

    let writes = handle.writes();
    let on = writes.iter().position(|w| w == ":BATT:OUTP ON").unwrap();
    let off = writes.iter().position(|w| w == ":BATT:OUTP OFF").unwrap();
    assert_eq!(writes[on - 1], ":BATT:TEST:CURR:LIM:SOUR 1");
    assert_eq!(writes[off + 1], ":BATT:TEST:CURR:LIM:SOUR 0.1");
    assert_eq!(writes.last().map(String::as_str), Some("SYST:LOC"));
}
