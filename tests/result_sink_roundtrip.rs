//! Result files read back with a CSV reader.

use bench_daq::adapters::MockAdapter;
use bench_daq::data::{CsvSink, ResultSink};
use bench_daq::experiment::{ManualClock, ModelExportPlan, ModelExportRun, TestPlan, TestSequencer};
use bench_daq::instrument::{DeviceSession, DeviceSpec, Instrument};
use bench_daq::measurement::ModelRow;
use std::time::Duration;
use tempfile::tempdir;

fn keithley() -> Instrument<MockAdapter> {
    let session = DeviceSession::open("k2281s", MockAdapter::battery_simulator()).unwrap();
    Instrument::new(session, DeviceSpec::keithley_2281s())
}

#[test]
fn test_pulse_file_matches_result() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("runs").join("pulse.csv");
    let plan = TestPlan {
        pulse_duration: Duration::from_secs(3),
        rest_duration: Duration::from_secs(3),
        cycle_count: 2,
        sample_interval: Duration::from_millis(1500),
        ..TestPlan::default()
    };

    let sink = CsvSink::create(&path).unwrap();
    let mut sequencer = TestSequencer::with_clock(keithley(), plan, sink, ManualClock::new());
    sequencer.run().unwrap();
    assert_eq!(sequencer.sink().rows_written(), sequencer.result().len());

    let mut reader = csv::Reader::from_path(&path).unwrap();
    assert_eq!(
        reader.headers().unwrap(),
        vec!["elapsed_s", "phase", "volt_v", "curr_a"]
    );
    let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(records.len(), sequencer.result().len());

    for (record, measurement) in records.iter().zip(sequencer.result().measurements()) {
        let elapsed: f64 = record[0].parse().unwrap();
        assert!((elapsed - measurement.elapsed.as_secs_f64()).abs() < 1e-3);
        assert_eq!(&record[1], measurement.phase.label());
        let volt: f64 = record[2].parse().unwrap();
        assert_eq!(Some(volt), measurement.voltage.value());
        let curr: f64 = record[3].parse().unwrap();
        assert_eq!(Some(curr), measurement.current.value());
    }
    assert_eq!(&records[0][0], "0.000");
    assert_eq!(&records[1][0], "1.500");
}

#[test]
fn test_model_file_matches_rows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.csv");
    let plan = ModelExportPlan {
        slot: 2,
        discharge: None,
        full_voltage: 4.2,
        current_limit: 1.0,
        esr_interval_s: 30,
        model_min_voltage: 2.5,
        model_max_voltage: 4.2,
        poll_interval: Duration::from_secs(3),
        timeout: Duration::from_secs(3600),
        rows: None,
    };

    let sink = CsvSink::<ModelRow>::create(&path).unwrap();
    let mut export = ModelExportRun::with_clock(keithley(), plan, sink, ManualClock::new());
    assert_eq!(export.run().unwrap(), 11);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    assert_eq!(reader.headers().unwrap(), vec!["SOC(%)", "volt_v", "esr_ohm"]);
    let soc: Vec<String> = reader
        .records()
        .map(|r| r.unwrap()[0].to_string())
        .collect();
    assert_eq!(soc.len(), 11);
    assert_eq!(soc[0], "0.00");
    assert_eq!(soc[3], "30.00");
    assert_eq!(soc[10], "100.00");
}

#[test]
fn test_partial_file_readable_without_finalize() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.csv");
    let mut sink = CsvSink::<ModelRow>::create(&path).unwrap();
    sink.append(&ModelRow {
        soc_pct: 0.0,
        volt_v: 3.0,
        esr_ohm: 0.09,
    })
    .unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    assert_eq!(reader.records().count(), 1);
    drop(sink);
}
