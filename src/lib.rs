//! Bench instrument control and pulse-test orchestration.
//!
//! `bench_daq` talks to programmable power supplies, battery testers and
//! electronic loads over serial, VISA or raw TCP links and runs timed pulse/rest
//! test sequences against them, streaming every measurement to a CSV file.
//!
//! # Layers
//!
//! - [`adapters`]: the [`adapters::TransportChannel`] contract and its serial,
//!   VISA, socket and mock implementations
//! - [`instrument`]: sessions, command templates, response parsing and the
//!   [`instrument::Instrument`] controller
//! - [`experiment`]: test plans, the [`experiment::TestSequencer`] state machine,
//!   model export, current profile replay and completion polling
//! - [`data`] / [`measurement`]: result records and sinks
//! - [`config`] / [`logging`]: ambient setup used by the `bench_daq` binary
//!
//! # Example
//!
//! ```no_run
//! use bench_daq::adapters::MockAdapter;
//! use bench_daq::data::CsvSink;
//! use bench_daq::experiment::{TestPlan, TestSequencer};
//! use bench_daq::instrument::{DeviceSession, DeviceSpec, Instrument};
//!
//! # fn main() -> bench_daq::error::AppResult<()> {
//! let session = DeviceSession::open("sim", MockAdapter::battery_simulator())?;
//! let instrument = Instrument::new(session, DeviceSpec::keithley_2281s());
//! let sink = CsvSink::create("results/pulse.csv")?;
//! let mut sequencer = TestSequencer::new(instrument, TestPlan::default(), sink);
//! sequencer.run()?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod measurement;
