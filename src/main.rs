//! `bench_daq` command line.
//!
//! ```text
//! bench_daq --config config/bench_daq.toml pulse --plan standard
//! bench_daq --instrument k2281s model-export --plan slot4
//! bench_daq profile --plan drive_cycle
//! bench_daq identify
//! bench_daq local
//! ```

use anyhow::{Context, Result};
use bench_daq::adapters::{MockAdapter, Transport};
use bench_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use bench_daq::data::CsvSink;
use bench_daq::error::DaqError;
use bench_daq::experiment::{
    CurrentProfile, Interrupt, ModelExportRun, ProfileRun, SequencerState, TestSequencer,
};
use bench_daq::instrument::{DeviceSession, DeviceSpec, Instrument};
use bench_daq::logging;
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Bench instrument control and pulse testing
#[derive(Parser, Debug)]
#[command(name = "bench_daq", version)]
#[command(about = "Pulse tests and battery model export for bench instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Instrument id from the configuration; defaults to the configured default
    #[arg(short, long, global = true)]
    instrument: Option<String>,

    /// Talk to a simulated battery instead of the configured transport
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pulse/rest test plan
    Pulse {
        /// Plan name under [plans]
        #[arg(short, long)]
        plan: String,
        /// Result file; defaults to a timestamped file in the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Characterize a battery and export its model
    ModelExport {
        /// Plan name under [model_exports]
        #[arg(short, long)]
        plan: String,
        /// Result file; defaults to a timestamped file in the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replay a time/current profile file
    Profile {
        /// Profile name under [profiles]
        #[arg(short, long)]
        plan: String,
        /// Result file; defaults to a timestamped file in the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the instrument identification string
    Identify,
    /// Turn the output off and return the instrument to front-panel control
    Local,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration '{}': {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init_from_settings(&settings) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, settings: &Settings) -> Result<()> {
    match &cli.command {
        Command::Pulse { plan, output } => run_pulse(cli, settings, plan, output.as_deref()),
        Command::ModelExport { plan, output } => {
            run_model_export(cli, settings, plan, output.as_deref())
        }
        Command::Profile { plan, output } => run_profile(cli, settings, plan, output.as_deref()),
        Command::Identify => {
            let mut instrument = open_instrument(cli, settings)?;
            let idn = instrument.identify()?;
            println!("{}", idn);
            Ok(())
        }
        Command::Local => {
            let mut instrument = open_instrument(cli, settings)?;
            let failures = instrument.restore_safe_state();
            instrument.session_mut().close();
            if failures.is_empty() {
                info!("instrument returned to local control");
                Ok(())
            } else {
                Err(DaqError::ShutdownFailed(failures).into())
            }
        }
    }
}

fn run_pulse(cli: &Cli, settings: &Settings, plan_name: &str, output: Option<&Path>) -> Result<()> {
    let plan = settings.plan(plan_name)?.clone();
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(settings, "pulse", plan_name));

    let instrument = open_instrument(cli, settings)?;
    let sink = CsvSink::create(&path)
        .with_context(|| format!("cannot create result file '{}'", path.display()))?;
    info!(
        plan = plan_name,
        file = %path.display(),
        cycles = plan.cycle_count,
        nominal = ?plan.nominal_duration(),
        "starting pulse test"
    );

    let interrupt = install_interrupt()?;
    let mut sequencer = TestSequencer::new(instrument, plan, sink).with_interrupt(interrupt);
    let outcome = sequencer.run();
    println!(
        "{}: {} sample(s), {} unavailable, written to {}",
        sequencer.state(),
        sequencer.result().len(),
        sequencer.result().unavailable_count(),
        path.display()
    );
    if sequencer.state() == SequencerState::Aborted {
        warn!("test aborted by operator");
    }
    outcome.with_context(|| format!("pulse test '{}' did not complete", plan_name))
}

fn run_model_export(
    cli: &Cli,
    settings: &Settings,
    plan_name: &str,
    output: Option<&Path>,
) -> Result<()> {
    let plan = settings.model_export(plan_name)?.clone();
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(settings, "model", plan_name));

    let instrument = open_instrument(cli, settings)?;
    let sink = CsvSink::create(&path)
        .with_context(|| format!("cannot create result file '{}'", path.display()))?;
    info!(plan = plan_name, slot = plan.slot, file = %path.display(), "starting model export");

    let interrupt = install_interrupt()?;
    let mut export = ModelExportRun::new(instrument, plan, sink).with_interrupt(interrupt);
    let rows = export
        .run()
        .with_context(|| format!("model export '{}' did not complete", plan_name))?;
    println!("{} model row(s) written to {}", rows, path.display());
    Ok(())
}

fn run_profile(cli: &Cli, settings: &Settings, plan_name: &str, output: Option<&Path>) -> Result<()> {
    let plan = settings.profile(plan_name)?.clone();
    let profile = CurrentProfile::load(&plan.profile)
        .with_context(|| format!("cannot read profile '{}'", plan.profile.display()))?;
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(settings, "profile", plan_name));

    let instrument = open_instrument(cli, settings)?;
    let sink = CsvSink::create(&path)
        .with_context(|| format!("cannot create result file '{}'", path.display()))?;
    info!(
        plan = plan_name,
        file = %path.display(),
        steps = profile.len(),
        "starting current profile"
    );

    let interrupt = install_interrupt()?;
    let mut run = ProfileRun::new(instrument, plan, profile, sink).with_interrupt(interrupt);
    let rows = run
        .run()
        .with_context(|| format!("current profile '{}' did not complete", plan_name))?;
    println!("{} profile step(s) written to {}", rows, path.display());
    Ok(())
}

/// Open a session to the selected instrument, or to the simulator.
fn open_instrument(cli: &Cli, settings: &Settings) -> Result<Instrument<Transport>> {
    if cli.simulate {
        let spec = match settings.select_instrument(cli.instrument.as_deref()) {
            Ok(definition) => settings.device_spec(&definition.id)?,
            Err(_) => DeviceSpec::keithley_2281s(),
        };
        info!(device = %spec.name, "using simulated instrument");
        let session = DeviceSession::open(
            "simulator",
            Transport::Mock(MockAdapter::battery_simulator()),
        )?;
        return Ok(Instrument::new(session, spec));
    }

    let definition = settings.select_instrument(cli.instrument.as_deref())?;
    let spec = settings.device_spec(&definition.id)?;
    let session = DeviceSession::from_config(definition.id.clone(), &definition.transport)
        .with_context(|| {
            format!(
                "cannot open instrument '{}' at {}",
                definition.id,
                definition.transport.address()
            )
        })?;
    Ok(Instrument::new(session, spec))
}

/// Route Ctrl+C to the run's interrupt so it stops through cleanup.
fn install_interrupt() -> Result<Interrupt> {
    let interrupt = Interrupt::new();
    let handle = interrupt.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal. Stopping test...");
        handle.trigger();
    })
    .context("failed to set signal handler")?;
    Ok(interrupt)
}

fn default_output(settings: &Settings, kind: &str, name: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    settings
        .storage
        .output_dir
        .join(format!("{}_{}_{}.csv", kind, name, stamp))
}
