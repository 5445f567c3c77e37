//! Test orchestration.
//!
//! - [`plan`]: declarative test definitions loaded from configuration
//! - [`sequencer`]: the pulse/rest state machine
//! - [`model_export`]: battery model characterization and export
//! - [`profile`]: replay of a time/current profile file
//! - [`waiter`]: clocks, interrupts and completion polling shared by the runs
//!
//! Runs are synchronous. A run owns its instrument for its whole lifetime and
//! releases it through the same safe-state cleanup however it ends.

pub mod model_export;
pub mod plan;
pub mod profile;
pub mod sequencer;
pub mod waiter;

pub use model_export::ModelExportRun;
pub use plan::{
    CompletionPolicy, CurrentProfilePlan, DischargeSettings, ModelExportPlan, RampStep, TestPlan,
};
pub use profile::{CurrentProfile, ProfileRun, ProfileStep};
pub use sequencer::{SequencerState, TestSequencer};
pub use waiter::{Clock, Interrupt, ManualClock, PollingWaiter, SystemClock};
