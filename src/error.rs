//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the transport
//! adapters, the instrument controller and the test orchestration layer. Using the
//! `thiserror` crate, it provides one consistent way to report everything from a
//! missing serial port to a battery test that never signalled completion.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`** / **`NotConnected`**: the transport could not be opened, or a
//!   command was issued on a channel that is not open.
//! - **`CommandTimeout`**: a single write/query round trip exceeded the transport timeout.
//! - **`ProtocolParse`**: the transport delivered bytes that could not be decoded.
//! - **`Validation`**: a caller-supplied parameter lies outside the instrument envelope.
//!   Raised before any I/O takes place.
//! - **`TestTimeout`**: a wait-for-completion exceeded its wall-clock bound. This is a
//!   test-level timeout and is never produced by the transport itself.
//! - **`TestAborted`**: an operator interrupt was observed during a run.
//! - **`Config`** / **`Configuration`**: configuration file or semantic errors.
//! - **`FeatureNotEnabled`**: a transport was requested that was not compiled in.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types with `?`.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Transport unreachable or misconfigured.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command was issued before `connect` or after `disconnect`.
    #[error("Connection error: not connected")]
    NotConnected,

    /// A single round trip exceeded the transport timeout.
    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout {
        /// Command text without terminator.
        command: String,
        /// Configured per-command timeout.
        timeout: Duration,
    },

    /// Malformed response bytes.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// Parameter outside the instrument operating envelope.
    #[error("Invalid {parameter}: {value} (allowed range {min}..={max})")]
    Validation {
        /// Name of the rejected parameter.
        parameter: String,
        /// Rejected value.
        value: f64,
        /// Lower bound (inclusive).
        min: f64,
        /// Upper bound (inclusive).
        max: f64,
    },

    /// Wait-for-completion exceeded its wall-clock bound.
    #[error("Test timed out after {0:?} waiting for completion")]
    TestTimeout(Duration),

    /// External interrupt observed during a run.
    #[error("Test aborted by operator interrupt")]
    TestAborted,

    /// Configuration file could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error outside of an instrument round trip.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Result file error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Requested transport was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// One or more shutdown steps failed.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Build a validation error for `parameter`.
    pub fn validation(parameter: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        Self::Validation {
            parameter: parameter.into(),
            value,
            min,
            max,
        }
    }

    /// True for failures of the physical link or of decoding its bytes.
    ///
    /// These are the errors a sampling loop may downgrade to an unavailable reading.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::NotConnected
                | Self::CommandTimeout { .. }
                | Self::ProtocolParse(_)
                | Self::Io(_)
        )
    }

    /// True for `Connection` and `NotConnected`.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected)
    }
}
