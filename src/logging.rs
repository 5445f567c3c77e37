//! Log subscriber setup.
//!
//! Orchestration code logs through `tracing`, the transport adapters through `log`.
//! [`init`] installs one `tracing-subscriber` formatter that receives both.

use crate::config::Settings;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber at `level`.
///
/// `RUST_LOG`, when set, replaces `level`. With `json` the output is one JSON
/// object per line.
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the filter is invalid.
pub fn init(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

/// Install the subscriber described by `[application]`.
pub fn init_from_settings(settings: &Settings) -> anyhow::Result<()> {
    init(&settings.application.log_level, settings.application.log_json)
}
