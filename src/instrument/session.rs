//! Device sessions: one connected transport per instrument, closed exactly once.

use super::codec::Command;
use crate::adapters::{Transport, TransportChannel, TransportConfig};
use crate::error::{AppResult, DaqError};
use tracing::{debug, info};

/// Exclusive, scoped ownership of one open transport.
///
/// `open` connects, `close` (or dropping the session) disconnects. Every command
/// takes `&mut self`, so a second command cannot be issued on the link until the
/// previous one has returned or timed out.
pub struct DeviceSession<T: TransportChannel> {
    id: String,
    transport: T,
}

impl DeviceSession<Transport> {
    /// Validate `config`, build the matching adapter and connect it.
    pub fn from_config(id: impl Into<String>, config: &TransportConfig) -> AppResult<Self> {
        config.validate()?;
        Self::open(id, Transport::from_config(config))
    }
}

impl<T: TransportChannel> DeviceSession<T> {
    /// Connect `transport` and take ownership of it.
    pub fn open(id: impl Into<String>, mut transport: T) -> AppResult<Self> {
        let id = id.into();
        transport.connect()?;
        info!(instrument = %id, link = %transport.info(), "session opened");
        Ok(Self { id, transport })
    }

    /// Instrument identifier used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the underlying link is still connected.
    pub fn is_open(&self) -> bool {
        self.transport.is_connected()
    }

    /// Disconnect. Safe to call more than once.
    pub fn close(&mut self) {
        if self.transport.is_connected() {
            self.transport.disconnect();
            info!(instrument = %self.id, "session closed");
        }
    }

    /// Send a command that produces no response.
    pub fn write(&mut self, command: &Command) -> AppResult<()> {
        self.ensure_open()?;
        debug!(instrument = %self.id, command = %command, "write");
        self.transport.write(command.text())
    }

    /// Send a command and return its response.
    pub fn query(&mut self, command: &Command) -> AppResult<String> {
        self.ensure_open()?;
        let response = self.transport.query(command.text())?;
        debug!(instrument = %self.id, command = %command, response = %response, "query");
        Ok(response)
    }

    /// Write or query depending on the command.
    pub fn execute(&mut self, command: &Command) -> AppResult<Option<String>> {
        if command.expects_response() {
            self.query(command).map(Some)
        } else {
            self.write(command).map(|()| None)
        }
    }

    /// The owned transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(DaqError::NotConnected)
        }
    }
}

impl<T: TransportChannel> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}
