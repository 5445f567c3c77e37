//! Raw TCP socket adapter for LAN-attached instruments (SCPI-raw, port 5025 style).

use super::{
    discard_late_reply, frame, late_reply_window, read_terminated, SocketConfig,
    TransportChannel,
};
use crate::error::{AppResult, DaqError};
use log::{debug, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// TCP socket adapter
///
/// Commands are framed with `\n`, Nagle is disabled, and replies are read until
/// `\n` or the per-command timeout. Input still buffered when a query starts is
/// dropped first.
pub struct SocketAdapter {
    host: String,
    port: u16,
    timeout: Duration,
    line_terminator: String,
    stream: Option<TcpStream>,
    /// A query timed out and its reply may still arrive.
    reply_pending: bool,
}

impl SocketAdapter {
    /// Create an adapter for `host:port` with a 15 s timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(15),
            line_terminator: "\n".to_string(),
            stream: None,
            reply_pending: false,
        }
    }

    /// Build from a transport configuration entry.
    pub fn from_config(config: &SocketConfig) -> Self {
        Self::new(config.host.clone(), config.port).with_timeout(config.timeout)
    }

    /// Set the connect and per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stream_mut(&mut self) -> AppResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(DaqError::NotConnected)
    }

    /// Drop whatever the instrument sent that no query is waiting for.
    fn discard_stale_input(&mut self) -> AppResult<()> {
        let wait = late_reply_window(self.timeout);
        let mut pending = self.reply_pending;
        self.reply_pending = false;
        let stream = self.stream.as_mut().ok_or(DaqError::NotConnected)?;

        let setup = |e: std::io::Error| DaqError::Connection(format!("socket setup failed: {}", e));
        stream.set_nonblocking(true).map_err(setup)?;
        let mut buffer = [0u8; 256];
        let mut discarded = 0usize;
        let drained = loop {
            match stream.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    discarded += n;
                    if buffer[..n].contains(&b'\n') {
                        pending = false;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    break Err(DaqError::Connection(format!("socket read failed: {}", e)))
                }
            }
        };
        stream.set_nonblocking(false).map_err(setup)?;
        drained?;
        if discarded > 0 {
            warn!("Discarded {} stale byte(s) from {}:{}", discarded, self.host, self.port);
        }

        if pending {
            match discard_late_reply(stream, b'\n', wait) {
                Some(late) => warn!("Discarded late socket reply: {}", late),
                None => debug!("No late reply arrived within {:?}", wait),
            }
        }
        Ok(())
    }

    fn send(&mut self, command: &str) -> AppResult<()> {
        let framed = frame(command, &self.line_terminator);
        let timeout = self.timeout;
        let stream = self.stream_mut()?;
        stream.write_all(framed.as_bytes()).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                DaqError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                }
            } else {
                DaqError::Connection(format!("socket write failed: {}", e))
            }
        })?;
        debug!("Sent socket command: {}", command.trim());
        Ok(())
    }
}

impl TransportChannel for SocketAdapter {
    fn connect(&mut self) -> AppResult<()> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = target
            .to_socket_addrs()
            .map_err(|e| DaqError::Connection(format!("cannot resolve '{}': {}", target, e)))?
            .next()
            .ok_or_else(|| DaqError::Connection(format!("no address for '{}'", target)))?;

        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| DaqError::Connection(format!("connect to '{}' failed: {}", target, e)))?;
        stream
            .set_nodelay(true)
            .and_then(|()| stream.set_read_timeout(Some(self.timeout)))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| DaqError::Connection(format!("socket setup failed: {}", e)))?;

        self.stream = Some(stream);
        debug!("Socket connected to {}", target);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.reply_pending = false;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("Socket {}:{} closed", self.host, self.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn write(&mut self, command: &str) -> AppResult<()> {
        self.send(command)
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        self.discard_stale_input()?;
        self.send(command)?;
        let timeout = self.timeout;
        let stream = self.stream_mut()?;
        let response = match read_terminated(stream, b'\n', timeout, command) {
            Err(err @ DaqError::CommandTimeout { .. }) => {
                self.reply_pending = true;
                return Err(err);
            }
            other => other?,
        };
        debug!("Received socket response: {}", response);
        Ok(response)
    }

    fn info(&self) -> String {
        format!("Socket({}:{})", self.host, self.port)
    }
}

impl Drop for SocketAdapter {
    fn drop(&mut self) {
        self.disconnect();
    }
}
