//! Transport adapters
//!
//! This module contains the implementations of [`TransportChannel`], the single
//! connect/write/query contract shared by every physical link a bench instrument
//! can be reached over:
//!
//! - [`SerialAdapter`]: RS-232 / USB-serial via the `serialport` crate
//! - [`VisaAdapter`]: USBTMC, GPIB and ASRL resources via `visa-rs`
//! - [`SocketAdapter`]: raw TCP sockets
//! - [`MockAdapter`]: scripted responder for tests and simulation
//!
//! Transport quirks (terminators, read delays, flow control) live in the adapters.
//! Dispatch is static: [`Transport`] is chosen once from a [`TransportConfig`] when the
//! session is built.

pub mod mock;
pub mod serial_adapter;
pub mod socket_adapter;
pub mod visa_adapter;

pub use mock::MockAdapter;
pub use serial_adapter::SerialAdapter;
pub use socket_adapter::SocketAdapter;
pub use visa_adapter::VisaAdapter;

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

/// Connect/write/query contract implemented by every transport.
///
/// `write` and `query` take the command text without a terminator; the adapter
/// appends its own. Both fail with [`DaqError::NotConnected`] before `connect`.
pub trait TransportChannel {
    /// Establish the physical link.
    fn connect(&mut self) -> AppResult<()>;

    /// Close the underlying handle. Safe to call repeatedly, never fails.
    fn disconnect(&mut self);

    /// Whether `connect` succeeded and `disconnect` has not been called since.
    fn is_connected(&self) -> bool;

    /// Send a command. No response is read.
    fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and block until the terminated response or the timeout.
    ///
    /// Returns the decoded response with the terminator stripped. After a
    /// [`DaqError::CommandTimeout`] the adapter drops the late reply before the next
    /// query reads, so responses never shift onto later commands.
    fn query(&mut self, command: &str) -> AppResult<String>;

    /// Human-readable description of the link, used in log lines.
    fn info(&self) -> String;
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Serial stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    #[serde(rename = "1")]
    One,
    /// Two stop bits.
    #[serde(rename = "2")]
    Two,
}

/// Serial link parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits, 5 to 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity.
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits.
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Enable RTS/CTS hardware flow control.
    #[serde(default)]
    pub hardware_flow_control: bool,
    /// Per-command timeout.
    #[serde(default = "default_serial_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Idle time between sending a query and reading its response.
    #[serde(default = "default_read_delay", with = "humantime_serde")]
    pub read_delay: Duration,
}

/// Raw TCP socket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Per-command timeout, also used for connecting.
    #[serde(default = "default_socket_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// VISA resource parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisaConfig {
    /// VISA resource string (e.g. "USB0::0x05E6::0x2281::4587429::INSTR", "ASRL3::INSTR").
    pub resource: String,
    /// Per-command timeout.
    #[serde(default = "default_visa_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Transport selection, immutable once a session is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial port.
    Serial(SerialConfig),
    /// VISA resource.
    Visa(VisaConfig),
    /// Raw TCP socket.
    Socket(SocketConfig),
}

impl TransportConfig {
    /// Address of the instrument on its link.
    pub fn address(&self) -> String {
        match self {
            Self::Serial(c) => c.port.clone(),
            Self::Visa(c) => c.resource.clone(),
            Self::Socket(c) => format!("{}:{}", c.host, c.port),
        }
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Serial(c) => c.timeout,
            Self::Visa(c) => c.timeout,
            Self::Socket(c) => c.timeout,
        }
    }

    /// Check addresses and framing values before any port is touched.
    pub fn validate(&self) -> AppResult<()> {
        if self.address().trim().is_empty() || self.address().starts_with(':') {
            return Err(DaqError::Configuration(
                "transport address must not be empty".to_string(),
            ));
        }
        if self.timeout().is_zero() {
            return Err(DaqError::Configuration(format!(
                "transport timeout for '{}' must be greater than zero",
                self.address()
            )));
        }
        if let Self::Serial(c) = self {
            if !(5..=8).contains(&c.data_bits) {
                return Err(DaqError::Configuration(format!(
                    "serial data bits must be 5-8, got {}",
                    c.data_bits
                )));
            }
            if c.baud_rate == 0 {
                return Err(DaqError::Configuration(
                    "serial baud rate must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_serial_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_read_delay() -> Duration {
    Duration::from_millis(300)
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_visa_timeout() -> Duration {
    Duration::from_secs(5)
}

/// A transport chosen at session-construction time.
pub enum Transport {
    /// Serial port.
    Serial(SerialAdapter),
    /// VISA resource.
    Visa(VisaAdapter),
    /// Raw TCP socket.
    Socket(SocketAdapter),
    /// In-process responder.
    Mock(MockAdapter),
}

impl Transport {
    /// Build the adapter described by `config`. No I/O happens until `connect`.
    pub fn from_config(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Serial(c) => Self::Serial(SerialAdapter::from_config(c)),
            TransportConfig::Visa(c) => Self::Visa(VisaAdapter::from_config(c)),
            TransportConfig::Socket(c) => Self::Socket(SocketAdapter::from_config(c)),
        }
    }

    fn channel(&self) -> &dyn TransportChannel {
        match self {
            Self::Serial(a) => a,
            Self::Visa(a) => a,
            Self::Socket(a) => a,
            Self::Mock(a) => a,
        }
    }

    fn channel_mut(&mut self) -> &mut dyn TransportChannel {
        match self {
            Self::Serial(a) => a,
            Self::Visa(a) => a,
            Self::Socket(a) => a,
            Self::Mock(a) => a,
        }
    }
}

impl TransportChannel for Transport {
    fn connect(&mut self) -> AppResult<()> {
        self.channel_mut().connect()
    }

    fn disconnect(&mut self) {
        self.channel_mut().disconnect()
    }

    fn is_connected(&self) -> bool {
        self.channel().is_connected()
    }

    fn write(&mut self, command: &str) -> AppResult<()> {
        self.channel_mut().write(command)
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        self.channel_mut().query(command)
    }

    fn info(&self) -> String {
        self.channel().info()
    }
}

/// Read from `reader` until `delimiter` is seen or `timeout` elapses.
///
/// Read timeouts reported by the underlying handle are retried until the overall
/// deadline. The returned text is trimmed of the terminator and surrounding
/// whitespace.
pub(crate) fn read_terminated<R: Read + ?Sized>(
    reader: &mut R,
    delimiter: u8,
    timeout: Duration,
    command: &str,
) -> AppResult<String> {
    let mut response: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 256];
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(DaqError::CommandTimeout {
                command: command.to_string(),
                timeout,
            });
        }

        match reader.read(&mut buffer) {
            Ok(0) => {
                return Err(DaqError::Connection(format!(
                    "connection closed while waiting for response to '{}'",
                    command
                )));
            }
            Ok(n) => {
                response.extend_from_slice(&buffer[..n]);
                if let Some(pos) = response.iter().position(|b| *b == delimiter) {
                    response.truncate(pos);
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                // Handle timeout is shorter than our overall timeout
                continue;
            }
            Err(e) => {
                return Err(DaqError::Connection(format!(
                    "read failed for '{}': {}",
                    command, e
                )));
            }
        }
    }

    let text = String::from_utf8(response).map_err(|e| {
        DaqError::ProtocolParse(format!("non UTF-8 response to '{}': {}", command, e))
    })?;
    Ok(text.trim().to_string())
}

/// Wait up to `wait` for the reply of a query that already timed out and drop it.
///
/// Returns the dropped text, or `None` if nothing terminated arrived in time.
pub(crate) fn discard_late_reply<R: Read + ?Sized>(
    reader: &mut R,
    delimiter: u8,
    wait: Duration,
) -> Option<String> {
    read_terminated(reader, delimiter, wait, "late reply").ok()
}

/// How long the next query waits for the reply of a timed-out one.
pub(crate) fn late_reply_window(timeout: Duration) -> Duration {
    timeout.saturating_mul(2)
}

/// Append `terminator` to `command` unless it already ends with it.
pub(crate) fn frame(command: &str, terminator: &str) -> String {
    let trimmed = command.trim_end_matches(['\r', '\n']);
    format!("{}{}", trimmed, terminator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields one chunk per call, then reports timeouts.
    struct Chunked {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.chunks.is_empty() {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_read_terminated_strips_terminator() {
        let mut reader = Cursor::new(b"KEITHLEY INSTRUMENTS,MODEL 2281S-20-6\r\n".to_vec());
        let text = read_terminated(&mut reader, b'\n', Duration::from_secs(1), "*IDN?").unwrap();
        assert_eq!(text, "KEITHLEY INSTRUMENTS,MODEL 2281S-20-6");
    }

    #[test]
    fn test_read_terminated_accumulates_split_reply() {
        let mut reader = Chunked {
            chunks: vec![b"+1.2".to_vec(), b"34E+00".to_vec(), b"\n".to_vec()],
        };
        let text =
            read_terminated(&mut reader, b'\n', Duration::from_secs(1), "MEAS:VOLT?").unwrap();
        assert_eq!(text, "+1.234E+00");
    }

    #[test]
    fn test_read_terminated_times_out() {
        let mut reader = Chunked { chunks: vec![] };
        let err = read_terminated(&mut reader, b'\n', Duration::from_millis(20), "MEAS:CURR?")
            .unwrap_err();
        assert!(matches!(err, DaqError::CommandTimeout { ref command, .. } if command == "MEAS:CURR?"));
    }

    #[test]
    fn test_read_terminated_rejects_invalid_utf8() {
        let mut reader = Cursor::new(vec![0xff, 0xfe, b'\n']);
        let err = read_terminated(&mut reader, b'\n', Duration::from_secs(1), "*IDN?").unwrap_err();
        assert!(matches!(err, DaqError::ProtocolParse(_)));
    }

    #[test]
    fn test_read_terminated_eof_is_connection_error() {
        let mut reader = Cursor::new(b"partial".to_vec());
        let err = read_terminated(&mut reader, b'\n', Duration::from_secs(1), "*IDN?").unwrap_err();
        assert!(err.is_connection());
    }

    #[test]
    fn test_discard_late_reply() {
        let mut reader = Chunked {
            chunks: vec![b"+3.9".to_vec(), b"5E+00\n".to_vec()],
        };
        let dropped = discard_late_reply(&mut reader, b'\n', Duration::from_secs(1));
        assert_eq!(dropped.as_deref(), Some("+3.95E+00"));

        let mut silent = Chunked { chunks: vec![] };
        assert!(discard_late_reply(&mut silent, b'\n', Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_late_reply_window_doubles_timeout() {
        assert_eq!(late_reply_window(Duration::from_millis(200)), Duration::from_millis(400));
        assert_eq!(late_reply_window(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_frame_appends_terminator_once() {
        assert_eq!(frame("*IDN?", "\r\n"), "*IDN?\r\n");
        assert_eq!(frame("*IDN?\n", "\r\n"), "*IDN?\r\n");
    }

    #[test]
    fn test_transport_config_validation() {
        let cfg = TransportConfig::Socket(SocketConfig {
            host: String::new(),
            port: 5025,
            timeout: Duration::from_secs(1),
        });
        assert!(cfg.validate().is_err());

        let cfg = TransportConfig::Serial(SerialConfig {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            data_bits: 9,
            parity: Parity::None,
            stop_bits: StopBits::One,
            hardware_flow_control: false,
            timeout: Duration::from_secs(1),
            read_delay: Duration::ZERO,
        });
        assert!(cfg.validate().is_err());
    }
}
