//! Serial port adapter for RS-232 and USB-serial instruments.

use super::{Parity, SerialConfig, StopBits, TransportChannel};
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use super::{discard_late_reply, frame, late_reply_window, read_terminated};
#[cfg(feature = "instrument_serial")]
use log::{debug, warn};

#[cfg(feature = "instrument_serial")]
use serialport::{ClearBuffer, SerialPort};

/// Serial adapter for RS-232 / USB-serial communication
///
/// Frames every command with `\r\n` and reads until `\n`. Queries wait
/// `read_delay` after writing before the first read, for firmware that is slow to
/// start answering. The input buffer is cleared before every query.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    data_bits: u8,
    parity: Parity,
    stop_bits: StopBits,
    hardware_flow_control: bool,

    /// Overall read timeout per query
    timeout: Duration,

    /// Delay between write and read in a query
    read_delay: Duration,

    /// Line terminator for commands
    line_terminator: String,

    /// Response line ending character
    response_delimiter: u8,

    /// A query timed out and its reply may still arrive.
    #[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
    reply_pending: bool,

    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialAdapter {
    /// Create a new serial adapter with 8-N-1 framing and default timeouts
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            hardware_flow_control: false,
            timeout: Duration::from_secs(2),
            read_delay: Duration::from_millis(300),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            reply_pending: false,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Build from a transport configuration entry.
    pub fn from_config(config: &SerialConfig) -> Self {
        let mut adapter = Self::new(config.port.clone(), config.baud_rate)
            .with_timeout(config.timeout)
            .with_read_delay(config.read_delay)
            .with_hardware_flow_control(config.hardware_flow_control);
        adapter.data_bits = config.data_bits;
        adapter.parity = config.parity;
        adapter.stop_bits = config.stop_bits;
        adapter
    }

    /// Set the overall query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between writing a query and reading its response.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Enable or disable RTS/CTS flow control.
    pub fn with_hardware_flow_control(mut self, enabled: bool) -> Self {
        self.hardware_flow_control = enabled;
        self
    }

    /// Line terminator appended to each command.
    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    #[cfg(feature = "instrument_serial")]
    fn port_mut(&mut self) -> AppResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(DaqError::NotConnected)
    }

    /// Drop a late reply and anything else left in the input buffer.
    #[cfg(feature = "instrument_serial")]
    fn discard_stale_input(&mut self) -> AppResult<()> {
        let pending = std::mem::take(&mut self.reply_pending);
        let delimiter = self.response_delimiter;
        let wait = late_reply_window(self.timeout);
        let port_name = self.port_name.clone();
        let port = self.port_mut()?;

        if pending {
            match discard_late_reply(port.as_mut(), delimiter, wait) {
                Some(late) => warn!("Discarded late serial reply on '{}': {}", port_name, late),
                None => debug!("No late reply on '{}' within {:?}", port_name, wait),
            }
        }
        port.clear(ClearBuffer::Input).map_err(|e| {
            DaqError::Connection(format!("clearing input of '{}' failed: {}", port_name, e))
        })
    }

    #[cfg(feature = "instrument_serial")]
    fn send(&mut self, command: &str) -> AppResult<()> {
        use std::io::Write;

        let framed = frame(command, &self.line_terminator);
        let port_name = self.port_name.clone();
        let timeout = self.timeout;
        let port = self.port_mut()?;
        port.write_all(framed.as_bytes())
            .and_then(|()| port.flush())
            .map_err(|e| map_write_error(&port_name, command, timeout, e))?;
        debug!("Sent serial command: {}", command.trim());
        Ok(())
    }
}

#[cfg(feature = "instrument_serial")]
fn map_write_error(port_name: &str, command: &str, timeout: Duration, e: std::io::Error) -> DaqError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        DaqError::CommandTimeout {
            command: command.to_string(),
            timeout,
        }
    } else {
        DaqError::Connection(format!("write to '{}' failed: {}", port_name, e))
    }
}

#[cfg(feature = "instrument_serial")]
impl TransportChannel for SerialAdapter {
    fn connect(&mut self) -> AppResult<()> {
        let data_bits = match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let parity = match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        };
        let flow_control = if self.hardware_flow_control {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };

        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(100)) // Internal read timeout
            .open()
            .map_err(|e| {
                DaqError::Connection(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

        self.port = Some(port);
        debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.reply_pending = false;
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, command: &str) -> AppResult<()> {
        self.send(command)
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        self.discard_stale_input()?;
        self.send(command)?;
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }

        let delimiter = self.response_delimiter;
        let timeout = self.timeout;
        let port = self.port_mut()?;
        let response = match read_terminated(port.as_mut(), delimiter, timeout, command) {
            Err(err @ DaqError::CommandTimeout { .. }) => {
                self.reply_pending = true;
                return Err(err);
            }
            other => other?,
        };
        debug!("Received serial response: {}", response);
        Ok(response)
    }

    fn info(&self) -> String {
        format!("Serial({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl TransportChannel for SerialAdapter {
    fn connect(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    fn disconnect(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn write(&mut self, _command: &str) -> AppResult<()> {
        Err(DaqError::NotConnected)
    }

    fn query(&mut self, _command: &str) -> AppResult<String> {
        Err(DaqError::NotConnected)
    }

    fn info(&self) -> String {
        format!("Serial({} @ {} baud)", self.port_name, self.baud_rate)
    }
}
