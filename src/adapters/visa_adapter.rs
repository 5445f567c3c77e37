//! VISA adapter for USBTMC, GPIB and ASRL instruments
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2281::4587429::INSTR" (USBTMC)
//! - "ASRL3::INSTR" (serial port managed by VISA)
//!
//! USBTMC and GPIB resources use `\n` framing. ASRL resources use `\r\n` and are
//! configured with the fixed [`AsrlProfile`] on connect.

use super::{VisaConfig, TransportChannel};
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use super::{discard_late_reply, frame, late_reply_window, read_terminated};
#[cfg(feature = "instrument_visa")]
use log::{debug, warn};
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Serial line settings applied to ASRL resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsrlProfile {
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits.
    pub data_bits: u16,
    /// Parity enabled.
    pub parity: bool,
    /// Stop bits.
    pub stop_bits: u16,
    /// Flow control enabled.
    pub flow_control: bool,
}

impl Default for AsrlProfile {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: false,
            stop_bits: 1,
            flow_control: false,
        }
    }
}

/// VISA adapter
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::1::INSTR")
    pub(crate) resource_string: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands
    pub(crate) line_terminator: String,

    asrl_profile: Option<AsrlProfile>,

    /// A query timed out and its reply may still arrive.
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    reply_pending: bool,

    // Declared before the resource manager so the session closes first.
    #[cfg(feature = "instrument_visa")]
    instrument: Option<Instrument>,

    #[cfg(feature = "instrument_visa")]
    rm: Option<DefaultRM>,
}

impl VisaAdapter {
    /// Create a new VISA adapter, picking framing from the resource class
    ///
    /// # Arguments
    /// * `resource_string` - VISA resource identifier (e.g., "GPIB0::1::INSTR")
    pub fn new(resource_string: impl Into<String>) -> Self {
        let resource_string = resource_string.into();
        let asrl = is_asrl_resource(&resource_string);
        Self {
            resource_string,
            timeout: Duration::from_secs(5),
            line_terminator: if asrl { "\r\n" } else { "\n" }.to_string(),
            asrl_profile: asrl.then(AsrlProfile::default),
            reply_pending: false,
            #[cfg(feature = "instrument_visa")]
            instrument: None,
            #[cfg(feature = "instrument_visa")]
            rm: None,
        }
    }

    /// Build from a transport configuration entry.
    pub fn from_config(config: &VisaConfig) -> Self {
        Self::new(config.resource.clone()).with_timeout(config.timeout)
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Serial settings applied on connect, for ASRL resources only.
    pub fn asrl_profile(&self) -> Option<AsrlProfile> {
        self.asrl_profile
    }

    #[cfg(feature = "instrument_visa")]
    fn send(&mut self, command: &str) -> AppResult<()> {
        use std::io::Write;

        let framed = frame(command, &self.line_terminator);
        let instrument = self.instrument.as_mut().ok_or(DaqError::NotConnected)?;
        instrument
            .write_all(framed.as_bytes())
            .map_err(|e| DaqError::Connection(format!("VISA write failed for '{}': {}", command, e)))?;
        debug!("VISA command sent: {}", command.trim());
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    fn apply_session_attributes(&self, instrument: &Instrument) -> AppResult<()> {
        use visa_rs::enums::attribute::{
            AttrAsrlBaud, AttrAsrlDataBits, AttrAsrlFlowCntrl, AttrAsrlParity, AttrAsrlStopBits,
            AttrTmoValue,
        };

        let rejected = |what: &str| DaqError::Connection(format!("VISA attribute {} rejected", what));
        let failed = |e: visa_rs::Error| DaqError::Connection(format!("VISA session setup failed: {}", e));

        let timeout_ms = u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX);
        let tmo = AttrTmoValue::new_checked(timeout_ms).ok_or_else(|| rejected("timeout"))?;
        instrument.set_attr(tmo).map_err(failed)?;

        if let Some(profile) = self.asrl_profile {
            // VISA encodes stop bits in tenths
            let stop_bits = if profile.stop_bits == 2 { 20 } else { 10 };
            let baud = AttrAsrlBaud::new_checked(profile.baud_rate).ok_or_else(|| rejected("baud"))?;
            let data_bits =
                AttrAsrlDataBits::new_checked(profile.data_bits).ok_or_else(|| rejected("data bits"))?;
            let parity = AttrAsrlParity::new_checked(u16::from(profile.parity))
                .ok_or_else(|| rejected("parity"))?;
            let stop = AttrAsrlStopBits::new_checked(stop_bits).ok_or_else(|| rejected("stop bits"))?;
            let flow = AttrAsrlFlowCntrl::new_checked(u16::from(profile.flow_control))
                .ok_or_else(|| rejected("flow control"))?;

            instrument.set_attr(baud).map_err(failed)?;
            instrument.set_attr(data_bits).map_err(failed)?;
            instrument.set_attr(parity).map_err(failed)?;
            instrument.set_attr(stop).map_err(failed)?;
            instrument.set_attr(flow).map_err(failed)?;
        }
        Ok(())
    }
}

/// True for VISA serial resources (`ASRL...`).
pub fn is_asrl_resource(resource: &str) -> bool {
    resource.trim().to_ascii_uppercase().starts_with("ASRL")
}

#[cfg(feature = "instrument_visa")]
impl TransportChannel for VisaAdapter {
    fn connect(&mut self) -> AppResult<()> {
        use std::ffi::CString;

        let rm = DefaultRM::new()
            .map_err(|e| DaqError::Connection(format!("VISA resource manager unavailable: {}", e)))?;
        let c_string = CString::new(self.resource_string.clone())
            .map_err(|e| DaqError::Configuration(format!("invalid VISA resource string: {}", e)))?;
        let visa_string = visa_rs::VisaString::from(c_string);
        let instrument = rm
            .open(&visa_string, AccessMode::NO_LOCK, self.timeout)
            .map_err(|e| {
                DaqError::Connection(format!(
                    "Failed to open VISA resource '{}': {}",
                    self.resource_string, e
                ))
            })?;
        self.apply_session_attributes(&instrument)?;

        self.instrument = Some(instrument);
        self.rm = Some(rm);
        debug!("VISA resource '{}' opened", self.resource_string);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.reply_pending = false;
        if self.instrument.take().is_some() {
            debug!("VISA resource '{}' closed", self.resource_string);
        }
        self.rm = None;
    }

    fn is_connected(&self) -> bool {
        self.instrument.is_some()
    }

    fn write(&mut self, command: &str) -> AppResult<()> {
        self.send(command)
    }

    fn query(&mut self, command: &str) -> AppResult<String> {
        let timeout = self.timeout;
        if std::mem::take(&mut self.reply_pending) {
            let wait = late_reply_window(timeout);
            let instrument = self.instrument.as_mut().ok_or(DaqError::NotConnected)?;
            match discard_late_reply(instrument, b'\n', wait) {
                Some(late) => warn!("Discarded late VISA reply: {}", late),
                None => debug!("No late VISA reply within {:?}", wait),
            }
        }

        self.send(command)?;
        let instrument = self.instrument.as_mut().ok_or(DaqError::NotConnected)?;
        // VISA reports its own timeout as an I/O error, so any failed read counts
        let response = match read_terminated(instrument, b'\n', timeout, command) {
            Ok(response) => response,
            Err(err) => {
                self.reply_pending = true;
                return Err(err);
            }
        };
        debug!("VISA query '{}' -> '{}'", command.trim(), response);
        Ok(response)
    }

    fn info(&self) -> String {
        format!("VISA({})", self.resource_string)
    }
}

#[cfg(not(feature = "instrument_visa"))]
impl TransportChannel for VisaAdapter {
    fn connect(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
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
        format!("VISA({})", self.resource_string)
    }
}
