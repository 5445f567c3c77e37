//! Command formatting and response parsing.
//!
//! Commands are opaque text. Templates carry named numeric placeholders
//! (`":SOUR:VOLT {value}"`) rendered with `strfmt`. Responses are either absent, a
//! single scalar or a comma-delimited tuple; anything else decodes to
//! [`Reading::Unavailable`] rather than a default value.

use crate::error::{AppResult, DaqError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

#[allow(clippy::expect_used)]
static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").expect("number pattern is valid")
});

/// Magnitude SCPI instruments report in place of an invalid reading (9.91E37).
const SCPI_NAN: f64 = 9.9e37;

/// A single line of command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    expects_response: bool,
}

impl Command {
    /// A command that produces no response.
    pub fn write(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expects_response: false,
        }
    }

    /// A command whose response must be read.
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expects_response: true,
        }
    }

    /// Command text without terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether a response is read after sending.
    pub fn expects_response(&self) -> bool {
        self.expects_response
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Format string with named numeric placeholders.
///
/// A template ending in `?` renders to a query, anything else to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    /// Wrap a format string such as `":BATT:MOD{slot}:ROW{row}?"`.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Raw format string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute `params` and build the command.
    pub fn render(&self, params: &[(&str, f64)]) -> AppResult<Command> {
        let text = if params.is_empty() && !self.0.contains('{') {
            self.0.clone()
        } else {
            let vars: HashMap<String, String> = params
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.to_string()))
                .collect();
            strfmt::strfmt(&self.0, &vars).map_err(|e| {
                DaqError::Configuration(format!("cannot render command '{}': {}", self.0, e))
            })?
        };

        if text.trim_end().ends_with('?') {
            Ok(Command::query(text))
        } else {
            Ok(Command::write(text))
        }
    }
}

impl From<&str> for CommandTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

/// Why a reading has no value.
#[derive(Debug, Clone, PartialEq)]
pub enum Unavailable {
    /// The instrument answered, but not with a number.
    Malformed(String),
    /// The round trip failed.
    TransportFailed(String),
    /// A composite reading lacked one of its inputs.
    MissingInput,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(raw) => write!(f, "malformed response '{}'", raw),
            Self::TransportFailed(reason) => write!(f, "transport failed: {}", reason),
            Self::MissingInput => f.write_str("input reading unavailable"),
        }
    }
}

/// Outcome of a measurement query.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Parsed numeric value.
    Value(f64),
    /// No value, with the reason.
    Unavailable(Unavailable),
}

impl Reading {
    /// The value, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Unavailable(_) => None,
        }
    }

    /// True when a value is present.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Combine two readings, available only when both are.
    pub fn combine(&self, other: &Reading, f: impl FnOnce(f64, f64) -> f64) -> Reading {
        match (self.value(), other.value()) {
            (Some(a), Some(b)) => Reading::Value(f(a, b)),
            _ => Reading::Unavailable(Unavailable::MissingInput),
        }
    }

    /// Reading for a round trip that failed with `err`.
    pub fn transport_failed(err: &DaqError) -> Self {
        Self::Unavailable(Unavailable::TransportFailed(err.to_string()))
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Unavailable(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

fn parse_number(field: &str) -> Option<f64> {
    let found = NUMBER.find(field.trim())?;
    let value: f64 = found.as_str().parse().ok()?;
    (value.is_finite() && value.abs() < SCPI_NAN).then_some(value)
}

/// Parse a scalar response such as `"+3.9512E+00"` or `"3.95V"`.
pub fn parse_scalar(raw: &str) -> Reading {
    match parse_number(raw) {
        Some(v) => Reading::Value(v),
        None => Reading::Unavailable(Unavailable::Malformed(raw.to_string())),
    }
}

/// Parse a comma-delimited response with at least `expected` numeric fields.
pub fn parse_tuple(raw: &str, expected: usize) -> Result<Vec<f64>, Unavailable> {
    let fields: Vec<&str> = raw.split(',').collect();
    if raw.trim().is_empty() || fields.len() < expected {
        return Err(Unavailable::Malformed(raw.to_string()));
    }
    fields
        .iter()
        .map(|field| parse_number(field).ok_or_else(|| Unavailable::Malformed(raw.to_string())))
        .collect()
}

/// Parse an integer status register response such as `"16"` or `"+0"`.
pub fn parse_register(raw: &str) -> Option<u32> {
    let value = parse_number(raw)?;
    (value >= 0.0 && value <= f64::from(u32::MAX) && value.fract() == 0.0).then(|| value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_value_placeholder() {
        let cmd = CommandTemplate::new(":SOUR:VOLT {value}")
            .render(&[("value", 4.2)])
            .unwrap();
        assert_eq!(cmd.text(), ":SOUR:VOLT 4.2");
        assert!(!cmd.expects_response());
    }

    #[test]
    fn test_render_query_with_several_placeholders() {
        let cmd = CommandTemplate::new(":BATT:MOD{slot}:ROW{row}?")
            .render(&[("slot", 4.0), ("row", 17.0)])
            .unwrap();
        assert_eq!(cmd.text(), ":BATT:MOD4:ROW17?");
        assert!(cmd.expects_response());
    }

    #[test]
    fn test_render_missing_placeholder_is_config_error() {
        let err = CommandTemplate::new(":SOUR:CURR {value}").render(&[]).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_parse_scalar_formats() {
        assert_eq!(parse_scalar("+3.9512E+00"), Reading::Value(3.9512));
        assert_eq!(parse_scalar("  1.25\r"), Reading::Value(1.25));
        assert_eq!(parse_scalar("-0.004A"), Reading::Value(-0.004));
    }

    #[test]
    fn test_parse_scalar_garbage_is_unavailable() {
        assert_eq!(
            parse_scalar("ERR"),
            Reading::Unavailable(Unavailable::Malformed("ERR".into()))
        );
        assert!(!parse_scalar("").is_available());
        assert!(!parse_scalar("9.91E37").is_available());
    }

    #[test]
    fn test_parse_tuple() {
        assert_eq!(parse_tuple("1.0,3.95,0.125", 2).unwrap(), vec![1.0, 3.95, 0.125]);
        assert!(parse_tuple("1.0", 2).is_err());
        assert!(parse_tuple("1.0,abc", 2).is_err());
    }

    #[test]
    fn test_combine_requires_both() {
        let v = Reading::Value(4.0);
        let i = Reading::Value(0.5);
        assert_eq!(v.combine(&i, |a, b| a * b), Reading::Value(2.0));
        let bad = parse_scalar("garbage");
        assert_eq!(
            v.combine(&bad, |a, b| a * b),
            Reading::Unavailable(Unavailable::MissingInput)
        );
    }

    #[test]
    fn test_parse_register() {
        assert_eq!(parse_register("16"), Some(16));
        assert_eq!(parse_register("+0"), Some(0));
        assert_eq!(parse_register("busy"), None);
    }
}
