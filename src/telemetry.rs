//! Telemetry line parsing.
//!
//! The device emits one `<x>,<y>` pair per line. Integer and floating-point
//! literals are accepted interchangeably on both sides. A line that does not
//! have this exact shape is rejected with a [`ParseError`]; callers skip it and
//! keep reading.

use serde::{Deserialize, Serialize};

use crate::errors::ParseError;

/// Field separator on the wire and in record files.
pub const SEPARATOR: char = ',';

/// A single (x, y) reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
}

impl Sample {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Sample {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Parse a telemetry line into a [`Sample`].
pub fn parse_line(raw: &str) -> Result<Sample, ParseError> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let separators = line.matches(SEPARATOR).count();
    let (x, y) = match separators {
        0 => return Err(ParseError::MissingSeparator),
        1 => line.split_once(SEPARATOR).ok_or(ParseError::MissingSeparator)?,
        n => return Err(ParseError::TooManyFields(n)),
    };

    Ok(Sample {
        x: parse_field(x)?,
        y: parse_field(y)?,
    })
}

/// Parse raw bytes from the wire. Invalid UTF-8 is a [`ParseError::Decode`].
pub fn parse_bytes(raw: &[u8]) -> Result<Sample, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::Decode)?;
    parse_line(text)
}

fn parse_field(text: &str) -> Result<f64, ParseError> {
    let text = text.trim();
    let value: f64 = text.parse().map_err(|source| ParseError::InvalidNumber {
        text: text.to_string(),
        source,
    })?;
    if !value.is_finite() {
        return Err(ParseError::NonFinite(text.to_string()));
    }
    Ok(value)
}
