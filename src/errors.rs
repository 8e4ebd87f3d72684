use std::io;
use std::num::ParseFloatError;

use thiserror::Error;

use crate::link::ConnectionState;

/// Connection-level failures. Always returned to the caller, never fatal.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("not connected")]
    NotConnected,
    #[error("acquisition worker is no longer running")]
    WorkerGone,
}

/// A telemetry line that could not be turned into a sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing ',' separator")]
    MissingSeparator,
    #[error("expected exactly one ',' separator, found {0}")]
    TooManyFields(usize),
    #[error("invalid number {text:?}: {source}")]
    InvalidNumber {
        text: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("non-finite value {0:?}")]
    NonFinite(String),
    #[error("line is not valid utf-8")]
    Decode,
}

/// Failures while reading or writing a record file.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {source}")]
    InvalidRow {
        line: usize,
        #[source]
        source: ParseError,
    },
    #[error("record file has no header and no data rows")]
    Empty,
    #[error("{key} {value:?} cannot be stored in a record header")]
    InvalidMetadata { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
