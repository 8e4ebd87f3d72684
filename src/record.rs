//! Record file export and import.
//!
//! ```text
//! # Brand: Leaf Profile Analyzer
//! # Model: <model-id-or-Unknown>
//! X,Y
//! <x>,<y>
//! ```
//!
//! Import also accepts a bare `X,Y` file and rows without any header.
//! Unknown `#` comment lines are skipped wherever they appear.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::RecordError;
use crate::telemetry::{self, Sample};

pub const DEFAULT_BRAND: &str = "Leaf Profile Analyzer";
pub const UNKNOWN_MODEL: &str = "Unknown";
pub const HEADER: &str = "X,Y";

const BRAND_KEY: &str = "Brand";
const MODEL_KEY: &str = "Model";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub brand: String,
    pub model: String,
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self {
            brand: DEFAULT_BRAND.to_string(),
            model: UNKNOWN_MODEL.to_string(),
        }
    }
}

impl RecordMetadata {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Header values must be non-empty single lines without surrounding
    /// whitespace, or they would not read back unchanged.
    pub fn validate(&self) -> Result<(), RecordError> {
        for (key, value) in [(BRAND_KEY, &self.brand), (MODEL_KEY, &self.model)] {
            let storable =
                !value.is_empty() && value.trim() == value.as_str() && !value.contains(['\r', '\n']);
            if !storable {
                return Err(RecordError::InvalidMetadata {
                    key,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Write a complete record. Nothing is written if `metadata` is invalid.
pub fn write_record<W: Write>(
    mut out: W,
    samples: &[Sample],
    metadata: &RecordMetadata,
) -> Result<(), RecordError> {
    metadata.validate()?;
    writeln!(out, "# {BRAND_KEY}: {}", metadata.brand)?;
    writeln!(out, "# {MODEL_KEY}: {}", metadata.model)?;
    writeln!(out, "{HEADER}")?;
    for s in samples {
        writeln!(out, "{},{}", s.x, s.y)?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_record<R: BufRead>(input: R) -> Result<(Vec<Sample>, RecordMetadata), RecordError> {
    let mut metadata = RecordMetadata::default();
    let mut samples = Vec::new();
    let mut seen_header = false;

    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();

        if let Some(comment) = trimmed.strip_prefix('#') {
            if let Some((key, value)) = comment.split_once(':') {
                let value = value.trim();
                match key.trim() {
                    BRAND_KEY if !value.is_empty() => metadata.brand = value.to_string(),
                    MODEL_KEY if !value.is_empty() => metadata.model = value.to_string(),
                    _ => {}
                }
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if !seen_header && samples.is_empty() && is_header(trimmed) {
            seen_header = true;
            continue;
        }

        let sample = telemetry::parse_line(trimmed).map_err(|source| RecordError::InvalidRow {
            line: idx + 1,
            source,
        })?;
        samples.push(sample);
    }

    if !seen_header && samples.is_empty() {
        return Err(RecordError::Empty);
    }
    Ok((samples, metadata))
}

fn is_header(line: &str) -> bool {
    line.split_once(',').is_some_and(|(x, y)| {
        x.trim().eq_ignore_ascii_case("x") && y.trim().eq_ignore_ascii_case("y")
    })
}

/// Write `samples` to `path`, always with the full commented header.
pub fn export(
    path: impl AsRef<Path>,
    samples: &[Sample],
    metadata: &RecordMetadata,
) -> Result<(), RecordError> {
    metadata.validate()?;
    let file = File::create(path)?;
    write_record(BufWriter::new(file), samples, metadata)
}

pub fn import(path: impl AsRef<Path>) -> Result<(Vec<Sample>, RecordMetadata), RecordError> {
    let file = File::open(path)?;
    read_record(BufReader::new(file))
}
