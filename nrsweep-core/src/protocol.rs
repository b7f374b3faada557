//! Result marker protocol between the simulator and the sweep.
//!
//! The simulator prints its result vector on one line as
//! `###RESULTS###<f64>,<f64>,...###END###`. Only the first line carrying the
//! begin marker is honored; text around the region is ignored.

use thiserror::Error;

pub const BEGIN_MARKER: &str = "###RESULTS###";
pub const END_MARKER: &str = "###END###";

/// Why a run's output could not be turned into a result vector.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("no results marker found")]
    MissingBeginMarker,

    #[error("results marker has no matching {}", END_MARKER)]
    MissingEndMarker,

    #[error("results marker region is empty")]
    EmptyPayload,

    #[error("field {index} is not a number: '{field}'")]
    InvalidNumber { index: usize, field: String },

    #[error("field {index} is out of range: {value}")]
    OutOfRange { index: usize, value: f64 },

    #[error("expected {expected} result fields, found {found}")]
    ArityMismatch { expected: usize, found: usize },
}

/// Return the raw text between the first begin marker and its end marker.
pub fn marker_region(output: &str) -> Result<&str, ParseError> {
    let line = output
        .lines()
        .find(|line| line.contains(BEGIN_MARKER))
        .ok_or(ParseError::MissingBeginMarker)?;

    let start = line.find(BEGIN_MARKER).map_or(0, |i| i + BEGIN_MARKER.len());
    let rest = &line[start..];
    let end = rest.find(END_MARKER).ok_or(ParseError::MissingEndMarker)?;
    Ok(&rest[..end])
}

/// Extract exactly `arity` finite, non-negative numbers from simulator output.
pub fn parse_results(output: &str, arity: usize) -> Result<Vec<f64>, ParseError> {
    let payload = marker_region(output)?.trim();
    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }

    let values = payload
        .split(',')
        .enumerate()
        .map(|(index, field)| {
            let field = field.trim();
            let value: f64 = field.parse().map_err(|_| ParseError::InvalidNumber {
                index,
                field: field.to_string(),
            })?;
            if !value.is_finite() || value < 0.0 {
                return Err(ParseError::OutOfRange { index, value });
            }
            Ok(value)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if values.len() != arity {
        return Err(ParseError::ArityMismatch {
            expected: arity,
            found: values.len(),
        });
    }
    Ok(values)
}
