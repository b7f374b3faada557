//! Result vector layouts and their cell formatting.
//!
//! A layout names the fields of the simulator's result vector in order and
//! marks which of them are percentages. Percentages are persisted as
//! `"<x.xxx>%"` cells; everything else as plain fixed-decimal numbers.

use serde::{Deserialize, Serialize};

/// Trailing column label of the raw result store.
pub const TIMESTAMP_COLUMN: &str = "Timestamp";

/// Decimal places for persisted and aggregated result values.
pub const VALUE_PRECISION: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Plain,
    Percent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultField {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
}

impl ResultField {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Plain,
        }
    }

    pub fn percent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Percent,
        }
    }
}

/// Ordered result fields; the length is the arity the parser expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLayout {
    pub fields: Vec<ResultField>,
}

impl ResultLayout {
    pub fn new(fields: Vec<ResultField>) -> Self {
        Self { fields }
    }

    /// Throughput, Delay, PacketLossRate (%), BLER (%).
    pub fn basic() -> Self {
        Self::new(vec![
            ResultField::plain("Throughput"),
            ResultField::plain("Delay"),
            ResultField::percent("PacketLossRate"),
            ResultField::percent("BLER"),
        ])
    }

    /// `basic` plus the MCS index and resource-block count.
    pub fn extended() -> Self {
        let mut layout = Self::basic();
        layout.fields.push(ResultField::plain("MCS"));
        layout.fields.push(ResultField::plain("RB"));
        layout
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&ResultField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Format `values` in layout order. Extra values are ignored.
    pub fn format_values(&self, values: &[f64]) -> Vec<String> {
        self.fields
            .iter()
            .zip(values)
            .map(|(field, &v)| format_cell(field.kind, v))
            .collect()
    }
}

pub fn format_cell(kind: FieldKind, value: f64) -> String {
    match kind {
        FieldKind::Plain => format!("{:.*}", VALUE_PRECISION, value),
        FieldKind::Percent => format!("{:.*}%", VALUE_PRECISION, value),
    }
}

/// Recover the number from a `"<x>%"` cell. `None` if the suffix is missing
/// or the remainder is not a finite number.
pub fn parse_percent(cell: &str) -> Option<f64> {
    cell.trim()
        .strip_suffix('%')
        .and_then(|n| n.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}
