//! Offline aggregation of raw per-run rows into one mean row per configuration.
//!
//! Pipeline, in order:
//! 1. load the raw store and drop the `Timestamp` column
//! 2. type every cell: configuration columns as `ParamValue`, result columns
//!    as `f64` (percentage columns must carry their `%` suffix)
//! 3. group by the full configuration key and average every result column
//! 4. round means to the configured precision
//! 5. apply scale rules (after averaging, never before)
//! 6. relabel categorical codes; an unknown code aborts the run
//!
//! The table is built completely in memory before anything is written, and
//! the output file is replaced atomically. A failed run leaves no output.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::{parse_percent, FieldKind, ResultLayout, TIMESTAMP_COLUMN, VALUE_PRECISION};
use crate::param::ParamValue;

/// Errors that abort an aggregation run.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV error on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("column '{0}' is missing from the result header")]
    MissingColumn(String),

    #[error("line {line}, column '{column}': '{value}' lacks the '%' suffix")]
    MissingPercent {
        line: u64,
        column: String,
        value: String,
    },

    #[error("line {line}, column '{column}': '{value}' is not a number")]
    InvalidNumber {
        line: u64,
        column: String,
        value: String,
    },

    #[error("column '{column}': no label for code {value}")]
    UnmappedCode { column: String, value: String },

    #[error("refusing to overwrite the raw store {} with aggregated output", .0.display())]
    SameFile(PathBuf),
}

// ─── Rules ──────────────────────────────────────────────────────────

/// Multiply `column` by `factor` in rows where `when_column == equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRule {
    pub when_column: String,
    pub equals: ParamValue,
    pub column: String,
    pub factor: ParamValue,
}

impl ScaleRule {
    /// Seven-site deployments report users per cell across three sectors.
    pub fn seven_site_users() -> Self {
        Self {
            when_column: "gNbNum".into(),
            equals: ParamValue::Int(7),
            column: "UeNum".into(),
            factor: ParamValue::Int(3),
        }
    }
}

/// Replace integer codes in `column` with display labels.
///
/// Keys are the decimal codes as strings so the table reads naturally in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relabel {
    pub column: String,
    pub labels: BTreeMap<String, String>,
}

impl Relabel {
    pub fn new(column: impl Into<String>, labels: &[(i64, &str)]) -> Self {
        Self {
            column: column.into(),
            labels: labels
                .iter()
                .map(|(code, label)| (code.to_string(), label.to_string()))
                .collect(),
        }
    }

    pub fn link_direction() -> Self {
        Self::new("dlOnly", &[(1, "DL"), (0, "UL")])
    }

    pub fn allocation() -> Self {
        Self::new("allocate", &[(0, "BW"), (1, "USED")])
    }

    pub fn scheduler() -> Self {
        Self::new("scheduler", &[(0, "RR"), (1, "PF"), (2, "DP")])
    }

    fn label_for(&self, value: ParamValue) -> Option<&str> {
        let code = value.as_int()?;
        self.labels.get(&code.to_string()).map(String::as_str)
    }
}

/// Most decimal places a mean can be rounded to. `f64` carries no more.
pub const MAX_PRECISION: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConfig {
    #[serde(default = "default_precision")]
    pub precision: usize,
    #[serde(default = "default_scale")]
    pub scale: Vec<ScaleRule>,
    #[serde(default = "default_relabel")]
    pub relabel: Vec<Relabel>,
}

fn default_precision() -> usize {
    VALUE_PRECISION
}

fn default_scale() -> Vec<ScaleRule> {
    vec![ScaleRule::seven_site_users()]
}

fn default_relabel() -> Vec<Relabel> {
    vec![
        Relabel::link_direction(),
        Relabel::allocation(),
        Relabel::scheduler(),
    ]
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            scale: default_scale(),
            relabel: default_relabel(),
        }
    }
}

// ─── Tables ─────────────────────────────────────────────────────────

/// Raw store contents with the timestamp column already removed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based line in the source file, for diagnostics.
    pub line: u64,
    pub cells: Vec<String>,
}

impl RawRow {
    /// Cell `idx`, or `""` past the end of a short row.
    fn cell(&self, idx: usize) -> &str {
        self.cells.get(idx).map_or("", String::as_str)
    }
}

/// A configuration cell after relabeling.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(ParamValue),
    Label(String),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Value(v) => v.fmt(f),
            Cell::Label(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub key: Vec<Cell>,
    pub values: Vec<f64>,
    /// Number of raw rows averaged into this one.
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTable {
    pub key_columns: Vec<String>,
    pub value_columns: Vec<String>,
    pub precision: usize,
    pub rows: Vec<AggregatedRow>,
}

impl AggregatedTable {
    pub fn headers(&self) -> Vec<&str> {
        self.key_columns
            .iter()
            .chain(&self.value_columns)
            .map(String::as_str)
            .collect()
    }

    /// Render as CSV text.
    pub fn to_csv_string(&self) -> Result<String, csv::Error> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        self.write_records(&mut wtr)?;
        let data = wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Write to `path` through a temporary sibling file and rename.
    pub fn write_csv(&self, path: &Path) -> Result<(), AggregateError> {
        let io_err = |source| AggregateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp = tmp_sibling(path);
        let written = csv::Writer::from_path(&tmp).and_then(|mut wtr| {
            self.write_records(&mut wtr)?;
            wtr.flush().map_err(csv::Error::from)
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(AggregateError::Csv { path: tmp, source });
        }
        fs::rename(&tmp, path).map_err(io_err)
    }

    fn write_records<W: io::Write>(&self, wtr: &mut csv::Writer<W>) -> Result<(), csv::Error> {
        wtr.write_record(self.headers())?;
        for row in &self.rows {
            let cells = row
                .key
                .iter()
                .map(|c| c.to_string())
                .chain(row.values.iter().map(|v| format!("{:.*}", self.precision, v)));
            wtr.write_record(cells)?;
        }
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Lexicographic numeric ordering over configuration values.
#[derive(Debug, Clone)]
struct GroupKey(Vec<ParamValue>);

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| a.numeric_cmp(b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| self.0.len().cmp(&other.0.len()))
    }
}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

#[derive(Debug)]
struct Accumulator {
    sums: Vec<f64>,
    count: usize,
}

// ─── Aggregator ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Aggregator {
    layout: ResultLayout,
    config: AggregateConfig,
}

impl Aggregator {
    pub fn new(layout: ResultLayout, config: AggregateConfig) -> Self {
        Self { layout, config }
    }

    /// Read the raw store, dropping the timestamp column if present.
    pub fn load(&self, path: &Path) -> Result<RawTable, AggregateError> {
        let csv_err = |source| AggregateError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err)?;

        let mut headers: Vec<String> = rdr
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();
        let stamp_idx = headers.iter().position(|h| h == TIMESTAMP_COLUMN);
        if let Some(idx) = stamp_idx {
            headers.remove(idx);
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(csv_err)?;
            let line = record.position().map_or(0, |p| p.line());
            let cells = record
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != stamp_idx)
                .map(|(_, c)| c.to_string())
                .collect();
            rows.push(RawRow { line, cells });
        }

        Ok(RawTable { headers, rows })
    }

    /// Group, average, round, scale and relabel.
    pub fn aggregate(&self, table: &RawTable) -> Result<AggregatedTable, AggregateError> {
        let value_idx = self
            .layout
            .fields
            .iter()
            .map(|f| {
                table
                    .headers
                    .iter()
                    .position(|h| *h == f.name)
                    .ok_or_else(|| AggregateError::MissingColumn(f.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let key_idx: Vec<usize> = (0..table.headers.len())
            .filter(|i| !value_idx.contains(i))
            .collect();
        let key_columns: Vec<String> = key_idx.iter().map(|&i| table.headers[i].clone()).collect();

        let mut groups: BTreeMap<GroupKey, Accumulator> = BTreeMap::new();
        for row in &table.rows {
            let key = key_idx
                .iter()
                .map(|&i| {
                    let cell = row.cell(i);
                    ParamValue::parse(cell).ok_or_else(|| AggregateError::InvalidNumber {
                        line: row.line,
                        column: table.headers[i].clone(),
                        value: cell.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let values = self
                .layout
                .fields
                .iter()
                .zip(&value_idx)
                .map(|(field, &i)| parse_value(field.kind, &field.name, row.cell(i), row.line))
                .collect::<Result<Vec<_>, _>>()?;

            let acc = groups.entry(GroupKey(key)).or_insert_with(|| Accumulator {
                sums: vec![0.0; values.len()],
                count: 0,
            });
            for (sum, v) in acc.sums.iter_mut().zip(&values) {
                *sum += v;
            }
            acc.count += 1;
        }

        let precision = self.config.precision;
        let mut rows: Vec<(Vec<ParamValue>, Vec<f64>, usize)> = groups
            .into_iter()
            .map(|(GroupKey(key), acc)| {
                let means = acc
                    .sums
                    .iter()
                    .map(|s| round_to(s / acc.count as f64, precision))
                    .collect();
                (key, means, acc.count)
            })
            .collect();

        for rule in &self.config.scale {
            let when = key_position(&key_columns, &rule.when_column)?;
            let target = key_position(&key_columns, &rule.column)?;
            for (key, _, _) in rows.iter_mut() {
                if key[when].numeric_eq(&rule.equals) {
                    key[target] = key[target].scaled(rule.factor);
                }
            }
        }

        let mut relabels = Vec::with_capacity(self.config.relabel.len());
        for relabel in &self.config.relabel {
            relabels.push((key_position(&key_columns, &relabel.column)?, relabel));
        }

        let rows = rows
            .into_iter()
            .map(|(key, values, samples)| {
                let mut cells: Vec<Cell> = key.into_iter().map(Cell::Value).collect();
                for &(idx, relabel) in &relabels {
                    if let Cell::Value(v) = cells[idx] {
                        let label = relabel.label_for(v).ok_or_else(|| AggregateError::UnmappedCode {
                            column: relabel.column.clone(),
                            value: v.to_string(),
                        })?;
                        cells[idx] = Cell::Label(label.to_string());
                    }
                }
                Ok(AggregatedRow {
                    key: cells,
                    values,
                    samples,
                })
            })
            .collect::<Result<Vec<_>, AggregateError>>()?;

        tracing::info!(
            raw_rows = table.rows.len(),
            groups = rows.len(),
            "aggregated result store"
        );

        Ok(AggregatedTable {
            key_columns,
            value_columns: self.layout.names().into_iter().map(str::to_string).collect(),
            precision,
            rows,
        })
    }

    /// Load `input`, aggregate, and atomically write `output`.
    pub fn run(&self, input: &Path, output: &Path) -> Result<AggregatedTable, AggregateError> {
        if same_file(input, output) {
            return Err(AggregateError::SameFile(input.to_path_buf()));
        }
        let raw = self.load(input)?;
        let table = self.aggregate(&raw)?;
        table.write_csv(output)?;
        tracing::info!(output = %output.display(), rows = table.rows.len(), "wrote aggregated results");
        Ok(table)
    }
}

fn parse_value(kind: FieldKind, column: &str, cell: &str, line: u64) -> Result<f64, AggregateError> {
    let parsed = match kind {
        FieldKind::Percent => {
            if !cell.trim_end().ends_with('%') {
                return Err(AggregateError::MissingPercent {
                    line,
                    column: column.to_string(),
                    value: cell.to_string(),
                });
            }
            parse_percent(cell)
        }
        FieldKind::Plain => cell.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
    };
    parsed.ok_or_else(|| AggregateError::InvalidNumber {
        line,
        column: column.to_string(),
        value: cell.to_string(),
    })
}

fn key_position(key_columns: &[String], column: &str) -> Result<usize, AggregateError> {
    key_columns
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| AggregateError::MissingColumn(column.to_string()))
}

fn round_to(value: f64, places: usize) -> f64 {
    let m = 10f64.powi(places.min(MAX_PRECISION) as i32);
    (value * m).round() / m
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}
