//! Append-only CSV result store.
//!
//! The header is written once, when the file is first created. Every append is
//! an independent open/append/flush/close cycle, so a crash between two
//! appends leaves every earlier row intact and a crash during one loses at
//! most that row.

use std::fs::{self, OpenOptions};
use std::io;
use std::iter;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::layout::{ResultLayout, TIMESTAMP_COLUMN};
use crate::param::{ParameterAssignment, ParameterSpace};

/// Format of the trailing timestamp cell.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors from the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store {} has not been initialized", .0.display())]
    NotInitialized(PathBuf),

    #[error("row has {found} fields but the store expects {expected} before the timestamp")]
    Width { expected: usize, found: usize },

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
}

/// Raw per-run result file.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
    header: Vec<String>,
}

impl ResultStore {
    /// `header` is the full header row, including the trailing timestamp label.
    pub fn new(path: impl Into<PathBuf>, header: Vec<String>) -> Self {
        Self {
            path: path.into(),
            header,
        }
    }

    /// Store whose header is the space's columns, the layout's fields, then `Timestamp`.
    pub fn for_layout(path: impl Into<PathBuf>, space: &ParameterSpace, layout: &ResultLayout) -> Self {
        Self::new(path, header_for(space, layout))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Create the file with its header row if it does not exist yet.
    ///
    /// Returns `Ok(true)` if the file was created, `Ok(false)` if it already
    /// existed. An existing file is never opened for writing here.
    pub fn ensure_initialized(&self) -> Result<bool, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut wtr = csv::Writer::from_writer(file);
        wtr.write_record(&self.header).map_err(|e| self.csv_err(e))?;
        wtr.flush().map_err(|e| self.io_err(e))?;
        tracing::info!(path = %self.path.display(), "initialized result store");
        Ok(true)
    }

    /// Append one row: `fields` followed by the formatted `timestamp`.
    pub fn append(&self, fields: &[String], timestamp: NaiveDateTime) -> Result<(), StoreError> {
        let expected = self.header.len().saturating_sub(1);
        if fields.len() != expected {
            return Err(StoreError::Width {
                expected,
                found: fields.len(),
            });
        }

        let file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotInitialized(self.path.clone()))
            }
            Err(e) => return Err(self.io_err(e)),
        };

        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        wtr.write_record(fields.iter().map(String::as_str).chain(iter::once(stamp.as_str())))
            .map_err(|e| self.csv_err(e))?;
        wtr.flush().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Number of data rows currently on disk.
    pub fn row_count(&self) -> Result<usize, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotInitialized(self.path.clone()));
        }
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| self.csv_err(e))?;
        let mut count = 0;
        for record in rdr.records() {
            record.map_err(|e| self.csv_err(e))?;
            count += 1;
        }
        Ok(count)
    }

    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_err(&self, source: csv::Error) -> StoreError {
        StoreError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

/// Header row for a space/layout pair.
pub fn header_for(space: &ParameterSpace, layout: &ResultLayout) -> Vec<String> {
    space
        .columns()
        .into_iter()
        .chain(layout.names())
        .chain(iter::once(TIMESTAMP_COLUMN))
        .map(str::to_string)
        .collect()
}

/// Row cells for one completed run, without the timestamp.
pub fn format_record(
    assignment: &ParameterAssignment,
    values: &[f64],
    layout: &ResultLayout,
) -> Vec<String> {
    assignment
        .values()
        .map(|v| v.to_string())
        .chain(layout.format_values(values))
        .collect()
}
