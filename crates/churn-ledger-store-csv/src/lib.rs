//! File-backed record store for prediction history and feedback logs.
//!
//! Each store is one comma-separated text file with a header line. Every
//! mutation reads the whole file, applies the change in memory and replaces the
//! file through a temporary sibling plus rename, so readers see either the old
//! or the new contents. Deletions require an [`churn_ledger_core::AccessGrant`].

use std::path::PathBuf;

mod codec;
mod layout;
mod row;
mod store;

pub use layout::{
    parse_display_timestamp, StoreLayout, FEEDBACK_LOG_COLUMNS, PREDICTION_HISTORY_COLUMNS,
    TIMESTAMP_COLUMN,
};
pub use row::{Row, StoreTable};
pub use store::{MigrationReport, RecordStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index {index} is out of range for {len} rows")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("store i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("store file {} is corrupt at line {line}: {message}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// True when the file exists but cannot be interpreted; resetting the
    /// store is the remediation.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
