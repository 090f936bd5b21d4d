use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use churn_ledger_core::AccessGrant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::codec::{self, DecodeError};
use crate::{Row, StoreError, StoreLayout, StoreTable};

/// Outcome of [`RecordStore::migrate`].
#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub store: String,
    pub existed: bool,
    pub rows: usize,
    pub added_columns: Vec<String>,
    pub rewritten: bool,
}

struct LoadedTable {
    table: StoreTable,
    upgraded_columns: Vec<String>,
}

/// Append-mostly table persisted as a single text file.
///
/// Read-modify-write cycles through one handle are serialized by an internal
/// lock. Separate handles (or processes) on the same file are last-writer-wins.
///
/// [`RecordStore::delete_at`] and [`RecordStore::delete_all`] take an
/// [`AccessGrant`], so callers must pass the access gate first.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    layout: StoreLayout,
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Binds a store to `path`. No I/O happens until the first operation.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, layout: StoreLayout) -> Self {
        Self {
            path: path.into(),
            layout,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// All rows in persisted order, upgraded to the layout's columns.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the file cannot be read and
    /// [`StoreError::Corrupt`] when it cannot be parsed.
    pub fn list(&self) -> Result<StoreTable, StoreError> {
        let table = self.load()?.map(|loaded| loaded.table).unwrap_or_default();
        debug!(
            store = self.layout.name(),
            rows = table.len(),
            "listed store rows"
        );
        Ok(table)
    }

    /// Rows in the order they are shown to users: newest first when the
    /// layout has a timestamp column, file order otherwise. Indices passed to
    /// [`RecordStore::delete_at`] refer to this order.
    ///
    /// # Errors
    /// Same as [`RecordStore::list`].
    pub fn displayed(&self) -> Result<StoreTable, StoreError> {
        let table = self.list()?;
        let rows = self
            .layout
            .display_order(&table)
            .into_iter()
            .map(|index| table.rows[index].clone())
            .collect();
        Ok(StoreTable {
            header: table.header,
            rows,
        })
    }

    /// Appends `row`, widening the header when it introduces new columns.
    /// Returns the row count after the append.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidRow`] for an empty row or blank column
    /// name, and read/write errors from the underlying file.
    pub fn append(&self, row: Row) -> Result<usize, StoreError> {
        if row.is_empty() {
            return Err(StoreError::InvalidRow("row has no columns".to_string()));
        }
        if row.columns().any(|column| column.trim().is_empty()) {
            return Err(StoreError::InvalidRow(
                "column names MUST be non-empty".to_string(),
            ));
        }

        let _guard = self.lock();
        let mut table = match self.load()? {
            Some(loaded) => loaded.table,
            None => StoreTable::with_header(self.layout.columns().to_vec()),
        };

        let added = table.widen(row.columns());
        if !added.is_empty() && table.len() > 0 {
            info!(
                store = self.layout.name(),
                columns = ?added,
                "widened store header for new row columns"
            );
        }
        table.rows.push(row.aligned_to(&table.header));

        self.write_atomic(&table)?;
        info!(
            store = self.layout.name(),
            rows = table.len(),
            "appended row"
        );
        Ok(table.len())
    }

    /// Removes the row at `index` in display order and returns it. Remaining
    /// rows keep their relative file order.
    ///
    /// # Errors
    /// Returns [`StoreError::IndexOutOfRange`] when `index >= len`; the file
    /// is left untouched in that case.
    #[allow(clippy::needless_pass_by_value)]
    pub fn delete_at(&self, _grant: AccessGrant, index: usize) -> Result<Row, StoreError> {
        let _guard = self.lock();
        let mut table = self.load()?.map(|loaded| loaded.table).unwrap_or_default();

        let order = self.layout.display_order(&table);
        let Some(&file_index) = order.get(index) else {
            return Err(StoreError::IndexOutOfRange {
                index,
                len: table.len(),
            });
        };

        let removed = table.rows.remove(file_index);
        self.write_atomic(&table)?;
        info!(
            store = self.layout.name(),
            index,
            file_index,
            remaining = table.len(),
            "deleted row"
        );
        Ok(removed)
    }

    /// Removes the store file. Returns whether a file existed.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the file exists but cannot be removed.
    #[allow(clippy::needless_pass_by_value)]
    pub fn delete_all(&self, _grant: AccessGrant) -> Result<bool, StoreError> {
        let _guard = self.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(store = self.layout.name(), "deleted store");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Rewrites an older-generation file with the layout's full header.
    ///
    /// # Errors
    /// Read/write errors from the underlying file.
    pub fn migrate(&self) -> Result<MigrationReport, StoreError> {
        let _guard = self.lock();
        let Some(loaded) = self.load()? else {
            return Ok(MigrationReport {
                store: self.layout.name().to_string(),
                existed: false,
                rows: 0,
                added_columns: Vec::new(),
                rewritten: false,
            });
        };

        let rewritten = !loaded.upgraded_columns.is_empty();
        if rewritten {
            self.write_atomic(&loaded.table)?;
            info!(
                store = self.layout.name(),
                columns = ?loaded.upgraded_columns,
                "migrated store to current layout"
            );
        }

        Ok(MigrationReport {
            store: self.layout.name().to_string(),
            existed: true,
            rows: loaded.table.len(),
            added_columns: loaded.upgraded_columns,
            rewritten,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Option<LoadedTable>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let content = String::from_utf8(bytes).map_err(|err| {
            let valid = &err.as_bytes()[..err.utf8_error().valid_up_to()];
            let line = valid.iter().filter(|byte| **byte == b'\n').count() + 1;
            self.corrupt(line, "file is not valid UTF-8".to_string())
        })?;

        let mut records = codec::decode(&content)
            .map_err(|DecodeError { line, message }| self.corrupt(line, message))?
            .into_iter();

        let Some(header_record) = records.next() else {
            return Ok(None);
        };
        let header = header_record.fields;
        for (index, column) in header.iter().enumerate() {
            if column.trim().is_empty() {
                return Err(self.corrupt(1, format!("header column {index} is blank")));
            }
            if header[..index].contains(column) {
                return Err(self.corrupt(1, format!("header repeats column {column:?}")));
            }
        }

        let mut table = StoreTable::with_header(header);
        for record in records {
            let mut fields = record.fields;
            if fields.len() > table.header.len() {
                return Err(self.corrupt(
                    record.line,
                    format!(
                        "row has {} fields but header has {}",
                        fields.len(),
                        table.header.len()
                    ),
                ));
            }
            if fields.len() < table.header.len() {
                warn!(
                    store = self.layout.name(),
                    line = record.line,
                    "padding short row with empty values"
                );
                fields.resize(table.header.len(), String::new());
            }
            table
                .rows
                .push(table.header.iter().cloned().zip(fields).collect());
        }

        let upgraded_columns = table.widen(self.layout.columns().iter().map(String::as_str));
        if !upgraded_columns.is_empty() {
            warn!(
                store = self.layout.name(),
                columns = ?upgraded_columns,
                rows = table.len(),
                "reading older store generation; missing columns read as empty"
            );
        }

        Ok(Some(LoadedTable {
            table,
            upgraded_columns,
        }))
    }

    fn write_atomic(&self, table: &StoreTable) -> Result<(), StoreError> {
        let mut content = String::new();
        codec::push_record(&mut content, table.header.iter().map(String::as_str));
        for row in &table.rows {
            codec::push_record(
                &mut content,
                table
                    .header
                    .iter()
                    .map(|column| row.get(column).unwrap_or_default()),
            );
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let tmp_path = self
            .path
            .with_extension(format!("tmp-{}-{}", std::process::id(), Ulid::new()));
        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io {
                path: tmp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }

        Ok(())
    }

    fn corrupt(&self, line: usize, message: String) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            line,
            message,
        }
    }
}
