use std::cmp::Ordering;

use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::StoreTable;

pub const TIMESTAMP_COLUMN: &str = "Timestamp";

/// Prediction history columns; `Timestamp` arrived with the second generation.
pub const PREDICTION_HISTORY_COLUMNS: [&str; 7] = [
    "CustomerID",
    "Tenure",
    "MonthlyCharges",
    "Contract",
    "Prediction",
    "Probability",
    TIMESTAMP_COLUMN,
];

pub const FEEDBACK_LOG_COLUMNS: [&str; 3] = ["Name", "Feedback", TIMESTAMP_COLUMN];

/// Column generation a store is read and written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    name: String,
    columns: Vec<String>,
    timestamp_column: Option<String>,
}

impl StoreLayout {
    /// A layout with no required columns; the header grows with appended rows.
    #[must_use]
    pub fn open_ended(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            timestamp_column: None,
        }
    }

    #[must_use]
    pub fn new<'a>(name: impl Into<String>, columns: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(str::to_string).collect(),
            timestamp_column: None,
        }
    }

    /// Orders display newest-first by `column`, adding it to the layout if needed.
    #[must_use]
    pub fn with_timestamp(mut self, column: &str) -> Self {
        if !self.columns.iter().any(|existing| existing == column) {
            self.columns.push(column.to_string());
        }
        self.timestamp_column = Some(column.to_string());
        self
    }

    #[must_use]
    pub fn prediction_history() -> Self {
        Self::new("prediction_history", PREDICTION_HISTORY_COLUMNS).with_timestamp(TIMESTAMP_COLUMN)
    }

    #[must_use]
    pub fn feedback_log() -> Self {
        Self::new("feedback_log", FEEDBACK_LOG_COLUMNS).with_timestamp(TIMESTAMP_COLUMN)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn timestamp_column(&self) -> Option<&str> {
        self.timestamp_column.as_deref()
    }

    /// File indices of `table` rows in display order.
    ///
    /// With a timestamp column present, newest first; rows whose timestamp is
    /// empty or unparseable (typically upgraded legacy rows) go last. Rows
    /// sharing a timestamp, and the untimed tail, show later file rows first.
    /// Layouts without a timestamp keep file order.
    #[must_use]
    pub fn display_order(&self, table: &StoreTable) -> Vec<usize> {
        let mut order: Vec<usize> = (0..table.rows.len()).collect();
        let Some(column) = self.timestamp_column() else {
            return order;
        };
        if !table.header.iter().any(|existing| existing == column) {
            return order;
        }

        let stamps: Vec<Option<OffsetDateTime>> = table
            .rows
            .iter()
            .map(|row| row.get(column).and_then(parse_display_timestamp))
            .collect();

        order.sort_by(|lhs, rhs| match (stamps[*lhs], stamps[*rhs]) {
            (Some(left), Some(right)) => right.cmp(&left).then(rhs.cmp(lhs)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => rhs.cmp(lhs),
        });
        order
    }
}

/// Accepts RFC3339 and the `YYYY-MM-DD HH:MM:SS` form older writers used (read as UTC).
#[must_use]
pub fn parse_display_timestamp(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) =
        OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
    {
        return Some(parsed);
    }

    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Row;

    fn stamped_table(stamps: &[&str]) -> StoreTable {
        let mut table =
            StoreTable::with_header(vec!["Name".to_string(), TIMESTAMP_COLUMN.to_string()]);
        for (index, stamp) in stamps.iter().enumerate() {
            table.rows.push(
                Row::new()
                    .with("Name", format!("row-{index}"))
                    .with(TIMESTAMP_COLUMN, *stamp),
            );
        }
        table
    }

    #[test]
    fn timestamp_layouts_display_newest_first_with_blank_rows_last() {
        let table = stamped_table(&[
            "",
            "2026-02-07T12:00:00Z",
            "2026-02-09 08:30:00",
            "garbage",
            "2026-02-08T12:00:00Z",
        ]);
        let order = StoreLayout::feedback_log().display_order(&table);
        assert_eq!(order, vec![2, 4, 1, 3, 0]);
    }

    #[test]
    fn layouts_without_timestamp_keep_file_order() {
        let table = stamped_table(&["2026-02-07T12:00:00Z", "2026-02-09T12:00:00Z"]);
        let order = StoreLayout::open_ended("scratch").display_order(&table);
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn equal_timestamps_show_later_rows_first() {
        let table = stamped_table(&[
            "2026-02-07T12:00:00Z",
            "2026-02-07T12:00:00Z",
            "2026-02-06T12:00:00Z",
            "2026-02-07T12:00:00Z",
        ]);
        assert_eq!(StoreLayout::feedback_log().display_order(&table), vec![3, 1, 0, 2]);
    }

    #[test]
    fn with_timestamp_registers_the_column_once() {
        let layout = StoreLayout::new("x", ["A", TIMESTAMP_COLUMN]).with_timestamp(TIMESTAMP_COLUMN);
        assert_eq!(layout.columns(), &["A".to_string(), TIMESTAMP_COLUMN.to_string()]);
        assert_eq!(layout.timestamp_column(), Some(TIMESTAMP_COLUMN));
    }

    #[test]
    fn legacy_timestamp_format_is_read_as_utc() {
        let parsed = parse_display_timestamp("2026-02-09 08:30:00");
        let expected =
            OffsetDateTime::parse("2026-02-09T08:30:00Z", &time::format_description::well_known::Rfc3339)
                .ok();
        assert_eq!(parsed, expected);
    }
}
