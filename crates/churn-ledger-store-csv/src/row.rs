use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Column name -> text value, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(column, value);
        self
    }

    /// Replaces the value of an existing column or appends a new one.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Reorders into `header` order; columns the row lacks become empty.
    pub(crate) fn aligned_to(&self, header: &[String]) -> Self {
        Self {
            cells: header
                .iter()
                .map(|column| {
                    (
                        column.clone(),
                        self.get(column).unwrap_or_default().to_string(),
                    )
                })
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (column, value) in iter {
            row.set(column, value);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Header plus rows; every row carries exactly the header's columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreTable {
    pub header: Vec<String>,
    pub rows: Vec<Row>,
}

impl StoreTable {
    #[must_use]
    pub fn with_header(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends columns the header lacks and back-fills existing rows with
    /// empty values. Returns the columns that were added.
    pub(crate) fn widen<'a>(&mut self, columns: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut added = Vec::new();
        for column in columns {
            if !self.header.iter().any(|existing| existing == column) {
                self.header.push(column.to_string());
                added.push(column.to_string());
            }
        }

        if !added.is_empty() {
            for row in &mut self.rows {
                *row = row.aligned_to(&self.header);
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place_and_keeps_order() {
        let mut row = Row::new().with("A", "1").with("B", "2");
        row.set("A", "9");
        row.set("C", "3");
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["A", "B", "C"]);
        assert_eq!(row.get("A"), Some("9"));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn widen_backfills_existing_rows() {
        let mut table = StoreTable::with_header(vec!["A".to_string(), "B".to_string()]);
        table.rows.push(Row::new().with("A", "1").with("B", "2"));

        let added = table.widen(["B", "C"]);
        assert_eq!(added, vec!["C".to_string()]);
        assert_eq!(table.header, vec!["A", "B", "C"]);
        assert_eq!(table.rows[0].get("C"), Some(""));
        assert_eq!(table.rows[0].len(), 3);
    }
}
