//! Text-protocol row representation.
//!
//! Every non-NULL field arrives as raw bytes; numeric and temporal
//! interpretation is left to the caller.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared across all rows in a result set.
///
/// Wrapped in `Arc` so all rows from the same query share one copy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    #[serde(skip)]
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    ///
    /// When two columns share a name the first one wins for name lookups.
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row of a text result set.
#[derive(Debug, Clone, Serialize)]
pub struct Row {
    /// Field values in column order; `None` is SQL NULL
    values: Vec<Option<Vec<u8>>>,
    /// Shared column metadata
    #[serde(skip)]
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Option<Vec<u8>>>) -> Self {
        Self { values, columns }
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Get the number of fields in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a field by index.
    ///
    /// Returns `None` when the index is out of range, `Some(None)` for NULL.
    pub fn get(&self, index: usize) -> Option<Option<&[u8]>> {
        self.values.get(index).map(Option::as_deref)
    }

    /// Get a field by column name.
    pub fn get_by_name(&self, name: &str) -> Option<Option<&[u8]>> {
        self.columns.index_of(name).and_then(|i| self.get(i))
    }

    /// Get a field as UTF-8 text, `None` for NULL, out of range, or invalid UTF-8.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index)
            .flatten()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Check whether the field at `index` is SQL NULL.
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Iterate over the field values.
    pub fn values(&self) -> impl Iterator<Item = Option<&[u8]>> {
        self.values.iter().map(Option::as_deref)
    }

    /// Iterate over (column name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&[u8]>)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values())
    }

    /// Consume the row and return its values.
    pub fn into_values(self) -> Vec<Option<Vec<u8>>> {
        self.values
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}
