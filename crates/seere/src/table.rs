//! Result tables logged to a run.

use std::path::Path;

use forneus_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A column-named table of JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
}

impl Table {
    /// Creates an empty table with the given columns.
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            data: Vec::new(),
        }
    }

    /// Appends one row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the row length differs from the
    /// number of columns.
    pub fn add_data(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::ShapeMismatch {
                message: format!(
                    "table row has {} values for {} columns",
                    row.len(),
                    self.columns.len()
                ),
            });
        }
        self.data.push(row);
        Ok(())
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in insertion order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.data
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values of one column, if it exists.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.data.iter().map(|row| &row[idx]).collect())
    }

    /// Reads a table written by [`Table::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the table as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_data_checks_width() {
        let mut table = Table::new(["prompt", "generation"]);
        table.add_data(vec![json!("a"), json!("b")]).unwrap();
        assert!(table.add_data(vec![json!("a")]).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_column_lookup() {
        let mut table = Table::new(["prompt", "max_new_tokens"]);
        table.add_data(vec![json!("p1"), json!(8)]).unwrap();
        table.add_data(vec![json!("p2"), json!(8)]).unwrap();
        assert_eq!(table.column("prompt").unwrap(), vec![&json!("p1"), &json!("p2")]);
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.table.json");
        let mut table = Table::new(["a"]);
        table.add_data(vec![json!(1.5)]).unwrap();
        table.save(&path).unwrap();
        assert_eq!(Table::from_file(&path).unwrap(), table);
    }
}
