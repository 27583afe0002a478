//! The staged form of a spreadsheet.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A header row plus string cells, as written to `<stem>.table.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Column headers in source order.
    pub columns: Vec<String>,
    /// Data rows; each row has `columns.len()` cells.
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Creates a table, padding or truncating rows to the header width.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Returns the index of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns true when there are no data rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reads a staged table.
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Writes the table as pretty JSON, replacing any previous file.
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_normalized_to_width() {
        let table = Table::new(
            vec!["a".into(), "b".into()],
            vec![vec!["1".into()], vec!["1".into(), "2".into(), "3".into()]],
        );
        assert_eq!(table.rows[0], vec!["1", ""]);
        assert_eq!(table.rows[1], vec!["1", "2"]);
        assert_eq!(table.column_index("b"), Some(1));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.table.json");
        let table = Table::new(vec!["name".into()], vec![vec!["Ann".into()]]);

        table.write(&path).await.unwrap();
        assert_eq!(Table::read(&path).await.unwrap(), table);
    }
}
