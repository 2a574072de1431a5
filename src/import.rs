//! The hand-off of an exported file to a data warehouse.

use std::path::Path;

use serde::Serialize;

/// Loads an exported file into a warehouse table.
///
/// Implementations are expected to create the dataset and table if they are
/// missing, and to replace the table's contents with the file's rows.
pub trait WarehouseImporter {
    /// Load the file at `path` into `table_name`.
    fn import(&self, path: &Path, table_name: &str) -> Result<ImportResult, ImportError>;
}

/// A completed load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    /// The fully qualified table identifier.
    pub table: String,
    /// The warehouse's id for the load job.
    pub job_id: String,
}

/// The errors reported by a failed load job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Load job failed: {}", .0.join("; "))]
pub struct ImportError(pub Vec<String>);

impl ImportError {
    /// A failure with a single message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    /// The individual error messages.
    pub fn messages(&self) -> &[String] {
        &self.0
    }
}
