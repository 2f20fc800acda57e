//! Error types for persisted shared state.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading, saving or watching persisted values.
///
/// Persistence failures never reach the code reading a [`Shared`](crate::Shared)
/// value: a failed load falls back to the initial value and a failed save is
/// logged. These errors surface from the storage backends themselves.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Reading or writing the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No value is stored at the path.
    #[error("Nothing stored at {0}")]
    NotFound(PathBuf),

    /// The path has no file name to watch.
    #[error("Invalid storage path: {0}")]
    InvalidPath(PathBuf),

    /// JSON encoding or decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bincode encoding or decoding failed.
    #[error("Bincode codec error: {0}")]
    Bincode(#[from] bincode::Error),

    /// The file watcher could not be started.
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_path() {
        let error = PersistenceError::NotFound(PathBuf::from("/tmp/settings.json"));
        assert_eq!(error.to_string(), "Nothing stored at /tmp/settings.json");
    }
}
