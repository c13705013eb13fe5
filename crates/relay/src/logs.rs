//! Persists device log dumps received in `getLogs` replies.
//!
//! A dump is plain text whose first line is the path the log had on the
//! device. Only the basename of that path is kept; the remaining lines become
//! the file body under the logs directory.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("log content is empty")]
    Empty,
    #[error("no usable file name in header line {0:?}")]
    InvalidFileName(String),
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write log file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct LogWriter {
    dir: PathBuf,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a log dump, overwriting any previous file of the same name.
    /// Returns the path written.
    pub async fn write(&self, content: &str) -> Result<PathBuf, LogWriteError> {
        let (file_name, body) = split_dump(content)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| LogWriteError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.dir.join(file_name);
        tokio::fs::write(&path, &body)
            .await
            .map_err(|source| LogWriteError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), bytes = body.len(), "log file written");
        Ok(path)
    }
}

/// Split a dump into (basename of the header path, body).
fn split_dump(content: &str) -> Result<(&str, String), LogWriteError> {
    let mut lines = content.lines();
    let header = lines.next().ok_or(LogWriteError::Empty)?;

    let file_name = header.rsplit('/').next().unwrap_or(header);
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(LogWriteError::InvalidFileName(header.to_string()));
    }

    Ok((file_name, lines.collect::<Vec<_>>().join("\n")))
}

// ===========================================================================
// Tests
// ===========================================================================
