#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionFlagKind {
    #[default]
    Directory,
    File,
}

impl CompletionFlagKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dir" | "directory" => Some(Self::Directory),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("completion flag {path}: {source}")]
pub struct CompletionError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Marker another process polls for to learn that population finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionFlag {
    path: PathBuf,
    kind: CompletionFlagKind,
}

impl CompletionFlag {
    pub fn new(path: impl Into<PathBuf>, kind: CompletionFlagKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes a leftover flag from an earlier run. Returns whether one existed.
    pub fn clear(&self) -> Result<bool, CompletionError> {
        let removed = if self.path.is_dir() {
            info!(path = %self.path.display(), "removing completion flag directory");
            fs::remove_dir_all(&self.path)
        } else if self.path.exists() {
            info!(path = %self.path.display(), "removing completion flag file");
            fs::remove_file(&self.path)
        } else {
            return Ok(false);
        };
        removed.map_err(|source| self.error(source))?;
        Ok(true)
    }

    pub fn mark(&self) -> Result<(), CompletionError> {
        info!(path = %self.path.display(), kind = ?self.kind, "creating completion flag");
        let created = match self.kind {
            CompletionFlagKind::Directory => fs::create_dir_all(&self.path),
            CompletionFlagKind::File => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|source| self.error(source))?;
                }
                fs::write(&self.path, b"")
            }
        };
        created.map_err(|source| self.error(source))
    }

    fn error(&self, source: io::Error) -> CompletionError {
        CompletionError {
            path: self.path.clone(),
            source,
        }
    }
}

/// Deletes an output file left behind by an earlier run so downstream
/// checks only ever see this run's output. Directories are left alone.
pub fn remove_stale_output(path: &Path) -> Result<bool, CompletionError> {
    if !path.is_file() {
        info!(path = %path.display(), "no stale output file to remove");
        return Ok(false);
    }
    info!(path = %path.display(), "removing stale output file");
    fs::remove_file(path).map_err(|source| CompletionError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(true)
}
