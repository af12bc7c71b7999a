//! Installed-set persistence.
//!
//! One skill identifier per line, newline-terminated, nothing else. A missing
//! file means nothing is installed yet. Saves go through a temp file and a
//! rename, so a crash leaves either the old content or the new content.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read installed skills from {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write installed skills to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// File-backed set of installed skill identifiers.
#[derive(Debug, Clone)]
pub struct InstalledSetStore {
    path: PathBuf,
}

impl InstalledSetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted set. A missing file yields an empty set.
    pub fn load(&self) -> Result<HashSet<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Replace the persisted set with `ids`, one per line, in the given order.
    ///
    /// Repeated identifiers are written once, at their first position.
    pub fn save<S: AsRef<str>>(&self, ids: &[S]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut content = String::new();
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() || !seen.insert(id) {
                continue;
            }
            content.push_str(id);
            content.push('\n');
        }

        self.write_atomic(content.as_bytes())
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }

    fn write_atomic(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.tmp_path();
        let result = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        })();

        if result.is_err() {
            fs::remove_file(&tmp_path).ok();
        }
        result
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
