//! Stale lock recovery.
//!
//! A killed package operation can leave `<skill>/.git/index.lock` behind,
//! which makes every later git call on that skill fail. Passes are serialized,
//! so any marker found at the start of a pass belongs to a dead operation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Lock marker path relative to a skill directory.
pub const LOCK_MARKER: &str = ".git/index.lock";

/// A lock that could not be inspected or removed. Never fatal.
#[derive(Debug, Error)]
#[error("lock recovery failed for {path}: {source}")]
pub struct LockRecoveryWarning {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Default)]
pub struct LockRecoveryReport {
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<LockRecoveryWarning>,
}

/// Delete every `<child>/.git/index.lock` under `skills_root`.
///
/// Only immediate children are inspected; other files are left alone.
pub fn remove_stale_locks(skills_root: &Path) -> LockRecoveryReport {
    let mut report = LockRecoveryReport::default();

    let entries = match fs::read_dir(skills_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %skills_root.display(), "skills directory missing, no locks to recover");
            return report;
        }
        Err(e) => {
            warn!(path = %skills_root.display(), error = %e, "failed to scan skills directory");
            report.warnings.push(LockRecoveryWarning {
                path: skills_root.to_path_buf(),
                source: e,
            });
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %skills_root.display(), error = %e, "failed to read directory entry");
                report.warnings.push(LockRecoveryWarning {
                    path: skills_root.to_path_buf(),
                    source: e,
                });
                continue;
            }
        };

        let skill_dir = entry.path();
        if !skill_dir.is_dir() {
            continue;
        }

        let lock = skill_dir.join(LOCK_MARKER);
        if !lock.is_file() {
            continue;
        }

        match fs::remove_file(&lock) {
            Ok(()) => {
                info!(path = %lock.display(), "removed stale lock");
                report.removed.push(lock);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %lock.display(), "lock already removed");
            }
            Err(e) => {
                warn!(path = %lock.display(), error = %e, "failed to remove stale lock");
                report.warnings.push(LockRecoveryWarning {
                    path: lock,
                    source: e,
                });
            }
        }
    }

    report.removed.sort();
    report
}
