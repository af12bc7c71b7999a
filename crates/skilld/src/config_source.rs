//! Configuration sources read by the scheduler at the start of every pass.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use skill_core::config::{Config, ConfigError};
use tracing::warn;

/// Supplies the configuration for a reconciliation pass.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> Config;
}

/// A fixed configuration, used when no config file is given.
#[derive(Debug, Clone)]
pub struct StaticConfig(pub Config);

impl ConfigSource for StaticConfig {
    fn current(&self) -> Config {
        self.0.clone()
    }
}

/// Re-reads a `key=value` file on every call.
///
/// A file that fails to read or parse keeps the last good configuration in
/// effect, so a half-written edit never stops the scheduler.
#[derive(Debug)]
pub struct FileConfigSource {
    path: PathBuf,
    last_good: Mutex<Config>,
}

impl FileConfigSource {
    /// Load the file once; fails if it is unreadable at startup.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::from_file(&path)?;
        Ok(Self {
            path,
            last_good: Mutex::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn current(&self) -> Config {
        let mut last_good = self
            .last_good
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match Config::from_file(&self.path) {
            Ok(config) => {
                *last_good = config.clone();
                config
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "config reload failed, keeping previous values"
                );
                last_good.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn file_source_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skills.conf");
        fs::write(&path, "update_interval=2\n").unwrap();

        let source = FileConfigSource::new(&path).unwrap();
        assert_eq!(source.current().update_interval_secs(), 7200);

        fs::write(&path, "update_interval=0.5\nauto_update=false\n").unwrap();
        let config = source.current();
        assert_eq!(config.update_interval_secs(), 1800);
        assert!(!config.auto_update);
    }

    #[test]
    fn file_source_keeps_last_good_on_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skills.conf");
        fs::write(&path, "priority_skills=skill-a skill-b\n").unwrap();
        let source = FileConfigSource::new(&path).unwrap();

        fs::write(&path, "update_interval=never\n").unwrap();
        let config = source.current();
        assert_eq!(config.priority_skills, vec!["skill-a", "skill-b"]);

        fs::remove_file(&path).unwrap();
        let config = source.current();
        assert_eq!(config.priority_skills, vec!["skill-a", "skill-b"]);
    }

    #[test]
    fn file_source_requires_readable_file_at_startup() {
        let dir = TempDir::new().unwrap();
        let result = FileConfigSource::new(dir.path().join("missing.conf"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn static_source_returns_clone() {
        let mut config = Config::default();
        config.auto_update = false;
        let source = StaticConfig(config.clone());
        assert_eq!(source.current(), config);
    }
}
