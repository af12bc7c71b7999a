//! Configuration parsing for the skill manager daemon.
//!
//! Uses a `key=value` file format (`skills.conf`).
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the file holding the installed skill identifiers, relative to `data_dir`.
pub const INSTALLED_SKILLS_FILE: &str = ".skills";

/// Name of the pairing identity file, relative to `data_dir`.
pub const IDENTITY_FILE: &str = "identity2.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid number for {key}: {value}")]
    InvalidNumber { key: String, value: String },
}

/// Skill manager configuration.
///
/// `directory` and `repo_cache` are resolved against `data_dir` when relative
/// (see [`Config::skills_dir`] and [`Config::repo_cache_dir`]).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories
    pub data_dir: PathBuf,
    pub directory: PathBuf,

    // Scheduling
    /// Hours between reconciliation passes. Always finite and positive.
    pub update_interval: f64,
    pub auto_update: bool,

    // Skill selection
    pub blacklisted_skills: Vec<String>,
    pub priority_skills: Vec<String>,

    // Manifest
    pub upload_skill_manifest: bool,
    pub api_url: String,
    pub identity_file: Option<PathBuf>,

    // Package backend repository
    pub repo_cache: PathBuf,
    pub repo_url: String,
    pub repo_branch: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir().map_or_else(
                || PathBuf::from("~/.local/share/skilld"),
                |d| d.join("skilld"),
            ),
            directory: PathBuf::from("skills"),
            update_interval: 1.0,
            auto_update: true,
            blacklisted_skills: Vec::new(),
            priority_skills: vec!["mycroft-pairing".to_string(), "mycroft-volume".to_string()],
            upload_skill_manifest: true,
            api_url: "https://api.mycroft.ai".to_string(),
            identity_file: None,
            repo_cache: PathBuf::from(".skills-repo"),
            repo_url: "https://github.com/MycroftAI/mycroft-skills".to_string(),
            repo_branch: "19.08".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "directory" => self.directory = PathBuf::from(value),
            "update_interval" => self.update_interval = Self::parse_interval(key, value)?,
            "auto_update" => self.auto_update = Self::parse_bool(key, value)?,
            "blacklisted_skills" => self.blacklisted_skills = Self::parse_list(value),
            "priority_skills" => self.priority_skills = Self::parse_list(value),
            "upload_skill_manifest" => self.upload_skill_manifest = Self::parse_bool(key, value)?,
            "api_url" => self.api_url = value.trim_end_matches('/').to_string(),
            "identity_file" => {
                self.identity_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "repo_cache" => self.repo_cache = PathBuf::from(value),
            "repo_url" => self.repo_url = value.to_string(),
            "repo_branch" => self.repo_branch = value.to_string(),
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Parse the update interval in hours. Must be finite and greater than zero.
    fn parse_interval(key: &str, value: &str) -> Result<f64, ConfigError> {
        match value.parse::<f64>() {
            Ok(hours) if hours.is_finite() && hours > 0.0 => Ok(hours),
            _ => Err(ConfigError::InvalidNumber {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Parse a list of skill identifiers separated by whitespace or commas.
    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Update interval in whole seconds (at least one).
    pub fn update_interval_secs(&self) -> u64 {
        ((self.update_interval * 3600.0).round() as u64).max(1)
    }

    /// Absolute skills root directory.
    pub fn skills_dir(&self) -> PathBuf {
        self.resolve(&self.directory)
    }

    /// Absolute repository cache directory used by the package backend.
    pub fn repo_cache_dir(&self) -> PathBuf {
        self.resolve(&self.repo_cache)
    }

    /// Path of the persisted installed-set file.
    pub fn installed_skills_file(&self) -> PathBuf {
        self.data_dir.join(INSTALLED_SKILLS_FILE)
    }

    /// Path of the pairing identity file.
    pub fn identity_path(&self) -> PathBuf {
        match &self.identity_file {
            Some(path) => self.resolve(path),
            None => self.data_dir.join(IDENTITY_FILE),
        }
    }

    pub fn is_blacklisted(&self, skill: &str) -> bool {
        self.blacklisted_skills.iter().any(|s| s == skill)
    }

    pub fn is_priority(&self, skill: &str) -> bool {
        self.priority_skills.iter().any(|s| s == skill)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.data_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

/// Optional dependency for resolving user directories.
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert!((config.update_interval - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.update_interval_secs(), 3600);
        assert!(config.auto_update);
        assert!(config.upload_skill_manifest);
        assert!(config.blacklisted_skills.is_empty());
        assert_eq!(config.directory, PathBuf::from("skills"));
        assert_eq!(config.repo_cache, PathBuf::from(".skills-repo"));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# skill manager settings
data_dir=/var/lib/skilld
update_interval=0.5
auto_update=no
priority_skills="mycroft-pairing, mycroft-volume skill-stop"
blacklisted_skills=skill-media
upload_skill_manifest=false
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/skilld"));
        assert_eq!(config.update_interval_secs(), 1800);
        assert!(!config.auto_update);
        assert_eq!(
            config.priority_skills,
            vec!["mycroft-pairing", "mycroft-volume", "skill-stop"]
        );
        assert_eq!(config.blacklisted_skills, vec!["skill-media"]);
        assert!(!config.upload_skill_manifest);
    }

    #[test]
    fn parse_repo_settings() {
        let mut config = Config::default();
        let content = r#"
repo_cache=/tmp/cache
repo_url='https://example.com/skills.git'
repo_branch=20.02
api_url=https://api.example.com/
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.repo_cache_dir(), PathBuf::from("/tmp/cache"));
        assert_eq!(config.repo_url, "https://example.com/skills.git");
        assert_eq!(config.repo_branch, "20.02");
        assert_eq!(config.api_url, "https://api.example.com");
    }

    #[test]
    fn relative_paths_resolve_against_data_dir() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/opt/mycroft");
        assert_eq!(config.skills_dir(), PathBuf::from("/opt/mycroft/skills"));
        assert_eq!(config.repo_cache_dir(), PathBuf::from("/opt/mycroft/.skills-repo"));
        assert_eq!(
            config.installed_skills_file(),
            PathBuf::from("/opt/mycroft/.skills")
        );
        assert_eq!(
            config.identity_path(),
            PathBuf::from("/opt/mycroft/identity2.json")
        );

        config.directory = PathBuf::from("/srv/skills");
        assert_eq!(config.skills_dir(), PathBuf::from("/srv/skills"));
    }

    #[test]
    fn rejects_non_positive_interval() {
        for bad in ["0", "-1", "NaN", "inf", "hourly"] {
            let mut config = Config::default();
            let result = config.parse_content(&format!("update_interval={bad}"));
            assert!(
                matches!(result, Err(ConfigError::InvalidNumber { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn tiny_interval_rounds_up_to_one_second() {
        let mut config = Config::default();
        config.parse_content("update_interval=0.00001").unwrap();
        assert_eq!(config.update_interval_secs(), 1);
    }

    #[test]
    fn rejects_line_without_equals() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("auto_update"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "1").unwrap());
        assert!(Config::parse_bool("test", "yes").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "false").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "no").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn blacklist_and_priority_are_exact_matches() {
        let mut config = Config::default();
        config.blacklisted_skills = vec!["skill-media".to_string()];
        config.priority_skills = vec!["mycroft-pairing".to_string()];
        assert!(config.is_blacklisted("skill-media"));
        assert!(!config.is_blacklisted("Skill-Media"));
        assert!(config.is_priority("mycroft-pairing"));
        assert!(!config.is_priority("mycroft"));
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("skills.conf");
        std::fs::write(&path, "auto_update=off\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(!config.auto_update);
        assert_eq!(config.repo_branch, Config::default().repo_branch);
    }
}
