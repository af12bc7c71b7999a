//! Git-backed package backend.
//!
//! The catalog is the `.gitmodules` file of a skills repository kept in a
//! local cache. Each skill installs as a plain clone under the skills root.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use skill_core::config::Config;
use skill_core::types::{InventoryEntry, SkillInventory, SkillRecord};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, PackageBackend, Result};
use crate::config_source::ConfigSource;

/// One `[submodule]` block of the catalog repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub path: String,
    pub url: String,
}

/// Parse the submodule blocks of a `.gitmodules` file.
///
/// Blocks without a `url` are skipped.
pub fn parse_gitmodules(content: &str) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    let mut current: Option<(String, Option<String>, Option<String>)> = None;

    let mut flush = |block: Option<(String, Option<String>, Option<String>)>| {
        if let Some((name, path, Some(url))) = block {
            let path = path.unwrap_or_else(|| name.clone());
            entries.push(CatalogEntry { name, path, url });
        }
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if let Some(header) = trimmed.strip_prefix("[submodule") {
            flush(current.take());
            let name = header
                .trim_end_matches(']')
                .trim()
                .trim_matches('"')
                .to_string();
            current = Some((name, None, None));
            continue;
        }

        if trimmed.starts_with('[') {
            flush(current.take());
            continue;
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        if let Some((_, path, url)) = current.as_mut() {
            match key.trim() {
                "path" => *path = Some(value.trim().to_string()),
                "url" => *url = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    flush(current.take());

    entries
}

/// True if `name` is a single normal path component that git will not read
/// as an option.
pub fn is_valid_skill_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    ) && !name.starts_with('-')
        && !name.contains(['/', '\\'])
}

fn checked_name(id: &str) -> Result<&str> {
    if is_valid_skill_name(id) {
        Ok(id)
    } else {
        Err(BackendError::InvalidName(id.to_string()))
    }
}

pub struct GitBackend {
    config: Arc<dyn ConfigSource>,
}

impl std::fmt::Debug for GitBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitBackend").finish_non_exhaustive()
    }
}

impl GitBackend {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self { config }
    }

    /// Clone the catalog repository, or fast-forward an existing cache.
    ///
    /// A failed pull keeps the cached catalog; only a missing cache is an error.
    fn sync_catalog(config: &Config) -> Result<()> {
        let cache = config.repo_cache_dir();

        if cache.join(".git").exists() {
            let mut cmd = git(Some(&cache));
            cmd.args(["pull", "--ff-only"]);
            if let Err(e) = run(cmd) {
                warn!(path = %cache.display(), error = %e, "catalog update failed, using cached copy");
            }
            return Ok(());
        }

        if let Some(parent) = cache.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(url = %config.repo_url, branch = %config.repo_branch, "cloning skills catalog");
        let mut cmd = git(None);
        cmd.arg("clone")
            .arg(format!("--branch={}", config.repo_branch))
            .args(["--", &config.repo_url])
            .arg(&cache);
        run(cmd).map_err(|e| BackendError::CatalogUnavailable(e.to_string()))?;
        Ok(())
    }

    fn read_catalog(config: &Config) -> Result<Vec<CatalogEntry>> {
        let path = config.repo_cache_dir().join(".gitmodules");
        match fs::read_to_string(&path) {
            Ok(content) => Ok(parse_gitmodules(&content)
                .into_iter()
                .filter(|entry| {
                    let valid = is_valid_skill_name(&entry.name);
                    if !valid {
                        warn!(name = %entry.name, "skipping catalog entry with invalid name");
                    }
                    valid
                })
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(
                BackendError::CatalogUnavailable(format!("{} not found", path.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

impl PackageBackend for GitBackend {
    fn list(&self) -> Result<Vec<SkillRecord>> {
        let config = self.config.current();
        Self::sync_catalog(&config)?;
        let catalog = Self::read_catalog(&config)?;
        let skills_dir = config.skills_dir();

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(catalog.len());
        for entry in catalog {
            if !seen.insert(entry.name.clone()) {
                continue;
            }
            let path = skills_dir.join(&entry.name);
            let mut record = SkillRecord::new(entry.name, &path, path.is_dir());
            record.updated_at = modified_at(&path);
            record.url = Some(entry.url);
            records.push(record);
        }

        for (id, path) in local_skill_dirs(&skills_dir)? {
            if seen.contains(&id) {
                continue;
            }
            let mut record = SkillRecord::new(id, &path, true);
            record.updated_at = modified_at(&path);
            records.push(record);
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = records.len(), "listed skills");
        Ok(records)
    }

    fn install(&self, id: &str) -> Result<()> {
        let id = checked_name(id)?;
        let config = self.config.current();
        let skills_dir = config.skills_dir();
        let target = skills_dir.join(id);

        if target.is_dir() {
            debug!(skill = %id, "already installed");
            return Ok(());
        }

        let entry = Self::read_catalog(&config)?
            .into_iter()
            .find(|e| e.name == id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;

        fs::create_dir_all(&skills_dir)?;
        let mut cmd = git(None);
        cmd.args(["clone", "--", &entry.url]).arg(&target);
        if let Err(e) = run(cmd) {
            // Leave no half-cloned directory behind to be mistaken for an install.
            if target.exists() {
                fs::remove_dir_all(&target).ok();
            }
            return Err(e);
        }

        info!(skill = %id, url = %entry.url, "installed skill");
        Ok(())
    }

    fn update(&self, id: &str) -> Result<()> {
        let id = checked_name(id)?;
        let config = self.config.current();
        let path = config.skills_dir().join(id);

        if !path.is_dir() {
            return Err(BackendError::NotInstalled(id.to_string()));
        }
        if !path.join(".git").exists() {
            debug!(skill = %id, "not a git checkout, skipping update");
            return Ok(());
        }

        let mut cmd = git(Some(&path));
        cmd.args(["pull", "--ff-only"]);
        run(cmd)?;
        debug!(skill = %id, "updated skill");
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let id = checked_name(id)?;
        let config = self.config.current();
        let path = config.skills_dir().join(id);

        if !path.is_dir() {
            return Err(BackendError::NotInstalled(id.to_string()));
        }
        fs::remove_dir_all(&path)?;
        info!(skill = %id, path = %path.display(), "removed skill");
        Ok(())
    }

    fn inventory(&self) -> Result<SkillInventory> {
        let config = self.config.current();
        let catalog: HashSet<String> = match Self::read_catalog(&config) {
            Ok(entries) => entries.into_iter().map(|e| e.name).collect(),
            Err(e) => {
                warn!(error = %e, "catalog unavailable, reporting all skills as local");
                HashSet::new()
            }
        };

        let skills = local_skill_dirs(&config.skills_dir())?
            .into_iter()
            .map(|(name, path)| {
                let origin = if catalog.contains(&name) { "catalog" } else { "local" };
                let status = if config.is_blacklisted(&name) {
                    "blacklisted"
                } else {
                    "active"
                };
                InventoryEntry {
                    origin: origin.to_string(),
                    installation: "installed".to_string(),
                    status: status.to_string(),
                    beta: false,
                    updated: modified_at(&path).map_or(0, |t| t.timestamp()),
                    name,
                }
            })
            .collect();

        Ok(SkillInventory::new(config.blacklisted_skills.clone(), skills))
    }
}

fn git(cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    // Never block a pass on a credential prompt.
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

fn run(mut cmd: Command) -> Result<String> {
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(BackendError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    String::from_utf8(output.stdout).map_err(|_| BackendError::InvalidUtf8)
}

/// Visible directories directly under the skills root.
fn local_skill_dirs(skills_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(skills_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') || !path.is_dir() {
            continue;
        }
        dirs.push((name, path));
    }
    dirs.sort();
    Ok(dirs)
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
