//! Package backend boundary.
//!
//! The scheduler only sees this trait. Calls block and are made from the
//! pass worker thread; the backend never retries on its own.

use skill_core::types::{SkillInventory, SkillRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("skill not found in catalog: {0}")]
    NotFound(String),
    #[error("skill not installed: {0}")]
    NotInstalled(String),
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("invalid skill name: {0:?}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Lists, installs, updates and removes skills.
pub trait PackageBackend: Send + Sync {
    /// All known skills: catalog entries plus local-only installs.
    fn list(&self) -> Result<Vec<SkillRecord>>;

    /// Install a catalog skill. Installing an already-present skill is a no-op.
    fn install(&self, id: &str) -> Result<()>;

    /// Bring a local skill up to date with its source.
    fn update(&self, id: &str) -> Result<()>;

    /// Delete a local skill.
    fn remove(&self, id: &str) -> Result<()>;

    /// Manifest of installed skills for the identity service.
    fn inventory(&self) -> Result<SkillInventory>;
}
