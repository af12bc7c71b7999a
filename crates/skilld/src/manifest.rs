//! Skill manifest reporting to the device identity service.

use std::sync::Arc;

use skill_core::types::SkillInventory;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::backend::PackageBackend;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("device is not paired")]
    NotPaired,
    #[error("failed to read identity: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid identity file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("upload request failed: {0}")]
    Request(String),
    #[error("upload rejected with status {0}")]
    Status(u16),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Pairing state and manifest upload endpoint of the device.
pub trait Identity: Send + Sync {
    fn is_paired(&self) -> bool;
    fn upload_inventory(&self, inventory: &SkillInventory) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    NotPaired,
    Uploaded,
    InventoryFailed(String),
    UploadFailed(String),
}

pub struct ManifestReporter {
    identity: Arc<dyn Identity>,
}

impl std::fmt::Debug for ManifestReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestReporter").finish_non_exhaustive()
    }
}

impl ManifestReporter {
    pub fn new(identity: Arc<dyn Identity>) -> Self {
        Self { identity }
    }

    /// Upload the current inventory once if the device is paired.
    ///
    /// Errors are logged and returned as an outcome; nothing propagates.
    pub fn post_manifest(&self, backend: &dyn PackageBackend) -> ManifestOutcome {
        if !self.identity.is_paired() {
            debug!("device not paired, skipping manifest upload");
            return ManifestOutcome::NotPaired;
        }

        let inventory = match backend.inventory() {
            Ok(inventory) => inventory,
            Err(e) => {
                error!(error = %e, "failed to build skill inventory");
                return ManifestOutcome::InventoryFailed(e.to_string());
            }
        };

        match self.identity.upload_inventory(&inventory) {
            Ok(()) => {
                info!(skills = inventory.skills.len(), digest = %inventory.digest, "uploaded skill manifest");
                ManifestOutcome::Uploaded
            }
            Err(e) => {
                error!(error = %e, "skill manifest upload failed");
                ManifestOutcome::UploadFailed(e.to_string())
            }
        }
    }
}
