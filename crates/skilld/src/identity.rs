//! File-backed device identity.
//!
//! The pairing service writes `{uuid, access, ...}` to the identity file once
//! the device is paired. The file is read on every call, so pairing is picked
//! up without a restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use skill_core::types::SkillInventory;
use tracing::debug;

use crate::manifest::{Identity, IdentityError, Result};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Contents of the identity file. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub access: String,
}

impl DeviceIdentity {
    pub fn is_paired(&self) -> bool {
        !self.uuid.is_empty() && !self.access.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
    api_url: String,
}

impl FileIdentity {
    pub fn new(path: impl Into<PathBuf>, api_url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<DeviceIdentity> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Manifest endpoint for a device.
    pub fn skill_json_url(&self, uuid: &str) -> String {
        format!("{}/v1/device/{uuid}/skillJson", self.api_url)
    }
}

impl Identity for FileIdentity {
    fn is_paired(&self) -> bool {
        match self.load() {
            Ok(identity) => identity.is_paired(),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no usable identity");
                false
            }
        }
    }

    fn upload_inventory(&self, inventory: &SkillInventory) -> Result<()> {
        let identity = self.load()?;
        if !identity.is_paired() {
            return Err(IdentityError::NotPaired);
        }

        // Built per call: the blocking client must not be created or dropped
        // on an async runtime thread.
        let client = reqwest::blocking::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| IdentityError::Request(e.to_string()))?;

        let url = self.skill_json_url(&identity.uuid);
        let body = serde_json::to_vec(inventory)?;
        let response = client
            .put(&url)
            .header(AUTHORIZATION, format!("Bearer {}", identity.access))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| IdentityError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Status(status.as_u16()));
        }
        debug!(url = %url, "manifest accepted");
        Ok(())
    }
}
