//! Core types for the skill manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for reconciliation passes and bus messages.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A skill as seen by the package backend: catalog entry, local install, or both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRecord {
    /// Unique identifier (case-sensitive).
    pub id: String,
    /// Install path under the skills root.
    pub path: PathBuf,
    /// Present on disk.
    pub is_local: bool,
    /// Listed in the configured priority skills.
    #[serde(default)]
    pub is_priority: bool,
    /// Last modification of the local install, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Remote source, when the catalog knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SkillRecord {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, is_local: bool) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            is_local,
            is_priority: false,
            updated_at: None,
            url: None,
        }
    }
}

// --- Scheduler state ---

/// Reconciliation scheduler lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerPhase {
    Idle,
    Running,
    Stopped,
}

impl SchedulerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }
}

/// What caused a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Timer,
    UpdateCommand,
    Connected,
    Paired,
    /// A deactivated skill was reactivated.
    Activated,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::UpdateCommand => "update_command",
            Self::Connected => "connected",
            Self::Paired => "paired",
            Self::Activated => "activated",
        }
    }
}

/// Point-in-time view of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub phase: SchedulerPhase,
    /// Start of the last pass whose catalog fetch succeeded.
    pub last_download: Option<DateTime<Utc>>,
    pub next_download: DateTime<Utc>,
    pub update_interval_secs: u64,
    pub passes_completed: u64,
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every step ran; individual skill failures are listed in the report.
    Completed,
    /// The catalog fetch failed and the rest of the pass was skipped.
    CatalogFailed,
}

/// A skill operation that failed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillFailure {
    pub skill: String,
    pub error: String,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: Id,
    pub reason: TriggerReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: PassOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub locks_removed: usize,
    pub installed: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub loaded: Vec<String>,
    pub unloaded: Vec<String>,
    pub missing_priority: Vec<String>,
    pub failures: Vec<SkillFailure>,
    pub persisted: bool,
    pub manifest_uploaded: bool,
}

impl PassReport {
    pub fn new(reason: TriggerReason, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id: Id::new(),
            reason,
            started_at,
            finished_at: started_at,
            outcome: PassOutcome::Completed,
            error: None,
            locks_removed: 0,
            installed: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            loaded: Vec::new(),
            unloaded: Vec::new(),
            missing_priority: Vec::new(),
            failures: Vec::new(),
            persisted: false,
            manifest_uploaded: false,
        }
    }

    pub fn record_failure(&mut self, skill: &str, error: impl std::fmt::Display) {
        self.failures.push(SkillFailure {
            skill: skill.to_string(),
            error: error.to_string(),
        });
    }
}

// --- Manifest ---

/// One installed skill as reported in the device manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    /// `catalog` when the skill came from the remote catalog, `local` otherwise.
    pub origin: String,
    pub installation: String,
    pub status: String,
    pub beta: bool,
    /// Unix seconds of the last local modification (0 when unknown).
    pub updated: i64,
}

/// Skill inventory uploaded to the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillInventory {
    pub version: u32,
    pub blacklist: Vec<String>,
    pub skills: Vec<InventoryEntry>,
    /// SHA-256 over the sorted skill names.
    pub digest: String,
}

impl SkillInventory {
    pub const VERSION: u32 = 1;

    pub fn new(blacklist: Vec<String>, mut skills: Vec<InventoryEntry>) -> Self {
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        let mut hasher = Sha256::new();
        for entry in &skills {
            hasher.update(entry.name.as_bytes());
            hasher.update(b"\n");
        }
        Self {
            version: Self::VERSION,
            blacklist,
            skills,
            digest: format!("{:x}", hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> InventoryEntry {
        InventoryEntry {
            name: name.to_string(),
            origin: "catalog".to_string(),
            installation: "installed".to_string(),
            status: "active".to_string(),
            beta: false,
            updated: 0,
        }
    }

    #[test]
    fn scheduler_phase_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&SchedulerPhase::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(SchedulerPhase::Stopped.as_str(), "STOPPED");
    }

    #[test]
    fn inventory_digest_ignores_input_order() {
        let a = SkillInventory::new(vec![], vec![entry("b"), entry("a")]);
        let b = SkillInventory::new(vec![], vec![entry("a"), entry("b")]);
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.skills[0].name, "a");
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn inventory_digest_changes_with_content() {
        let a = SkillInventory::new(vec![], vec![entry("a")]);
        let b = SkillInventory::new(vec![], vec![entry("a"), entry("c")]);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn skill_record_omits_empty_optionals() {
        let record = SkillRecord::new("mycroft-volume", "/skills/mycroft-volume", true);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("url"));
        assert!(!json.contains("updated_at"));
    }

    #[test]
    fn pass_report_records_failures() {
        let mut report = PassReport::new(TriggerReason::Timer, Utc::now());
        report.record_failure("skill-a", "network down");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].skill, "skill-a");
        assert_eq!(report.outcome, PassOutcome::Completed);
    }
}
