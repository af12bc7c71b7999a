//! Priority skill reconciliation.
//!
//! Every configured priority skill must be installed and loaded. Each skill is
//! handled on its own; a failure is recorded and the loop moves on.

use std::path::Path;

use serde::Serialize;
use skill_core::types::SkillRecord;
use tracing::{error, info, warn};

use crate::backend::PackageBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum PriorityOutcome {
    /// Already on disk; load requested.
    AlreadyLocal,
    /// Installed during this pass; load requested.
    Installed,
    /// Install failed; not loaded.
    InstallFailed(String),
    /// No catalog entry with this identifier; not loaded.
    NotInCatalog,
}

impl PriorityOutcome {
    pub fn is_loadable(&self) -> bool {
        matches!(self, Self::AlreadyLocal | Self::Installed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityItem {
    pub id: String,
    #[serde(flatten)]
    pub outcome: PriorityOutcome,
}

/// Result per priority identifier, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PriorityReport {
    pub items: Vec<PriorityItem>,
}

impl PriorityReport {
    pub fn installed(&self) -> impl Iterator<Item = &str> {
        self.ids_where(|o| matches!(o, PriorityOutcome::Installed))
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.ids_where(|o| !o.is_loadable())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            PriorityOutcome::InstallFailed(e) => Some((item.id.as_str(), e.as_str())),
            _ => None,
        })
    }

    fn ids_where(&self, f: impl Fn(&PriorityOutcome) -> bool) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(move |item| f(&item.outcome))
            .map(|item| item.id.as_str())
    }
}

/// Install and load every priority skill, one at a time in configuration order.
///
/// Lookup in `catalog` is an exact, case-sensitive match on the identifier.
/// `load` is called with the install path of each skill that is local after
/// this step; it is never called for a skill whose install failed.
pub fn reconcile_priority(
    priority_ids: &[String],
    catalog: &[SkillRecord],
    backend: &dyn PackageBackend,
    load: &mut dyn FnMut(&Path),
) -> PriorityReport {
    let mut report = PriorityReport::default();

    for id in priority_ids {
        let Some(record) = catalog.iter().find(|r| &r.id == id) else {
            warn!(skill = %id, "priority skill not in catalog");
            report.items.push(PriorityItem {
                id: id.clone(),
                outcome: PriorityOutcome::NotInCatalog,
            });
            continue;
        };

        let outcome = if record.is_local {
            PriorityOutcome::AlreadyLocal
        } else {
            info!(skill = %id, "installing priority skill");
            match backend.install(id) {
                Ok(()) => PriorityOutcome::Installed,
                Err(e) => {
                    error!(skill = %id, error = %e, "priority skill install failed");
                    PriorityOutcome::InstallFailed(e.to_string())
                }
            }
        };

        if outcome.is_loadable() {
            load(&record.path);
        }
        report.items.push(PriorityItem {
            id: id.clone(),
            outcome,
        });
    }

    report
}
