//! Reconciliation scheduler.
//!
//! Timer ticks and bus commands feed one pending-trigger slot drained by a
//! single worker. Each pass runs on a blocking thread:
//!
//! 1. remove stale lock markers
//! 2. fetch the catalog (failure ends the pass)
//! 3. install and load priority skills
//! 4. update local skills (when `auto_update` is set)
//! 5. remove blacklisted skills that are neither priority nor pinned
//! 6. load the remaining local skills, unload the ones that disappeared
//! 7. persist the installed set
//! 8. post the manifest (when `upload_skill_manifest` is set)
//!
//! At most one pass is in flight; a trigger that arrives during a pass is
//! ignored. Taking the pending trigger and claiming the running flag happen
//! under one lock, so a trigger sees either a queued pass or a running one. `next_download` moves to `pass_start + update_interval` when a
//! pass ends, whatever its outcome.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use skill_core::config::Config;
use skill_core::messages::{PassFinishedPayload, PassStartedPayload, StatusEvent};
use skill_core::types::{
    PassOutcome, PassReport, SchedulerPhase, SchedulerSnapshot, SkillRecord, TriggerReason,
};
use skill_core::InstalledSetStore;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::PackageBackend;
use crate::bus::MessageBus;
use crate::config_source::ConfigSource;
use crate::locks::remove_stale_locks;
use crate::manifest::{Identity, ManifestOutcome, ManifestReporter};
use crate::priority::reconcile_priority;
use crate::registry::{skill_id, DirectoryLoader, LoadStatus};

/// How often the worker checks whether the timer is due.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler shutdown")]
    Shutdown,
    #[error("scheduler worker already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What happened to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A pass will start.
    Queued,
    /// A pass was already queued; this trigger merged into it.
    Coalesced,
    /// A pass is in flight; the trigger was ignored.
    AlreadyRunning,
    /// The scheduler is shut down.
    Declined,
}

impl TriggerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Coalesced => "coalesced",
            Self::AlreadyRunning => "already_running",
            Self::Declined => "declined",
        }
    }
}

/// Collaborators injected into the scheduler.
pub struct SchedulerDeps {
    pub backend: Arc<dyn PackageBackend>,
    pub config: Arc<dyn ConfigSource>,
    pub bus: Arc<MessageBus>,
    pub clock: Arc<dyn Clock>,
    pub identity: Arc<dyn Identity>,
    pub loader: Arc<DirectoryLoader>,
}

impl std::fmt::Debug for SchedulerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerDeps").finish_non_exhaustive()
    }
}

/// Holds the running flag for the duration of a pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct SchedulerState {
    last_download: Option<DateTime<Utc>>,
    next_download: DateTime<Utc>,
    update_interval_secs: u64,
    passes_completed: u64,
    /// Blacklist-filtered catalog from the last successful fetch.
    catalog: Vec<SkillRecord>,
    /// Installed set as last persisted (or loaded at startup).
    installed: Vec<String>,
    last_report: Option<PassReport>,
}

pub struct Scheduler {
    backend: Arc<dyn PackageBackend>,
    config: Arc<dyn ConfigSource>,
    bus: Arc<MessageBus>,
    clock: Arc<dyn Clock>,
    loader: Arc<DirectoryLoader>,
    manifest: ManifestReporter,
    state: Mutex<SchedulerState>,
    running: AtomicBool,
    worker_started: AtomicBool,
    cancel: CancellationToken,
    drained: CancellationToken,
    /// At most one queued trigger; later ones coalesce into it.
    pending: Mutex<Option<TriggerReason>>,
    wake: Notify,
    tick: Duration,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler. The first pass is due immediately.
    pub fn new(deps: SchedulerDeps) -> Self {
        let config = deps.config.current();
        let now = deps.clock.now();

        let store = InstalledSetStore::new(config.installed_skills_file());
        let mut installed: Vec<String> = match store.load() {
            Ok(set) => set.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "failed to load installed skills, starting empty");
                Vec::new()
            }
        };
        installed.sort();

        Self {
            backend: deps.backend,
            config: deps.config,
            bus: deps.bus,
            clock: deps.clock,
            loader: deps.loader,
            manifest: ManifestReporter::new(deps.identity),
            state: Mutex::new(SchedulerState {
                last_download: None,
                next_download: now - TimeDelta::seconds(1),
                update_interval_secs: config.update_interval_secs(),
                passes_completed: 0,
                catalog: Vec::new(),
                installed,
                last_report: None,
            }),
            running: AtomicBool::new(false),
            worker_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            drained: CancellationToken::new(),
            pending: Mutex::new(None),
            wake: Notify::new(),
            tick: DEFAULT_TICK,
        }
    }

    /// Override how often the worker checks the timer.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Option<TriggerReason>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn loader(&self) -> &Arc<DirectoryLoader> {
        &self.loader
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let phase = if self.is_running() {
            SchedulerPhase::Running
        } else if self.is_shutdown() {
            SchedulerPhase::Stopped
        } else {
            SchedulerPhase::Idle
        };
        let state = self.state();
        SchedulerSnapshot {
            phase,
            last_download: state.last_download,
            next_download: state.next_download,
            update_interval_secs: state.update_interval_secs,
            passes_completed: state.passes_completed,
        }
    }

    pub fn next_download(&self) -> DateTime<Utc> {
        self.state().next_download
    }

    /// Installed set as last persisted.
    pub fn installed(&self) -> Vec<String> {
        self.state().installed.clone()
    }

    /// Catalog as of the last successful fetch.
    pub fn catalog(&self) -> Vec<SkillRecord> {
        self.state().catalog.clone()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.state().last_report.clone()
    }

    /// Request a pass.
    pub fn trigger(&self, reason: TriggerReason) -> TriggerOutcome {
        if self.is_shutdown() {
            debug!(reason = reason.as_str(), "scheduler stopped, trigger declined");
            return TriggerOutcome::Declined;
        }

        let mut pending = self.pending();
        if self.is_running() {
            debug!(reason = reason.as_str(), "pass in flight, trigger ignored");
            return TriggerOutcome::AlreadyRunning;
        }
        if pending.is_some() {
            return TriggerOutcome::Coalesced;
        }
        *pending = Some(reason);
        drop(pending);

        self.wake.notify_one();
        TriggerOutcome::Queued
    }

    /// Worker loop. Returns once shutdown is requested and any in-flight pass
    /// has finished.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.worker_started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        info!(
            interval_secs = self.snapshot().update_interval_secs,
            "reconciliation scheduler started"
        );

        loop {
            let timer_due = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.wake.notified() => false,
                () = tokio::time::sleep(self.tick) => {
                    let due = self.clock.now() >= self.next_download();
                    if !due && self.pending().is_none() {
                        continue;
                    }
                    due
                }
            };

            let this = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || this.run_next(timer_due)).await {
                Ok(Some(report)) => {
                    debug!(pass_id = %report.pass_id, "pass finished");
                }
                Ok(None) => debug!("no pass to run"),
                Err(e) => error!(error = %e, "reconciliation pass panicked"),
            }
        }

        info!("reconciliation scheduler stopped");
        self.drained.cancel();
        Ok(())
    }

    /// Stop the timer, decline new triggers, and wait for an in-flight pass.
    pub async fn shutdown(&self) {
        info!("scheduler shutdown requested");
        self.cancel.cancel();
        if self.worker_started.load(Ordering::SeqCst) {
            self.drained.cancelled().await;
        }
    }

    /// Run one pass on the calling thread.
    ///
    /// Returns `None` without doing anything if another pass is in flight.
    pub fn run_pass(&self, reason: TriggerReason) -> Option<PassReport> {
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            debug!(reason = reason.as_str(), "pass already running");
            return None;
        };
        Some(self.execute(reason))
    }

    /// Take the pending trigger, or a timer trigger when due, and run it.
    ///
    /// A pending trigger is consumed only together with the running flag.
    fn run_next(&self, timer_due: bool) -> Option<PassReport> {
        let (reason, _guard) = {
            let mut pending = self.pending();
            let reason = match *pending {
                Some(reason) => reason,
                None if timer_due => TriggerReason::Timer,
                None => return None,
            };
            let Some(guard) = PassGuard::acquire(&self.running) else {
                debug!(reason = reason.as_str(), "pass already running");
                return None;
            };
            pending.take();
            (reason, guard)
        };
        Some(self.execute(reason))
    }

    fn execute(&self, reason: TriggerReason) -> PassReport {
        let config = self.config.current();
        let started = self.clock.now();
        let mut report = PassReport::new(reason, started);

        info!(pass_id = %report.pass_id, reason = reason.as_str(), "reconciliation pass started");
        self.bus.emit_status(
            StatusEvent::PassStarted,
            &PassStartedPayload {
                pass_id: report.pass_id.to_string(),
                reason: reason.as_str().to_string(),
            },
        );

        let catalog_ok = self.reconcile(&config, &mut report);
        report.finished_at = self.clock.now();

        {
            let mut state = self.state();
            if catalog_ok {
                state.last_download = Some(started);
            }
            state.update_interval_secs = config.update_interval_secs();
            state.next_download = advance(started, state.update_interval_secs);
            state.passes_completed += 1;
            state.last_report = Some(report.clone());
            info!(
                pass_id = %report.pass_id,
                outcome = ?report.outcome,
                installed = report.installed.len(),
                removed = report.removed.len(),
                loaded = report.loaded.len(),
                failures = report.failures.len(),
                next_download = %state.next_download,
                "reconciliation pass finished"
            );
        }

        let event = match report.outcome {
            PassOutcome::Completed => StatusEvent::PassCompleted,
            PassOutcome::CatalogFailed => StatusEvent::PassFailed,
        };
        self.bus.emit_status(
            event,
            &PassFinishedPayload {
                report: report.clone(),
            },
        );

        report
    }

    /// Pass body. Returns false if the catalog fetch failed.
    fn reconcile(&self, config: &Config, report: &mut PassReport) -> bool {
        let locks = remove_stale_locks(&config.skills_dir());
        report.locks_removed = locks.removed.len();
        if !locks.removed.is_empty() {
            self.bus.emit_status(
                StatusEvent::LocksRemoved,
                &skill_core::messages::LocksRemovedPayload {
                    paths: locks
                        .removed
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect(),
                },
            );
        }

        let all = match self.backend.list() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "catalog fetch failed, skipping pass");
                report.outcome = PassOutcome::CatalogFailed;
                report.error = Some(e.to_string());
                return false;
            }
        };

        let catalog: Vec<SkillRecord> = all
            .iter()
            .filter(|r| !config.is_blacklisted(&r.id))
            .cloned()
            .map(|mut r| {
                r.is_priority = config.is_priority(&r.id);
                r
            })
            .collect();

        // Priority skills.
        let mut loads = Vec::new();
        let priority = reconcile_priority(
            &config.priority_skills,
            &catalog,
            self.backend.as_ref(),
            &mut |path| loads.push((path.to_path_buf(), self.loader.load(path))),
        );
        report.installed = priority.installed().map(str::to_string).collect();
        report.missing_priority = priority.missing().map(str::to_string).collect();
        for (id, e) in priority.failures() {
            report.record_failure(id, e);
        }

        if config.auto_update {
            for record in catalog.iter().filter(|r| r.is_local) {
                match self.backend.update(&record.id) {
                    Ok(()) => report.updated.push(record.id.clone()),
                    Err(e) => {
                        warn!(skill = %record.id, error = %e, "skill update failed");
                        report.record_failure(&record.id, e);
                    }
                }
            }
        }

        let skills = self.loader.skills();
        for record in all.iter().filter(|r| {
            r.is_local
                && config.is_blacklisted(&r.id)
                && !config.is_priority(&r.id)
                && !skills.is_pinned(&r.id)
        }) {
            match self.backend.remove(&record.id) {
                Ok(()) => {
                    info!(skill = %record.id, "removed blacklisted skill");
                    report.removed.push(record.id.clone());
                }
                Err(e) => {
                    warn!(skill = %record.id, error = %e, "failed to remove blacklisted skill");
                    report.record_failure(&record.id, e);
                }
            }
        }

        for record in catalog.iter().filter(|r| r.is_local && !r.is_priority) {
            loads.push((record.path.clone(), self.loader.load(&record.path)));
        }
        for (path, status) in loads {
            let id = skill_id(&path).unwrap_or_else(|| path.display().to_string());
            match status {
                LoadStatus::Loaded | LoadStatus::Reloaded => report.loaded.push(id),
                LoadStatus::Failed(e) => report.record_failure(&id, e),
                LoadStatus::Unchanged | LoadStatus::Inactive | LoadStatus::NotASkill => {}
            }
        }

        report.unloaded = self.loader.unload_missing();
        if skills.mark_initialized() {
            info!("initial skill load complete");
            self.bus
                .emit_status(StatusEvent::SkillsInitialized, &serde_json::json!({}));
        }

        let installed = installed_ids(&config.priority_skills, &all);
        match InstalledSetStore::new(config.installed_skills_file()).save(&installed) {
            Ok(()) => {
                report.persisted = true;
                self.state().installed = installed;
            }
            Err(e) => error!(error = %e, "failed to persist installed skills"),
        }

        if config.upload_skill_manifest {
            report.manifest_uploaded =
                self.manifest.post_manifest(self.backend.as_ref()) == ManifestOutcome::Uploaded;
        }

        self.state().catalog = catalog;
        true
    }
}

/// Ids whose directory exists: priority ids in configuration order, then
/// the rest sorted.
fn installed_ids(priority: &[String], records: &[SkillRecord]) -> Vec<String> {
    let on_disk = |path: &Path| path.is_dir();
    let mut seen = HashSet::new();
    let mut ids = Vec::new();

    for id in priority {
        if let Some(record) = records.iter().find(|r| &r.id == id) {
            if on_disk(&record.path) && seen.insert(id.as_str()) {
                ids.push(id.clone());
            }
        }
    }

    let mut rest: Vec<&str> = records
        .iter()
        .filter(|r| on_disk(&r.path) && !seen.contains(r.id.as_str()))
        .map(|r| r.id.as_str())
        .collect();
    rest.sort_unstable();
    rest.dedup();
    ids.extend(rest.into_iter().map(str::to_string));
    ids
}

fn advance(start: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
