//! Loaded-skill registry and the default load callback.
//!
//! Loading is bookkeeping plus bus events: the registry records which skill
//! directories are live and when they last changed, and the processes that
//! execute skills react to `mycroft.skills.loaded` and
//! `mycroft.skills.shutdown`. Deactivate, activate and keep are in-memory
//! overlays and reset on restart.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use skill_core::messages::{SkillLoadedPayload, SkillPathPayload, StatusEvent};
use tracing::{debug, info, warn};

use crate::bus::MessageBus;

/// A directory is a skill if it contains one of these.
pub const ENTRY_FILES: [&str; 2] = ["__init__.py", "SKILL.md"];

/// Files whose changes never trigger a reload.
const IGNORED_FILES: [&str; 1] = ["settings.json"];
const IGNORED_EXTENSIONS: [&str; 2] = ["pyc", "qmlc"];

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loaded,
    Reloaded,
    Unchanged,
    /// Deactivated; not loaded.
    Inactive,
    /// No entry file; the directory is skipped.
    NotASkill,
    Failed(String),
}

/// Whether a converse request can be routed to a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverseStatus {
    Ready,
    NotLoaded,
    Unknown,
}

/// Registry view of one skill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillState {
    pub id: String,
    pub path: PathBuf,
    pub active: bool,
    pub loaded: bool,
    pub pinned: bool,
    /// Unix seconds of the newest tracked file when last loaded.
    pub modified: f64,
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    loaded: bool,
    modified: f64,
}

#[derive(Debug, Default)]
struct RegistryState {
    skills: BTreeMap<String, Entry>,
    deactivated: HashSet<String>,
    pinned: HashSet<String>,
    initialized: bool,
}

#[derive(Debug, Default)]
pub struct LoadedSkills {
    state: Mutex<RegistryState>,
}

impl LoadedSkills {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self, id: &str) -> bool {
        !self.lock().deactivated.contains(id)
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.lock().skills.get(id).is_some_and(|e| e.loaded)
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.lock().pinned.contains(id)
    }

    /// Pin a skill against blacklist removal. Returns false if already pinned.
    pub fn pin(&self, id: &str) -> bool {
        self.lock().pinned.insert(id.to_string())
    }

    /// Mark a skill inactive. Returns its path if it was loaded.
    pub fn deactivate(&self, id: &str) -> Option<PathBuf> {
        let mut state = self.lock();
        state.deactivated.insert(id.to_string());
        match state.skills.get_mut(id) {
            Some(entry) if entry.loaded => {
                entry.loaded = false;
                Some(entry.path.clone())
            }
            _ => None,
        }
    }

    /// Mark every loaded skill unloaded, returning them in id order.
    fn unload_all(&self) -> Vec<(String, PathBuf)> {
        let mut state = self.lock();
        state
            .skills
            .iter_mut()
            .filter(|(_, entry)| entry.loaded)
            .map(|(id, entry)| {
                entry.loaded = false;
                (id.clone(), entry.path.clone())
            })
            .collect()
    }

    /// Clear the inactive mark. Returns false if the skill was not deactivated.
    pub fn activate(&self, id: &str) -> bool {
        self.lock().deactivated.remove(id)
    }

    /// Clear every inactive mark, returning the reactivated ids.
    pub fn activate_all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().deactivated.drain().collect();
        ids.sort();
        ids
    }

    pub fn converse_status(&self, id: &str) -> ConverseStatus {
        let state = self.lock();
        match state.skills.get(id) {
            None => ConverseStatus::Unknown,
            Some(entry) if entry.loaded && !state.deactivated.contains(id) => {
                ConverseStatus::Ready
            }
            Some(_) => ConverseStatus::NotLoaded,
        }
    }

    /// Returns true the first time it is called.
    pub fn mark_initialized(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.initialized, true)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Known skills plus overlay-only ids, sorted by id.
    pub fn snapshot(&self) -> Vec<SkillState> {
        let state = self.lock();
        let mut views: BTreeMap<&str, SkillState> = state
            .skills
            .iter()
            .map(|(id, entry)| {
                (
                    id.as_str(),
                    SkillState {
                        id: id.clone(),
                        path: entry.path.clone(),
                        active: !state.deactivated.contains(id),
                        loaded: entry.loaded,
                        pinned: state.pinned.contains(id),
                        modified: entry.modified,
                    },
                )
            })
            .collect();

        for id in state.deactivated.iter().chain(state.pinned.iter()) {
            views.entry(id.as_str()).or_insert_with(|| SkillState {
                id: id.clone(),
                path: PathBuf::new(),
                active: !state.deactivated.contains(id),
                loaded: false,
                pinned: state.pinned.contains(id),
                modified: 0.0,
            });
        }

        views.into_values().collect()
    }
}

/// Default load callback: validates skill directories and tracks them in
/// [`LoadedSkills`], announcing changes on the bus.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    skills: Arc<LoadedSkills>,
    bus: Arc<MessageBus>,
}

impl DirectoryLoader {
    pub fn new(skills: Arc<LoadedSkills>, bus: Arc<MessageBus>) -> Self {
        Self { skills, bus }
    }

    pub fn skills(&self) -> &Arc<LoadedSkills> {
        &self.skills
    }

    /// Load or reload the skill at `path`.
    ///
    /// Loaded skills whose tracked files have not changed are left alone.
    pub fn load(&self, path: &Path) -> LoadStatus {
        let Some(id) = skill_id(path) else {
            return LoadStatus::Failed(format!("invalid skill path: {}", path.display()));
        };

        if !path.is_dir() || !has_entry_file(path) {
            debug!(skill = %id, path = %path.display(), "no skill entry file, skipping");
            return LoadStatus::NotASkill;
        }
        let modified = last_modified(path);

        let status = {
            let mut state = self.skills.lock();
            if state.deactivated.contains(&id) {
                return LoadStatus::Inactive;
            }

            let status = match state.skills.get(&id).map(|e| (e.loaded, e.modified)) {
                Some((true, prev)) if modified <= prev => return LoadStatus::Unchanged,
                Some((true, _)) => LoadStatus::Reloaded,
                _ => LoadStatus::Loaded,
            };

            state.skills.insert(
                id.clone(),
                Entry {
                    path: path.to_path_buf(),
                    loaded: true,
                    modified,
                },
            );
            status
        };

        let path_str = path.display().to_string();
        match &status {
            LoadStatus::Failed(reason) => {
                warn!(skill = %id, path = %path.display(), reason = %reason, "skill failed to load");
                self.bus.emit_status(
                    StatusEvent::SkillLoadingFailure,
                    &SkillPathPayload { path: path_str, id },
                );
            }
            LoadStatus::Reloaded | LoadStatus::Loaded => {
                if status == LoadStatus::Reloaded {
                    debug!(skill = %id, "skill changed, reloading");
                    self.bus.emit_status(
                        StatusEvent::SkillShutdown,
                        &SkillPathPayload {
                            path: path_str.clone(),
                            id: id.clone(),
                        },
                    );
                }
                info!(skill = %id, "skill loaded");
                self.bus.emit_status(
                    StatusEvent::SkillLoaded,
                    &SkillLoadedPayload {
                        path: path_str,
                        id,
                        modified,
                    },
                );
            }
            LoadStatus::Unchanged | LoadStatus::Inactive | LoadStatus::NotASkill => {}
        }

        status
    }

    /// Forget skills whose directory is gone, shutting down the loaded ones.
    ///
    /// Returns the ids that were loaded.
    pub fn unload_missing(&self) -> Vec<String> {
        let removed: Vec<(String, Entry)> = {
            let mut state = self.skills.lock();
            let gone: Vec<String> = state
                .skills
                .iter()
                .filter(|(_, entry)| !entry.path.is_dir())
                .map(|(id, _)| id.clone())
                .collect();
            gone.into_iter()
                .filter_map(|id| state.skills.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let mut unloaded = Vec::new();
        for (id, entry) in removed {
            if !entry.loaded {
                continue;
            }
            info!(skill = %id, "skill directory removed, shutting down");
            self.bus.emit_status(
                StatusEvent::SkillShutdown,
                &SkillPathPayload {
                    path: entry.path.display().to_string(),
                    id: id.clone(),
                },
            );
            unloaded.push(id);
        }
        unloaded
    }

    /// Shut down every loaded skill. Returns the ids that were loaded.
    pub fn unload_all(&self) -> Vec<String> {
        let unloaded = self.skills.unload_all();
        for (id, path) in &unloaded {
            debug!(skill = %id, "shutting down skill");
            self.bus.emit_status(
                StatusEvent::SkillShutdown,
                &SkillPathPayload {
                    path: path.display().to_string(),
                    id: id.clone(),
                },
            );
        }
        if !unloaded.is_empty() {
            info!(count = unloaded.len(), "all skills shut down");
        }
        unloaded.into_iter().map(|(id, _)| id).collect()
    }

    /// Deactivate a skill, shutting it down if it was loaded.
    pub fn deactivate(&self, id: &str) -> bool {
        match self.skills.deactivate(id) {
            Some(path) => {
                info!(skill = %id, "skill deactivated");
                self.bus.emit_status(
                    StatusEvent::SkillShutdown,
                    &SkillPathPayload {
                        path: path.display().to_string(),
                        id: id.to_string(),
                    },
                );
                true
            }
            None => {
                debug!(skill = %id, "skill marked inactive before load");
                false
            }
        }
    }
}

/// Skill identifier from its install path (the directory name).
pub fn skill_id(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn has_entry_file(path: &Path) -> bool {
    ENTRY_FILES.iter().any(|name| path.join(name).is_file())
}

fn is_tracked(name: &str) -> bool {
    if name.starts_with('.') || IGNORED_FILES.contains(&name) {
        return false;
    }
    !Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IGNORED_EXTENSIONS.contains(&ext))
}

/// Newest modification time, in unix seconds, of the tracked files under `root`.
///
/// Hidden entries and compiled or settings files are skipped.
pub fn last_modified(root: &Path) -> f64 {
    let mut newest = 0.0_f64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_tracked(name) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
                continue;
            }
            let secs = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            newest = newest.max(secs);
        }
    }

    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use skill_core::Message;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn setup() -> (DirectoryLoader, broadcast::Receiver<Message>, TempDir) {
        let bus = Arc::new(MessageBus::default());
        let rx = bus.subscribe();
        let loader = DirectoryLoader::new(Arc::new(LoadedSkills::new()), bus);
        (loader, rx, TempDir::new().unwrap())
    }

    fn make_skill(root: &Path, id: &str) -> PathBuf {
        let path = root.join(id);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("__init__.py"), "def create_skill(): pass\n").unwrap();
        path
    }

    fn drain(rx: &mut broadcast::Receiver<Message>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            types.push(msg.msg_type);
        }
        types
    }

    fn touch(path: &Path, secs_ahead: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs_ahead))
            .unwrap();
    }

    #[test]
    fn load_emits_loaded_once_until_changed() {
        let (loader, mut rx, dir) = setup();
        let path = make_skill(dir.path(), "skill-joke");

        assert_eq!(loader.load(&path), LoadStatus::Loaded);
        assert_eq!(loader.load(&path), LoadStatus::Unchanged);
        assert_eq!(drain(&mut rx), vec!["mycroft.skills.loaded"]);
        assert!(loader.skills().is_loaded("skill-joke"));

        touch(&path.join("__init__.py"), 60);
        assert_eq!(loader.load(&path), LoadStatus::Reloaded);
        assert_eq!(
            drain(&mut rx),
            vec!["mycroft.skills.shutdown", "mycroft.skills.loaded"]
        );
    }

    #[test]
    fn ignored_files_do_not_trigger_reload() {
        let (loader, _rx, dir) = setup();
        let path = make_skill(dir.path(), "skill-joke");
        loader.load(&path);

        fs::write(path.join("settings.json"), "{}").unwrap();
        fs::write(path.join("__init__.pyc"), "").unwrap();
        touch(&path.join("settings.json"), 60);
        touch(&path.join("__init__.pyc"), 60);

        assert_eq!(loader.load(&path), LoadStatus::Unchanged);
    }

    #[test]
    fn skill_md_is_an_entry_file() {
        let (loader, _rx, dir) = setup();
        let path = dir.path().join("docs-skill");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("SKILL.md"), "# skill").unwrap();

        assert_eq!(loader.load(&path), LoadStatus::Loaded);
    }

    #[test]
    fn directory_without_entry_file_is_skipped_quietly() {
        let (loader, mut rx, dir) = setup();
        let path = dir.path().join("not-a-skill");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("README.md"), "notes").unwrap();

        assert_eq!(loader.load(&path), LoadStatus::NotASkill);
        assert_eq!(loader.load(&path), LoadStatus::NotASkill);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            loader.skills().converse_status("not-a-skill"),
            ConverseStatus::Unknown
        );
    }

    #[test]
    fn deactivated_skill_is_not_loaded_until_activated() {
        let (loader, mut rx, dir) = setup();
        let path = make_skill(dir.path(), "skill-joke");
        loader.load(&path);
        drain(&mut rx);

        assert!(loader.deactivate("skill-joke"));
        assert_eq!(drain(&mut rx), vec!["mycroft.skills.shutdown"]);
        assert_eq!(loader.load(&path), LoadStatus::Inactive);
        assert_eq!(
            loader.skills().converse_status("skill-joke"),
            ConverseStatus::NotLoaded
        );

        assert!(loader.skills().activate("skill-joke"));
        assert_eq!(loader.load(&path), LoadStatus::Loaded);
        assert_eq!(
            loader.skills().converse_status("skill-joke"),
            ConverseStatus::Ready
        );
    }

    #[test]
    fn deactivate_before_load_blocks_first_load() {
        let (loader, mut rx, dir) = setup();
        let path = make_skill(dir.path(), "skill-joke");

        assert!(!loader.deactivate("skill-joke"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(loader.load(&path), LoadStatus::Inactive);

        assert_eq!(loader.skills().activate_all(), vec!["skill-joke"]);
        assert_eq!(loader.load(&path), LoadStatus::Loaded);
    }

    #[test]
    fn unload_missing_shuts_down_removed_skills() {
        let (loader, mut rx, dir) = setup();
        let keep = make_skill(dir.path(), "skill-keep");
        let gone = make_skill(dir.path(), "skill-gone");
        loader.load(&keep);
        loader.load(&gone);
        drain(&mut rx);

        fs::remove_dir_all(&gone).unwrap();
        assert_eq!(loader.unload_missing(), vec!["skill-gone"]);
        assert_eq!(drain(&mut rx), vec!["mycroft.skills.shutdown"]);
        assert_eq!(
            loader.skills().converse_status("skill-gone"),
            ConverseStatus::Unknown
        );
        assert!(loader.skills().is_loaded("skill-keep"));
    }

    #[test]
    fn unload_all_shuts_down_only_loaded_skills() {
        let (loader, mut rx, dir) = setup();
        loader.load(&make_skill(dir.path(), "skill-b"));
        loader.load(&make_skill(dir.path(), "skill-a"));
        loader.load(&make_skill(dir.path(), "skill-off"));
        loader.deactivate("skill-off");
        drain(&mut rx);

        assert_eq!(loader.unload_all(), vec!["skill-a", "skill-b"]);
        assert_eq!(
            drain(&mut rx),
            vec!["mycroft.skills.shutdown", "mycroft.skills.shutdown"]
        );
        assert!(!loader.skills().is_loaded("skill-a"));
        assert!(!loader.skills().is_loaded("skill-b"));

        assert!(loader.unload_all().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn snapshot_includes_overlay_only_ids() {
        let (loader, _rx, dir) = setup();
        loader.load(&make_skill(dir.path(), "b-skill"));
        loader.skills().pin("a-skill");
        loader.deactivate("c-skill");

        let snapshot = loader.skills().snapshot();
        let ids: Vec<_> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a-skill", "b-skill", "c-skill"]);
        assert!(snapshot[0].pinned);
        assert!(snapshot[1].loaded);
        assert!(!snapshot[2].active);
    }

    #[test]
    fn mark_initialized_is_true_once() {
        let skills = LoadedSkills::new();
        assert!(skills.mark_initialized());
        assert!(!skills.mark_initialized());
        assert!(skills.is_initialized());
    }

    #[test]
    fn last_modified_skips_hidden_entries() {
        let dir = TempDir::new().unwrap();
        let path = make_skill(dir.path(), "skill");
        let base = last_modified(&path);
        assert!(base > 0.0);

        fs::create_dir_all(path.join(".git")).unwrap();
        fs::write(path.join(".git/HEAD"), "ref").unwrap();
        touch(&path.join(".git/HEAD"), 3600);
        assert!((last_modified(&path) - base).abs() < f64::EPSILON);

        fs::create_dir_all(path.join("locale")).unwrap();
        fs::write(path.join("locale/en.dialog"), "hi").unwrap();
        touch(&path.join("locale/en.dialog"), 3600);
        assert!(last_modified(&path) > base);
    }
}
