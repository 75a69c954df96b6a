//! Mission file load/save with schema validation and locked updates.
//!
//! The mission file is the single source of truth for task progress. Every
//! update takes the mission lock, reloads the file, applies the change, and
//! renames a temp file into place.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, instrument};

use crate::core::types::{Task, TaskStatus};
use crate::error::OverseerError;
use crate::io::config::parse_document;
use crate::io::fs_util::write_atomic;
use crate::io::lock::{FileLock, LockOptions};

const MISSION_SCHEMA: &str = include_str!("../../schemas/mission.schema.json");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub project_root: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Parsed mission document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub project: ProjectInfo,
    pub mission: MissionMeta,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reviewer_mode: bool,
    /// Default persona name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critic: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Mission {
    /// Project root, resolved against the mission file's directory.
    pub fn project_root(&self, mission_path: &Path) -> PathBuf {
        let root = Path::new(&self.project.project_root);
        if root.is_absolute() {
            return root.to_path_buf();
        }
        mission_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(root)
    }

    /// Role overrides (`brain`, `critic`, `body`) as one settings overlay.
    pub fn settings_overrides(&self) -> Option<Value> {
        let mut overlay = serde_yaml::Mapping::new();
        for (key, value) in [
            ("brain", &self.brain),
            ("critic", &self.critic),
            ("body", &self.body),
        ] {
            if let Some(value) = value {
                overlay.insert(Value::String(key.to_string()), value.clone());
            }
        }
        (!overlay.is_empty()).then_some(Value::Mapping(overlay))
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Mission-wide context handed to the planner.
    pub fn context_summary(&self) -> String {
        let mut out = format!("Mission: {}", self.mission.name);
        if !self.project.name.is_empty() {
            out.push_str(&format!("\nProject: {}", self.project.name));
        }
        out.push_str("\nTasks:");
        for task in &self.tasks {
            out.push_str(&format!("\n- [{}] {}: {}", task.status, task.id, task.title.trim()));
        }
        out
    }

    /// Check invariants the schema cannot express.
    pub fn validate(&self, mission_path: &Path) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(config_error("task id must not be empty"));
            }
            if task.title.trim().is_empty() {
                return Err(config_error(&format!("task {} has an empty title", task.id)));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(config_error(&format!("duplicate task id '{}'", task.id)));
            }
        }
        let root = self.project_root(mission_path);
        if !root.is_dir() {
            return Err(config_error(&format!(
                "project.project_root does not exist: {}",
                root.display()
            )));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> anyhow::Error {
    OverseerError::Configuration(message.to_string()).into()
}

/// Parse mission text, validating the schema and invariants.
pub fn parse_mission(path: &Path, contents: &str) -> Result<Mission> {
    let mut value = parse_document(path, contents)?;
    validate_schema(&value)?;
    normalize_task_ids(&mut value);
    let mission: Mission = serde_yaml::from_value(value)
        .map_err(|err| config_error(&format!("mission {}: {err}", path.display())))?;
    mission.validate(path)?;
    Ok(mission)
}

fn validate_schema(document: &Value) -> Result<()> {
    let instance = serde_json::to_value(document)
        .map_err(|err| config_error(&format!("mission is not representable as JSON: {err}")))?;
    let schema: serde_json::Value =
        serde_json::from_str(MISSION_SCHEMA).context("parse mission schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile mission schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(config_error(&format!(
            "mission schema validation failed:\n- {}",
            messages.join("\n- ")
        )));
    }
    Ok(())
}

/// Integer ids are accepted and stored as strings.
fn normalize_task_ids(document: &mut Value) {
    let Some(tasks) = document.get_mut("tasks").and_then(Value::as_sequence_mut) else {
        return;
    };
    for task in tasks {
        let numeric = match task.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if let Some(map) = task.as_mapping_mut() {
            map.insert(Value::String("id".to_string()), Value::String(numeric));
        }
    }
}

fn render_mission(path: &Path, mission: &Mission) -> Result<String> {
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        return toml::to_string_pretty(mission).context("serialize mission as toml");
    }
    serde_yaml::to_string(mission).context("serialize mission as yaml")
}

/// Locked access to one mission file.
#[derive(Debug, Clone)]
pub struct MissionStore {
    path: PathBuf,
    lock: LockOptions,
}

impl MissionStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockOptions) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the mission without taking the lock.
    pub fn load(&self) -> Result<Mission> {
        let contents = fs::read_to_string(&self.path).map_err(|err| {
            config_error(&format!("read mission {}: {err}", self.path.display()))
        })?;
        parse_mission(&self.path, &contents)
    }

    /// Run `f` while holding the mission lock.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = FileLock::acquire(&self.path, &self.lock)?;
        f()
    }

    /// Reload under the lock, apply `f`, stamp `updated_at`, and write atomically.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn update<T>(&self, f: impl FnOnce(&mut Mission) -> Result<T>) -> Result<T> {
        self.with_lock(|| {
            let mut mission = self.load()?;
            let out = f(&mut mission)?;
            mission.mission.updated_at = Some(Utc::now().to_rfc3339());
            let rendered = render_mission(&self.path, &mission)?;
            write_atomic(&self.path, &rendered)?;
            debug!("mission written");
            Ok(out)
        })
    }

    /// Apply `f` to one task, rejecting invalid status transitions.
    pub fn update_task(&self, task_id: &str, f: impl FnOnce(&mut Task)) -> Result<Task> {
        self.update(|mission| {
            let task = mission
                .task_mut(task_id)
                .ok_or_else(|| anyhow!("unknown task id '{task_id}'"))?;
            let before = task.status;
            f(task);
            if !before.can_transition_to(task.status) {
                return Err(anyhow!(
                    "invalid status transition for task {task_id}: {before} -> {}",
                    task.status
                ));
            }
            Ok(task.clone())
        })
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<Task> {
        self.update_task(task_id, |task| task.status = status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSION: &str = "\
project:
  name: demo
  project_root: .
mission:
  name: ship it
  created_at: '2025-01-01T00:00:00Z'
parallel: false
constraints:
  - keep the public api
tasks:
  - id: t1
    title: Create hello.txt
    priority: high
  - id: 2
    task: List files
    status: done
custom_key: kept
";

    fn write_mission(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("mission.yaml");
        fs::write(&path, contents).expect("write mission");
        path
    }

    #[test]
    fn loads_aliases_and_integer_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_mission(temp.path(), MISSION);
        let mission = MissionStore::new(&path, LockOptions::default())
            .load()
            .expect("load");
        assert_eq!(mission.tasks.len(), 2);
        assert_eq!(mission.tasks[1].id, "2");
        assert_eq!(mission.tasks[1].title, "List files");
        assert_eq!(mission.tasks[1].status, TaskStatus::Done);
        assert_eq!(mission.constraints, vec!["keep the public api"]);
        assert_eq!(mission.project_root(&path), temp.path().join("."));
    }

    #[test]
    fn schema_errors_are_configuration_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_mission(
            temp.path(),
            "project: {project_root: .}\nmission: {name: m}\ntasks:\n  - id: a\n    title: x\n    status: finished\n",
        );
        let err = MissionStore::new(&path, LockOptions::default())
            .load()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OverseerError>(),
            Some(OverseerError::Configuration(_))
        ));
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn duplicate_ids_and_missing_root_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_mission(
            temp.path(),
            "project: {project_root: .}\nmission: {name: m}\ntasks:\n  - {id: a, title: x}\n  - {id: a, title: y}\n",
        );
        let err = MissionStore::new(&path, LockOptions::default())
            .load()
            .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate task id"));

        let path = write_mission(
            temp.path(),
            "project: {project_root: ./nope}\nmission: {name: m}\ntasks: []\n",
        );
        let err = MissionStore::new(&path, LockOptions::default())
            .load()
            .unwrap_err();
        assert!(format!("{err:#}").contains("does not exist"));
    }

    /// Verifies updates keep unknown keys and stamp `updated_at`.
    #[test]
    fn update_preserves_unknown_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_mission(temp.path(), MISSION);
        let store = MissionStore::new(&path, LockOptions::default());

        let task = store
            .update_task("t1", |task| {
                task.status = TaskStatus::InProgress;
                task.notes = "started".to_string();
            })
            .expect("update");
        assert_eq!(task.status, TaskStatus::InProgress);

        let reloaded = store.load().expect("reload");
        assert_eq!(reloaded.tasks[0].notes, "started");
        assert_eq!(
            reloaded.tasks[0].extra.get("priority"),
            Some(&Value::String("high".to_string()))
        );
        assert_eq!(
            reloaded.extra.get("custom_key"),
            Some(&Value::String("kept".to_string()))
        );
        assert!(reloaded.mission.updated_at.is_some());
        assert!(!crate::io::lock::lock_path_for(&path).exists());
    }

    #[test]
    fn invalid_transition_is_rejected_and_not_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_mission(temp.path(), MISSION);
        let store = MissionStore::new(&path, LockOptions::default());

        let err = store.set_status("2", TaskStatus::Todo).unwrap_err();
        assert!(format!("{err:#}").contains("invalid status transition"));
        assert_eq!(store.load().expect("load").tasks[1].status, TaskStatus::Done);
    }

    #[test]
    fn toml_missions_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mission.toml");
        fs::write(
            &path,
            "[project]\nproject_root = \".\"\n\n[mission]\nname = \"m\"\n\n[[tasks]]\nid = \"a\"\ntitle = \"Write notes.md\"\n",
        )
        .expect("write");
        let store = MissionStore::new(&path, LockOptions::default());
        store.set_status("a", TaskStatus::InProgress).expect("update");
        let mission = store.load().expect("load");
        assert_eq!(mission.tasks[0].status, TaskStatus::InProgress);
    }

    #[test]
    fn overrides_collect_role_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_mission(
            temp.path(),
            "project: {project_root: .}\nmission: {name: m}\nbrain: {timeout: 5}\ntasks: []\n",
        );
        let mission = MissionStore::new(&path, LockOptions::default())
            .load()
            .expect("load");
        let overlay = mission.settings_overrides().expect("overlay");
        assert_eq!(overlay["brain"]["timeout"], Value::from(5));
        assert!(overlay.get("body").is_none());
    }
}
