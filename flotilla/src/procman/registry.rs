//! Procman registry (C6): the persistent worker table plus query
//! operators over its runtime view.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use flotilla_core::error::{FlotillaError, ReplyStatus};

/// Schema version of a persisted [`WorkerDescriptor`] record. Bumped
/// whenever the on-disk shape changes; [`migrate`] upgrades older records.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A persistent worker descriptor: what procman knows about a worker
/// independent of whether it is currently running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub schema_version: u32,
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    /// `require` edges: strong dependencies that must reach `online`.
    pub requires: Vec<String>,
    /// `after` edges: weak dependencies that only need to have started.
    pub after: Vec<String>,
    pub tag: Option<String>,
    pub disabled: bool,
    pub heartbeat_disabled: bool,
    pub debug: bool,
    pub pause_on_start: bool,
    pub memory_ceiling_bytes: Option<u64>,
}

/// Runtime state layered over a descriptor, reset whenever procman
/// restarts (not persisted).
#[derive(Debug, Clone, Default)]
pub struct WorkerRuntimeState {
    pub pid: Option<u32>,
    pub running: bool,
    /// Connected *and* passing heartbeats, per the broker's worker table.
    pub online: bool,
    pub respawn_delay: std::time::Duration,
    pub started_at: Option<std::time::Instant>,
    pub crash_count_in_window: u32,
    pub failed: bool,
}

struct Entry {
    descriptor: WorkerDescriptor,
    runtime: WorkerRuntimeState,
}

/// The persistent + runtime worker table.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, descriptor: WorkerDescriptor) {
        self.entries
            .entry(descriptor.name.clone())
            .and_modify(|e| e.descriptor = descriptor.clone())
            .or_insert_with(|| Entry {
                descriptor,
                runtime: WorkerRuntimeState::default(),
            });
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    #[must_use]
    pub fn runtime(&self, name: &str) -> Option<&WorkerRuntimeState> {
        self.entries.get(name).map(|e| &e.runtime)
    }

    pub fn runtime_mut(&mut self, name: &str) -> Option<&mut WorkerRuntimeState> {
        self.entries.get_mut(name).map(|e| &mut e.runtime)
    }

    /// `withRunning`: fails `NOSUCH` if the worker is unknown, disabled, or
    /// not running.
    pub fn with_running<R>(
        &self,
        name: &str,
        f: impl FnOnce(&WorkerDescriptor, &WorkerRuntimeState) -> R,
    ) -> Result<R, FlotillaError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| FlotillaError::reply(ReplyStatus::NoSuch, format!("no such worker {name:?}")))?;
        if entry.descriptor.disabled || !entry.runtime.running {
            return Err(FlotillaError::reply(
                ReplyStatus::NoSuch,
                format!("worker {name:?} is not running"),
            ));
        }
        Ok(f(&entry.descriptor, &entry.runtime))
    }

    /// `withAlive`: additionally fails `RECOVERING` if connected but
    /// heartbeat-dead.
    pub fn with_alive<R>(
        &self,
        name: &str,
        f: impl FnOnce(&WorkerDescriptor, &WorkerRuntimeState) -> R,
    ) -> Result<R, FlotillaError> {
        self.with_running(name, |d, r| (d.clone(), r.clone())).and_then(|(d, r)| {
            if !r.online {
                return Err(FlotillaError::reply(
                    ReplyStatus::Recovering,
                    format!("worker {name:?} connection is re-establishing"),
                ));
            }
            Ok(f(&d, &r))
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// `findWorkers`: filter by the predicate fields the query supports.
    #[must_use]
    pub fn find_workers(&self, query: &WorkerQuery) -> Vec<WorkerSnapshot> {
        self.entries
            .values()
            .filter(|e| query.matches(&e.descriptor, &e.runtime))
            .map(|e| WorkerSnapshot {
                descriptor: e.descriptor.clone(),
                runtime: e.runtime.clone(),
            })
            .collect()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.entries.values().map(|e| e.descriptor.clone()).collect()
    }

    /// Load the persistent table from `path`, migrating each record to
    /// [`CURRENT_SCHEMA_VERSION`]. A missing or unreadable file yields an
    /// empty registry, matching the "absent -> nothing registered yet"
    /// bootstrap case (spec §4.6: "a descriptor is... loaded from
    /// persistence at startup").
    #[must_use]
    pub fn load(path: &std::path::Path) -> Self {
        let Ok(raw) = std::fs::read(path) else {
            return Self::new();
        };
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) else {
            return Self::new();
        };
        let Some(entries) = value.as_array() else {
            return Self::new();
        };

        let mut registry = Self::new();
        for entry in entries.iter().cloned() {
            let migrated = migrate(entry);
            if let Ok(descriptor) = serde_json::from_value::<WorkerDescriptor>(migrated) {
                registry.upsert(descriptor);
            }
        }
        registry
    }

    /// Persist the table to `path` atomically (write-to-temp, rename),
    /// per spec §5's "authoritative persistent table... is written
    /// atomically".
    ///
    /// # Errors
    ///
    /// Returns any I/O error encountered writing the temp file or renaming
    /// it into place.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::io::Write;

        let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(parent)?;
        let body = serde_json::to_vec_pretty(&self.descriptors()).unwrap_or_default();
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&body)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// `findWorkers(where, includeUsage, includeStats)` filter predicate.
#[derive(Debug, Clone, Default)]
pub struct WorkerQuery {
    pub name: Option<String>,
    pub running: Option<bool>,
    pub online: Option<bool>,
    pub pid: Option<u32>,
    pub debug: Option<bool>,
    pub tag: Option<String>,
    pub include_usage: bool,
    pub include_stats: bool,
}

impl WorkerQuery {
    fn matches(&self, d: &WorkerDescriptor, r: &WorkerRuntimeState) -> bool {
        self.name.as_deref().map_or(true, |n| n == d.name)
            && self.running.map_or(true, |v| v == r.running)
            && self.online.map_or(true, |v| v == r.online)
            && self.pid.map_or(true, |v| Some(v) == r.pid)
            && self.debug.map_or(true, |v| v == d.debug)
            && self.tag.as_deref().map_or(true, |t| d.tag.as_deref() == Some(t))
    }
}

/// Result row of `findWorkers`: persistent descriptor joined with runtime
/// fields. CPU/RSS usage and broker-counter stats are joined by the
/// caller (procman's supervisor / the broker's self-API) since they
/// require querying the OS or the broker, not the registry itself.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub descriptor: WorkerDescriptor,
    pub runtime: WorkerRuntimeState,
}

/// Migrate an older persisted schema version up to
/// [`CURRENT_SCHEMA_VERSION`] via a sequence of pure upgrade functions.
#[must_use]
pub fn migrate(mut value: serde_json::Value) -> serde_json::Value {
    loop {
        let version = value.get("schema_version").and_then(serde_json::Value::as_u64).unwrap_or(0);
        if version >= u64::from(CURRENT_SCHEMA_VERSION) {
            return value;
        }
        value = migrate_step(version, value);
    }
}

fn migrate_step(from_version: u64, mut value: serde_json::Value) -> serde_json::Value {
    match from_version {
        0 => {
            // Version 0 predates `memory_ceiling_bytes`; default to
            // unbounded.
            if let Some(obj) = value.as_object_mut() {
                obj.entry("memory_ceiling_bytes").or_insert(serde_json::Value::Null);
                obj.insert("schema_version".into(), serde_json::json!(1));
            }
            value
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> WorkerDescriptor {
        WorkerDescriptor {
            schema_version: CURRENT_SCHEMA_VERSION,
            name: name.to_string(),
            path: "/bin/true".into(),
            args: vec![],
            requires: vec![],
            after: vec![],
            tag: None,
            disabled: false,
            heartbeat_disabled: false,
            debug: false,
            pause_on_start: false,
            memory_ceiling_bytes: None,
        }
    }

    #[test]
    fn with_running_fails_nosuch_when_unknown() {
        let reg = Registry::new();
        let err = reg.with_running("echo", |_, _| ()).unwrap_err();
        assert_eq!(err.reply_status(), Some(ReplyStatus::NoSuch));
    }

    #[test]
    fn with_alive_fails_recovering_when_running_but_offline() {
        let mut reg = Registry::new();
        reg.upsert(descriptor("echo"));
        reg.runtime_mut("echo").unwrap().running = true;
        reg.runtime_mut("echo").unwrap().online = false;
        let err = reg.with_alive("echo", |_, _| ()).unwrap_err();
        assert_eq!(err.reply_status(), Some(ReplyStatus::Recovering));
    }

    #[test]
    fn find_workers_filters_by_name() {
        let mut reg = Registry::new();
        reg.upsert(descriptor("echo"));
        reg.upsert(descriptor("other"));
        let q = WorkerQuery {
            name: Some("echo".into()),
            ..Default::default()
        };
        let rows = reg.find_workers(&q);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].descriptor.name, "echo");
    }

    #[test]
    fn save_then_load_round_trips_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        let mut reg = Registry::new();
        reg.upsert(descriptor("echo"));
        reg.save(&path).unwrap();

        let loaded = Registry::load(&path);
        assert_eq!(loaded.find("echo").unwrap().name, "echo");
    }

    #[test]
    fn load_missing_file_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(Registry::load(&path).names().is_empty());
    }

    #[test]
    fn migrate_v0_adds_memory_ceiling() {
        let v0 = serde_json::json!({
            "schema_version": 0,
            "name": "echo",
            "path": "/bin/true",
            "args": [],
            "requires": [],
            "after": [],
            "tag": null,
            "disabled": false,
            "heartbeat_disabled": false,
            "debug": false,
            "pause_on_start": false,
        });
        let migrated = migrate(v0);
        assert_eq!(migrated["schema_version"], serde_json::json!(1));
        assert_eq!(migrated["memory_ceiling_bytes"], serde_json::Value::Null);
    }
}
