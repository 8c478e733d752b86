//! Persisted subset of store state and the storage it is written to.
//!
//! Only the session list, the current selection, per-session model choices and
//! the context-usage cache survive a restart. Map-valued fields are written as
//! arrays of `[key, value]` entries.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chat_protocol::Session;
use serde::{Deserialize, Serialize};

use crate::context_usage::ContextUsageSnapshot;
use crate::error::PersistenceError;
use crate::model::ModelSelection;

pub const PERSISTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub sessions: Vec<Session>,
    pub current_session_id: Option<String>,
    pub model_selections: HashMap<String, ModelSelection>,
    pub context_usage: HashMap<String, ContextUsageSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    version: u32,
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    current_session_id: Option<String>,
    #[serde(default)]
    model_selections: Vec<(String, ModelSelection)>,
    #[serde(default)]
    context_usage: Vec<(String, ContextUsageSnapshot)>,
}

pub fn encode(state: &PersistedState) -> Result<String, PersistenceError> {
    let record = PersistedRecord {
        version: PERSISTED_VERSION,
        sessions: state.sessions.clone(),
        current_session_id: state.current_session_id.clone(),
        model_selections: sorted_entries(&state.model_selections),
        context_usage: sorted_entries(&state.context_usage),
    };
    serde_json::to_string(&record).map_err(PersistenceError::Encode)
}

pub fn decode(raw: &str) -> Result<PersistedState, PersistenceError> {
    let record: PersistedRecord = serde_json::from_str(raw).map_err(PersistenceError::Decode)?;
    if record.version != PERSISTED_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found: record.version,
            expected: PERSISTED_VERSION,
        });
    }

    Ok(PersistedState {
        sessions: record.sessions,
        current_session_id: record.current_session_id,
        model_selections: record.model_selections.into_iter().collect(),
        context_usage: record.context_usage.into_iter().collect(),
    })
}

fn sorted_entries<V: Clone>(map: &HashMap<String, V>) -> Vec<(String, V)> {
    let mut entries: Vec<(String, V)> = map
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    entries.sort_by(|left, right| left.0.cmp(&right.0));
    entries
}

/// Key-value storage for serialized state.
pub trait StateStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(lock_unpoisoned(&self.values).get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        lock_unpoisoned(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        lock_unpoisoned(&self.values).remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StateStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::io("reading state file", path, source)),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir)
            .map_err(|source| PersistenceError::io("creating state directory", &self.dir, source))?;

        let path = self.path_for(key);
        let staging = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&staging, value)
            .map_err(|source| PersistenceError::io("writing state file", &staging, source))?;
        fs::rename(&staging, &path)
            .map_err(|source| PersistenceError::io("replacing state file", &path, source))
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::io("removing state file", path, source)),
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
