//! Per-project persistent state: named JSON namespaces written atomically
//! and only when dirty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::{BuildGraphError, Result};

struct StateNamespace {
    name: String,
    path: PathBuf,
    data: serde_json::Map<String, JsonValue>,
    dirty: bool,
}

impl StateNamespace {
    fn load(name: &str, location: &Path) -> Result<Self> {
        let path = location.join(format!("{name}.json"));
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            serde_json::Map::new()
        };
        Ok(Self {
            name: name.to_string(),
            path,
            data,
            dirty: false,
        })
    }

    fn set(&mut self, key: &str, value: JsonValue) {
        if self.data.get(key) != Some(&value) {
            self.dirty = true;
        }
        self.data.insert(key.to_string(), value);
    }

    /// Write out to disk if any value changed. The write is atomic: a
    /// temporary file is renamed over the namespace file.
    fn store(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        debug!(namespace = %self.name, path = %self.path.display(), "saving state");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staged = self.path.with_extension("json.tmp");
        std::fs::write(&staged, serde_json::to_vec_pretty(&self.data)?)?;
        std::fs::rename(&staged, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

/// Manages the state tracking directory for a project.
pub struct State {
    location: PathBuf,
    files: Mutex<HashMap<String, StateNamespace>>,
}

impl State {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Set a value in a named namespace. Values must be JSON primitives so
    /// they can be serialized.
    pub fn set(&self, namespace: &str, key: &str, value: impl Into<JsonValue>) -> Result<()> {
        let value = value.into();
        if !matches!(
            value,
            JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Bool(_)
        ) {
            return Err(BuildGraphError::State(format!(
                "value of type {value:?} is not supported"
            )));
        }
        let mut files = self.files.lock();
        let ns = self.namespace(&mut files, namespace)?;
        ns.set(key, value);
        Ok(())
    }

    /// Get a value from a named namespace, or None if never set.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<JsonValue>> {
        let mut files = self.files.lock();
        let ns = self.namespace(&mut files, namespace)?;
        Ok(ns.data.get(key).cloned())
    }

    /// Write every dirty namespace to disk.
    pub fn save_all(&self) -> Result<()> {
        std::fs::create_dir_all(&self.location)?;
        for ns in self.files.lock().values_mut() {
            ns.store()?;
        }
        Ok(())
    }

    fn namespace<'a>(
        &self,
        files: &'a mut HashMap<String, StateNamespace>,
        name: &str,
    ) -> Result<&'a mut StateNamespace> {
        if !files.contains_key(name) {
            let ns = StateNamespace::load(name, &self.location)?;
            files.insert(name.to_string(), ns);
        }
        Ok(files.get_mut(name).expect("namespace inserted above"))
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Err(error) = self.save_all() {
            warn!(%error, "failed to save state on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = State::new(dir.path());
            state.set("tools", "verilator", "5.016").unwrap();
            state.set("tools", "count", 3).unwrap();
            state.save_all().unwrap();
        }
        let state = State::new(dir.path());
        assert_eq!(
            state.get("tools", "verilator").unwrap(),
            Some(JsonValue::from("5.016"))
        );
        assert_eq!(state.get("tools", "count").unwrap(), Some(JsonValue::from(3)));
        assert_eq!(state.get("tools", "missing").unwrap(), None);
    }

    #[test]
    fn clean_namespaces_are_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(dir.path());
        state.set("ns", "k", "v").unwrap();
        state.save_all().unwrap();
        let path = dir.path().join("ns.json");
        let stamp = std::fs::metadata(&path).unwrap().modified().unwrap();

        // Re-setting the same value leaves the namespace clean.
        state.set("ns", "k", "v").unwrap();
        state.save_all().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), stamp);
    }

    #[test]
    fn non_primitive_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(dir.path());
        assert!(state
            .set("ns", "k", serde_json::json!({"nested": true}))
            .is_err());
    }
}
