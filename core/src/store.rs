//! Durable key/value store for long-lived process state.
//!
//! Values are a closed set of kinds and every key has a declared kind:
//! [`MODEL_KEY`] holds the model, [`SETTINGS_KEY`] the settings, any other key
//! holds text. A write of the wrong kind is rejected. The model kind is
//! protected: it is first-write-wins through [`Store::set`] and only changes
//! through [`Store::replace`]. Settings and text are freely mutable.
//!
//! Every writer goes through one checked path under the write half of the
//! entry map; readers clone an `Arc` under the read half and release it.
//! `save` is serialized by its own mutex so two snapshots never interleave.

use crate::engine::RankingEngine;
use crate::error::{SearchError, SearchResult};
use crate::persist::{self, Snapshot};
use crate::settings::Settings;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MODEL_KEY: &str = "model";
pub const SETTINGS_KEY: &str = "settings";

/// Engine shared between the store, the dispatcher and its workers.
pub type SharedEngine = Arc<RwLock<RankingEngine>>;

#[derive(Debug, Serialize, Deserialize)]
pub enum StoreValue {
    Model(SharedEngine),
    Settings(Settings),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Model,
    Settings,
    Text,
}

impl ValueKind {
    /// Keys declared with a protected kind cannot be overwritten through `set`.
    pub const fn is_protected(self) -> bool {
        matches!(self, Self::Model)
    }

    /// The kind `key` is declared to hold.
    pub fn declared_for(key: &str) -> Self {
        match key {
            MODEL_KEY => Self::Model,
            SETTINGS_KEY => Self::Settings,
            _ => Self::Text,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Refuses to overwrite a protected key.
    Set,
    /// Overwrites regardless of protection.
    Replace,
}

impl StoreValue {
    pub fn model(engine: RankingEngine) -> Self {
        Self::Model(Arc::new(RwLock::new(engine)))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Model(_) => ValueKind::Model,
            Self::Settings(_) => ValueKind::Settings,
            Self::Text(_) => ValueKind::Text,
        }
    }
}

pub struct Store {
    path: PathBuf,
    entries: RwLock<HashMap<String, Arc<StoreValue>>>,
    save_lock: Mutex<()>,
    closed: bool,
}

impl Store {
    /// Opens the snapshot at `path`. A missing or unreadable snapshot yields a
    /// default store that is written out immediately.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (entries, fresh) = match persist::load_snapshot(&path) {
            Ok(Some(snapshot)) => {
                tracing::info!(path = %path.display(), keys = snapshot.entries.len(), saved_at = %snapshot.saved_at, "store loaded");
                let entries = snapshot
                    .entries
                    .into_iter()
                    .filter(|(key, value)| {
                        let fits = value.kind() == ValueKind::declared_for(key);
                        if !fits {
                            tracing::warn!(key = %key, kind = ?value.kind(), "dropping snapshot entry of the wrong kind");
                        }
                        fits
                    })
                    .collect();
                (entries, false)
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), "no store snapshot found, starting from defaults");
                (HashMap::new(), true)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "store snapshot unreadable, starting from defaults");
                match persist::quarantine(&path) {
                    Ok(moved) => tracing::warn!(moved = %moved.display(), "corrupt snapshot preserved"),
                    Err(e) => tracing::error!(error = %e, "could not move corrupt snapshot aside"),
                }
                (HashMap::new(), true)
            }
        };

        let store = Self { path, entries: RwLock::new(entries), save_lock: Mutex::new(()), closed: false };
        store.ensure_settings();
        if fresh {
            if let Err(e) = store.save() {
                tracing::error!(error = %e, "failed to persist default store");
            }
        }
        store
    }

    fn ensure_settings(&self) {
        let mut entries = self.entries.write();
        let settings = match entries.get(SETTINGS_KEY).map(|v| v.as_ref()) {
            Some(StoreValue::Settings(s)) => {
                let mut s = s.clone();
                s.fill_defaults();
                s
            }
            _ => Settings::default(),
        };
        // the settings kind is never protected and always matches its key
        let _ = Self::write_entry(&mut entries, SETTINGS_KEY, StoreValue::Settings(settings), WriteMode::Replace);
    }

    /// The single write path: checks the declared kind of `key`, then its protection.
    fn write_entry(
        entries: &mut HashMap<String, Arc<StoreValue>>,
        key: &str,
        value: StoreValue,
        mode: WriteMode,
    ) -> SearchResult<Option<Arc<StoreValue>>> {
        let declared = ValueKind::declared_for(key);
        if value.kind() != declared {
            tracing::warn!(key, declared = ?declared, got = ?value.kind(), "refusing store write of the wrong kind");
            return Err(SearchError::invalid(format!("key {key} holds {declared:?} values, not {:?}", value.kind())));
        }
        if mode == WriteMode::Set && declared.is_protected() && entries.contains_key(key) {
            tracing::warn!(key, "refusing to overwrite protected store key");
            return Err(SearchError::KeyProtected { key: key.to_string() });
        }
        Ok(entries.insert(key.to_string(), Arc::new(value)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Arc<StoreValue>> {
        self.entries.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// First write wins for protected keys. Fails with `InvalidInput` when the
    /// value does not match the key's declared kind.
    pub fn set(&self, key: &str, value: StoreValue) -> SearchResult<()> {
        Self::write_entry(&mut self.entries.write(), key, value, WriteMode::Set).map(|_| ())
    }

    /// Explicit wholesale replacement, allowed for every kind. The value must
    /// still match the key's declared kind.
    pub fn replace(&self, key: &str, value: StoreValue) -> SearchResult<Option<Arc<StoreValue>>> {
        let previous = Self::write_entry(&mut self.entries.write(), key, value, WriteMode::Replace)?;
        tracing::info!(key, replaced = previous.is_some(), "store value replaced");
        Ok(previous)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<StoreValue>> {
        let removed = self.entries.write().remove(key);
        if removed.is_none() {
            tracing::info!(key, "remove of absent store key ignored");
        }
        removed
    }

    /// Drops every key and restores default settings.
    pub fn wipe(&self) {
        self.entries.write().clear();
        self.ensure_settings();
        tracing::warn!(path = %self.path.display(), "store wiped");
    }

    pub fn engine(&self) -> Option<SharedEngine> {
        match self.get(MODEL_KEY).as_deref() {
            Some(StoreValue::Model(engine)) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    /// Installs `engine` as the model through the replace path.
    pub fn install_engine(&self, engine: RankingEngine) -> SearchResult<SharedEngine> {
        let shared: SharedEngine = Arc::new(RwLock::new(engine));
        self.replace(MODEL_KEY, StoreValue::Model(Arc::clone(&shared)))?;
        Ok(shared)
    }

    pub fn settings(&self) -> Settings {
        match self.get(SETTINGS_KEY).as_deref() {
            Some(StoreValue::Settings(s)) => s.clone(),
            _ => Settings::default(),
        }
    }

    /// Validated settings update; a rejected value leaves the stored settings untouched.
    pub fn update_setting(&self, name: &str, raw: &str) -> SearchResult<()> {
        let mut entries = self.entries.write();
        let mut settings = match entries.get(SETTINGS_KEY).map(|v| v.as_ref()) {
            Some(StoreValue::Settings(s)) => s.clone(),
            _ => Settings::default(),
        };
        settings.set(name, raw)?;
        Self::write_entry(&mut entries, SETTINGS_KEY, StoreValue::Settings(settings), WriteMode::Replace)?;
        tracing::info!(name, value = raw, "setting updated");
        Ok(())
    }

    /// Serializes every key to disk, overwriting the previous snapshot.
    pub fn save(&self) -> SearchResult<()> {
        let _guard = self.save_lock.lock();
        let entries: BTreeMap<String, Arc<StoreValue>> =
            self.entries.read().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
        let keys = entries.len();
        persist::save_snapshot(&self.path, &Snapshot::new(entries))?;
        tracing::info!(path = %self.path.display(), keys, "store saved");
        Ok(())
    }

    /// Final save for an owner that is done with the store. Unlike the save on
    /// drop, the error reaches the caller.
    pub fn close(mut self) -> SearchResult<()> {
        self.closed = true;
        self.save()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.save() {
            tracing::error!(path = %self.path.display(), error = %e, "final store save failed");
        }
    }
}

/// Lazily loaded store owned by the process entry point. Every `load` after the
/// first returns the same handle.
pub struct StoreCell {
    path: PathBuf,
    cell: OnceCell<Arc<Store>>,
}

impl StoreCell {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cell: OnceCell::new() }
    }

    pub fn load(&self) -> Arc<Store> {
        Arc::clone(self.cell.get_or_init(|| Arc::new(Store::load(&self.path))))
    }

    pub fn get(&self) -> Option<Arc<Store>> {
        self.cell.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn engine() -> RankingEngine {
        RankingEngine::new(vec![
            Document::new("/a", "Cats", "cats are great pets"),
            Document::new("/b", "Dogs", "dogs are loyal pets"),
        ])
        .unwrap()
    }

    #[test]
    fn fresh_store_persists_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let store = Store::load(&path);
        assert!(path.exists());
        assert!(store.has(SETTINGS_KEY));
        assert!(!store.has(MODEL_KEY));
        assert_eq!(store.settings(), Settings::default());
    }

    #[test]
    fn round_trips_every_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        {
            let store = Store::load(&path);
            store.set("motd", StoreValue::Text("hello".into())).unwrap();
            store.update_setting("port", "8080").unwrap();
            let shared = store.install_engine(engine()).unwrap();
            shared.write().absorb_feedback("pets", "/b", true).unwrap();
            store.save().unwrap();
        }

        let store = Store::load(&path);
        assert!(matches!(store.get("motd").as_deref(), Some(StoreValue::Text(t)) if t == "hello"));
        assert_eq!(store.settings().port().unwrap(), 8080);
        let shared = store.engine().unwrap();
        let engine = shared.read();
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.ledger().len(), 1);
        assert_eq!(engine.rank("cats", None).unwrap()[0].url, "/a");
    }

    #[test]
    fn model_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("cache.bin"));
        store.set(MODEL_KEY, StoreValue::model(engine())).unwrap();
        let err = store.set(MODEL_KEY, StoreValue::model(RankingEngine::default())).unwrap_err();
        assert_eq!(err, SearchError::KeyProtected { key: MODEL_KEY.into() });
        assert_eq!(store.engine().unwrap().read().len(), 2);

        store.replace(MODEL_KEY, StoreValue::model(RankingEngine::default())).unwrap();
        assert_eq!(store.engine().unwrap().read().len(), 0);
    }

    #[test]
    fn values_must_match_the_declared_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("cache.bin"));
        store.update_setting("port", "9000").unwrap();

        let err = store.set(SETTINGS_KEY, StoreValue::model(RankingEngine::default())).unwrap_err();
        assert!(matches!(err, SearchError::InvalidInput(_)));
        assert!(store.replace(SETTINGS_KEY, StoreValue::Text("x".into())).is_err());
        assert_eq!(store.settings().port().unwrap(), 9000);
        store.update_setting("port", "9001").unwrap();

        assert!(matches!(store.set(MODEL_KEY, StoreValue::Text("x".into())), Err(SearchError::InvalidInput(_))));
        assert!(store.engine().is_none());
        assert!(store.set("motd", StoreValue::model(engine())).is_err());
        assert!(!store.has("motd"));

        // the model key is protected by its declared kind, even before it holds a value
        store.set(MODEL_KEY, StoreValue::model(engine())).unwrap();
        assert!(matches!(store.set(MODEL_KEY, StoreValue::model(engine())), Err(SearchError::KeyProtected { .. })));
    }

    #[test]
    fn close_saves_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let store = Store::load(&path);
        store.set("motd", StoreValue::Text("closing".into())).unwrap();
        store.close().unwrap();
        assert!(Store::load(&path).has("motd"));
    }

    #[test]
    fn settings_and_text_are_mutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("cache.bin"));
        store.set("motd", StoreValue::Text("one".into())).unwrap();
        store.set("motd", StoreValue::Text("two".into())).unwrap();
        store.set(SETTINGS_KEY, StoreValue::Settings(Settings::default())).unwrap();
        assert!(matches!(store.get("motd").as_deref(), Some(StoreValue::Text(t)) if t == "two"));
    }

    #[test]
    fn rejected_setting_keeps_old_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("cache.bin"));
        store.update_setting("port", "9000").unwrap();
        assert!(store.update_setting("port", "abc").is_err());
        assert_eq!(store.settings().get("port").unwrap().raw_value(), "9000");
    }

    #[test]
    fn removing_absent_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("cache.bin"));
        assert!(store.remove("nothing-here").is_none());
        assert!(store.has(SETTINGS_KEY));
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"\x01\x02garbage").unwrap();
        let store = Store::load(&path);
        assert_eq!(store.settings(), Settings::default());
        assert!(dir.path().join("cache.bin.corrupt").exists());
        assert!(path.exists());
    }

    #[test]
    fn wipe_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("cache.bin"));
        store.install_engine(engine()).unwrap();
        store.update_setting("ssl", "true").unwrap();
        store.wipe();
        assert!(store.engine().is_none());
        assert!(!store.settings().ssl());
    }

    #[test]
    fn drop_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        {
            let store = Store::load(&path);
            store.set("motd", StoreValue::Text("bye".into())).unwrap();
        }
        assert!(Store::load(&path).has("motd"));
    }

    #[test]
    fn cell_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let cell = StoreCell::new(dir.path().join("cache.bin"));
        assert!(cell.get().is_none());
        let a = cell.load();
        let b = cell.load();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
