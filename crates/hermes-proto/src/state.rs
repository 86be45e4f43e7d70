//! Persisted preferences and playback state.
//!
//! The engine never touches the filesystem directly: it gets a
//! `KeyValueStore` injected.  `JsonFileStore` is what the daemon uses,
//! `MemoryStore` is what tests use.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::protocol::Station;

// ── keys ──────────────────────────────────────────────────────────────────────

pub const LAST_STATION_KEY: &str = "last_station";
pub const VOLUME_KEY: &str = "volume";
pub const RESUME_ON_LAUNCH_KEY: &str = "resume_on_launch";
pub const PLAY_AUTOMATICALLY_ON_LAUNCH: &str = "play_automatically_on_launch";
pub const PAUSE_ON_SCREENSAVER_START: &str = "pause_on_screensaver_start";
pub const PLAY_ON_SCREENSAVER_STOP: &str = "play_on_screensaver_stop";
pub const PAUSE_ON_SCREEN_LOCK: &str = "pause_on_screen_lock";
pub const PLAY_ON_SCREEN_UNLOCK: &str = "play_on_screen_unlock";

pub const DEFAULT_VOLUME: u8 = 50;

// ── store ─────────────────────────────────────────────────────────────────────

/// Format-agnostic key/value persistence.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    fn remove(&mut self, key: &str);
    /// Make everything written so far durable.
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// Typed helpers over any store.
pub trait KeyValueStoreExt: KeyValueStore {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    fn put<T: Serialize>(&mut self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(key, v),
            Err(e) => tracing::warn!("store: cannot serialise {}: {}", key, e),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_as(key).unwrap_or(default)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// In-memory store; `flush` is a no-op.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Map<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A single JSON object on disk, rewritten on every flush.
pub struct JsonFileStore {
    path: PathBuf,
    values: Map<String, Value>,
    dirty: bool,
}

impl JsonFileStore {
    /// Open the store.  A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = Self::load(&path);
        Self {
            path,
            values,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Map<String, Value> {
        if let Ok(content) = std::fs::read_to_string(path) {
            match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => return map,
                Ok(_) => tracing::warn!("store: {} is not a JSON object", path.display()),
                Err(e) => tracing::warn!("store: failed to parse {}: {}", path.display(), e),
            }
        }
        Map::new()
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, json)?;
        self.dirty = false;
        Ok(())
    }
}

// ── typed view ────────────────────────────────────────────────────────────────

/// Everything the engine reads once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentState {
    pub last_station: Option<Station>,
    pub volume: u8,
    pub resume_on_launch: bool,
    pub play_automatically_on_launch: bool,
}

impl PersistentState {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self {
            last_station: store.get_as(LAST_STATION_KEY),
            volume: store
                .get_as::<u8>(VOLUME_KEY)
                .unwrap_or(DEFAULT_VOLUME)
                .min(100),
            resume_on_launch: store.bool_or(RESUME_ON_LAUNCH_KEY, false),
            play_automatically_on_launch: store.bool_or(PLAY_AUTOMATICALLY_ON_LAUNCH, false),
        }
    }

    /// Whether `prepare_first` should start the remembered station.
    pub fn should_resume(&self) -> bool {
        self.last_station.is_some() && (self.resume_on_launch || self.play_automatically_on_launch)
    }
}

/// Interruption preferences, read at the moment an interruption happens so
/// changes made by a settings UI take effect without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptionPrefs {
    pub pause_on_screensaver_start: bool,
    pub play_on_screensaver_stop: bool,
    pub pause_on_screen_lock: bool,
    pub play_on_screen_unlock: bool,
}

impl InterruptionPrefs {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self {
            pause_on_screensaver_start: store.bool_or(PAUSE_ON_SCREENSAVER_START, true),
            play_on_screensaver_stop: store.bool_or(PLAY_ON_SCREENSAVER_STOP, true),
            pause_on_screen_lock: store.bool_or(PAUSE_ON_SCREEN_LOCK, true),
            play_on_screen_unlock: store.bool_or(PLAY_ON_SCREEN_UNLOCK, true),
        }
    }
}
