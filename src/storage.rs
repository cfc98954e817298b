use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const APP_DIR: &str = "rescue-console";
pub const SCHEMA_VERSION: u32 = 1;

pub const KEY_FEEDS: &str = "feeds";
pub const KEY_CAMERA_CONFIG: &str = "camera-config";
pub const KEY_GALLERY: &str = "gallery";
pub const KEY_CONTACTS: &str = "emergency-contacts";
pub const KEY_SETTINGS: &str = "settings";
pub const KEY_THEME: &str = "theme";

/// String-keyed persistence port. Values are opaque JSON payloads; the typed
/// helpers below wrap them in a versioned envelope.
///
/// There is no locking across processes: two consoles sharing a data
/// directory overwrite each other and the last write wins.
pub trait Store: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, payload: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub type SharedStore = Arc<dyn Store>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: u64,
    data: T,
}

pub fn save<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let envelope = Envelope {
        version: SCHEMA_VERSION,
        saved_at: now_unix(),
        data: value,
    };
    let payload = serde_json::to_string_pretty(&envelope)
        .with_context(|| format!("failed serializing '{key}'"))?;
    store.write(key, &payload)?;
    debug!(key, bytes = payload.len(), "persisted store entry");
    Ok(())
}

/// Reads the raw JSON value stored under `key`, unwrapped from its envelope.
/// Bare values written without an envelope are accepted as-is.
pub fn load_value(store: &dyn Store, key: &str) -> Result<Option<Value>> {
    let Some(raw) = store.read(key)? else {
        return Ok(None);
    };
    let parsed = serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("failed parsing store entry '{key}'"))?;
    unwrap_envelope(key, parsed).map(Some)
}

pub fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    let Some(value) = load_value(store, key)? else {
        return Ok(None);
    };
    let parsed = serde_json::from_value::<T>(value)
        .with_context(|| format!("store entry '{key}' has an unexpected shape"))?;
    Ok(Some(parsed))
}

/// Like [`load`], but storage and parse failures are logged and replaced by
/// the type's default.
pub fn load_or_default<T: DeserializeOwned + Default>(store: &dyn Store, key: &str) -> T {
    match load::<T>(store, key) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(err) => {
            warn!(key, "failed to load store entry, using defaults: {err:#}");
            T::default()
        }
    }
}

fn unwrap_envelope(key: &str, value: Value) -> Result<Value> {
    match value {
        Value::Object(mut map) if map.contains_key("version") && map.contains_key("data") => {
            let version = map
                .get("version")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("store entry '{key}' has a non-numeric version"))?;
            if version > u64::from(SCHEMA_VERSION) {
                return Err(anyhow!(
                    "store entry '{key}' uses schema version {version}, newer than supported {SCHEMA_VERSION}"
                ));
            }
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

/// One JSON file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(data_root()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(anyhow!("invalid store key '{key}'"));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl Store for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed reading store entry at {}", path.display()))?;
        Ok(Some(raw))
    }

    fn write(&self, key: &str, payload: &str) -> Result<()> {
        let path = self.key_path(key)?;
        ensure_parent_dir(&path)?;

        // Rename over the target so readers never observe a half-written file.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("failed writing store entry at {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed replacing store entry at {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed removing store entry at {}", path.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, payload: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_owned(), payload.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[must_use]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating directory {}", parent.display()))?;
    }
    Ok(())
}

pub fn data_root() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("unable to determine user data directory")?;
    Ok(base.join(APP_DIR))
}

#[cfg(test)]
mod tests {
    use super::{
        FileStore, MemoryStore, SCHEMA_VERSION, Store, load, load_or_default, load_value, save,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn saved_values_load_back_through_the_envelope() {
        let store = MemoryStore::new();
        let sample = Sample {
            name: "thermal".to_owned(),
            count: 3,
        };
        save(&store, "sample", &sample).unwrap();

        let raw = store.read("sample").unwrap().unwrap();
        assert!(raw.contains("\"version\""));
        assert_eq!(load::<Sample>(&store, "sample").unwrap(), Some(sample));
    }

    #[test]
    fn bare_values_without_envelope_are_accepted() {
        let store = MemoryStore::new();
        store
            .write("sample", r#"{"name":"lidar","count":7}"#)
            .unwrap();
        let loaded = load::<Sample>(&store, "sample").unwrap().unwrap();
        assert_eq!(loaded.name, "lidar");
        assert_eq!(loaded.count, 7);
    }

    #[test]
    fn newer_schema_versions_fall_back_to_defaults() {
        let store = MemoryStore::new();
        let payload = format!(
            r#"{{"version":{},"saved_at":0,"data":{{"name":"x","count":1}}}}"#,
            SCHEMA_VERSION + 1
        );
        store.write("sample", &payload).unwrap();
        assert!(load_value(&store, "sample").is_err());
        assert_eq!(load_or_default::<Sample>(&store, "sample"), Sample::default());
    }

    #[test]
    fn garbage_payloads_fall_back_to_defaults() {
        let store = MemoryStore::new();
        store.write("sample", "{not json").unwrap();
        assert_eq!(load_or_default::<Sample>(&store, "sample"), Sample::default());
    }

    #[test]
    fn missing_keys_load_as_none() {
        let store = MemoryStore::new();
        assert_eq!(load::<Sample>(&store, "absent").unwrap(), None);
    }

    #[test]
    fn file_store_round_trips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        assert_eq!(store.read("feeds").unwrap(), None);
        store.write("feeds", "[1,2,3]").unwrap();
        assert_eq!(store.read("feeds").unwrap().as_deref(), Some("[1,2,3]"));
        store.write("feeds", "[4]").unwrap();
        assert_eq!(store.read("feeds").unwrap().as_deref(), Some("[4]"));

        store.remove("feeds").unwrap();
        assert_eq!(store.read("feeds").unwrap(), None);
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.write("../escape", "x").is_err());
        assert!(store.read("").is_err());
    }
}
