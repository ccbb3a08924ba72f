//! Storage of per-fan calibration data and quantization tables.
//!
//! The controller only sees the [`Persistence`] trait. The daemon stores
//! everything in one JSON document written atomically; tests use the
//! in-memory store.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};

/// Duty cycle to measured RPM.
pub type PwmData = BTreeMap<u8, f64>;

/// Requested duty cycle to the duty cycle the hardware reports back.
pub type PwmTable = BTreeMap<u8, u8>;

/// Per-fan storage keyed by fan id.
///
/// Loads return `Ok(None)` when nothing is stored for the fan.
#[cfg_attr(test, mockall::automock)]
pub trait Persistence: Send + Sync {
    fn load_fan_pwm_data(&self, fan_id: &str) -> Result<Option<PwmData>>;

    fn save_fan_pwm_data(&self, fan_id: &str, data: &PwmData) -> Result<()>;

    fn delete_fan_pwm_data(&self, fan_id: &str) -> Result<()>;

    fn load_fan_pwm_map(&self, fan_id: &str) -> Result<Option<PwmTable>>;

    fn save_fan_pwm_map(&self, fan_id: &str, map: &PwmTable) -> Result<()>;

    fn delete_fan_pwm_map(&self, fan_id: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    pwm_data: BTreeMap<String, PwmData>,
    #[serde(default)]
    pwm_map: BTreeMap<String, PwmTable>,
}

/// Single JSON file holding every fan's data.
///
/// Writes go to a temporary sibling file which then replaces the original,
/// so a crash never leaves a truncated document behind.
#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Document> {
        if !self.path.exists() {
            return Ok(Document::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn write(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(doc)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Persisted fan data to {}", self.path.display());
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Document)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("persistence lock poisoned"))?;
        let mut doc = self.read()?;
        f(&mut doc);
        self.write(&doc)
    }

    fn view<T>(&self, f: impl FnOnce(Document) -> T) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("persistence lock poisoned"))?;
        Ok(f(self.read()?))
    }
}

impl Persistence for JsonFilePersistence {
    fn load_fan_pwm_data(&self, fan_id: &str) -> Result<Option<PwmData>> {
        self.view(|mut doc| doc.pwm_data.remove(fan_id))
    }

    fn save_fan_pwm_data(&self, fan_id: &str, data: &PwmData) -> Result<()> {
        self.update(|doc| {
            doc.pwm_data.insert(fan_id.to_string(), data.clone());
        })
    }

    fn delete_fan_pwm_data(&self, fan_id: &str) -> Result<()> {
        self.update(|doc| {
            doc.pwm_data.remove(fan_id);
        })
    }

    fn load_fan_pwm_map(&self, fan_id: &str) -> Result<Option<PwmTable>> {
        self.view(|mut doc| doc.pwm_map.remove(fan_id))
    }

    fn save_fan_pwm_map(&self, fan_id: &str, map: &PwmTable) -> Result<()> {
        self.update(|doc| {
            doc.pwm_map.insert(fan_id.to_string(), map.clone());
        })
    }

    fn delete_fan_pwm_map(&self, fan_id: &str) -> Result<()> {
        self.update(|doc| {
            doc.pwm_map.remove(fan_id);
        })
    }
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    pwm_data: DashMap<String, PwmData>,
    pwm_map: DashMap<String, PwmTable>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn load_fan_pwm_data(&self, fan_id: &str) -> Result<Option<PwmData>> {
        Ok(self.pwm_data.get(fan_id).map(|d| d.value().clone()))
    }

    fn save_fan_pwm_data(&self, fan_id: &str, data: &PwmData) -> Result<()> {
        self.pwm_data.insert(fan_id.to_string(), data.clone());
        Ok(())
    }

    fn delete_fan_pwm_data(&self, fan_id: &str) -> Result<()> {
        self.pwm_data.remove(fan_id);
        Ok(())
    }

    fn load_fan_pwm_map(&self, fan_id: &str) -> Result<Option<PwmTable>> {
        Ok(self.pwm_map.get(fan_id).map(|m| m.value().clone()))
    }

    fn save_fan_pwm_map(&self, fan_id: &str, map: &PwmTable) -> Result<()> {
        self.pwm_map.insert(fan_id.to_string(), map.clone());
        Ok(())
    }

    fn delete_fan_pwm_map(&self, fan_id: &str) -> Result<()> {
        self.pwm_map.remove(fan_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_data() -> PwmData {
        BTreeMap::from([(0, 0.0), (128, 900.5), (255, 1800.0)])
    }

    #[test]
    fn json_store_roundtrips_between_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/fanwarden.json");

        let store = JsonFilePersistence::new(&path);
        store.save_fan_pwm_data("cpu", &sample_data()).unwrap();
        store
            .save_fan_pwm_map("cpu", &BTreeMap::from([(0, 0), (1, 0), (2, 4)]))
            .unwrap();

        let reopened = JsonFilePersistence::new(&path);
        assert_eq!(reopened.load_fan_pwm_data("cpu").unwrap(), Some(sample_data()));
        assert_eq!(
            reopened.load_fan_pwm_map("cpu").unwrap().unwrap().get(&2),
            Some(&4)
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn json_store_missing_file_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("absent.json"));

        assert_eq!(store.load_fan_pwm_data("cpu").unwrap(), None);
        assert_eq!(store.load_fan_pwm_map("cpu").unwrap(), None);
    }

    #[test]
    fn json_store_delete_keeps_other_fans() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("db.json"));
        store.save_fan_pwm_data("cpu", &sample_data()).unwrap();
        store.save_fan_pwm_data("case", &sample_data()).unwrap();

        store.delete_fan_pwm_data("cpu").unwrap();

        assert_eq!(store.load_fan_pwm_data("cpu").unwrap(), None);
        assert!(store.load_fan_pwm_data("case").unwrap().is_some());
    }

    #[test]
    fn json_store_reports_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonFilePersistence::new(&path).load_fan_pwm_data("cpu").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn memory_store_roundtrip_and_delete() {
        let store = MemoryPersistence::new();
        store.save_fan_pwm_data("cpu", &sample_data()).unwrap();
        assert_eq!(store.load_fan_pwm_data("cpu").unwrap(), Some(sample_data()));

        store.delete_fan_pwm_data("cpu").unwrap();
        store.delete_fan_pwm_map("cpu").unwrap();
        assert_eq!(store.load_fan_pwm_data("cpu").unwrap(), None);
    }
}
