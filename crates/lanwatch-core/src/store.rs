//! Device registry and scan history persistence
//!
//! The registry (people, devices and id counters) lives in a single pretty
//! JSON document that is rewritten on every mutation. Scan history is an
//! append-only JSON-lines file, one `ScanResult` per line, so a scan cycle
//! only ever appends.
//!
//! Memory holds the registry, the latest result per hardware id and the rows
//! of the most recent cycle. Older cycles are read back from disk on demand.
//!
//! Layout inside the data directory:
//! - `registry.json`
//! - `scan_results.jsonl`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{Device, HardwareId, NewDevice, Person, ScanResult};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("no person with id {0}")]
    UnknownPerson(u64),
    #[error("a person named '{0}' already exists")]
    DuplicatePerson(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Create/read/update operations on registered devices and people
pub trait DeviceRegistry: Send + Sync {
    fn find_by_hardware_id(&self, hardware_id: &HardwareId) -> Result<Option<Device>, StoreError>;

    fn find_device(&self, id: u64) -> Result<Option<Device>, StoreError>;

    /// Insert a device, or update the one already registered under the same
    /// hardware id. Updating never touches scan history.
    fn save(&self, device: NewDevice) -> Result<Device, StoreError>;

    fn list_all(&self) -> Result<Vec<Device>, StoreError>;

    /// Point every historical scan result for `hardware_id` at `device_id`.
    /// Returns the number of rows changed.
    fn backfill_scan_results(
        &self,
        hardware_id: &HardwareId,
        device_id: u64,
    ) -> Result<usize, StoreError>;

    fn add_person(&self, name: &str) -> Result<Person, StoreError>;

    fn find_person(&self, id: u64) -> Result<Option<Person>, StoreError>;

    /// Case-insensitive lookup by name
    fn find_person_by_name(&self, name: &str) -> Result<Option<Person>, StoreError>;

    fn list_people(&self) -> Result<Vec<Person>, StoreError>;

    /// Remove a person; their devices become ownerless
    fn delete_person(&self, id: u64) -> Result<bool, StoreError>;
}

/// Append-only scan result history
pub trait ScanHistory: Send + Sync {
    fn append(&self, result: ScanResult) -> Result<(), StoreError> {
        self.append_batch(std::slice::from_ref(&result))
    }

    fn append_batch(&self, results: &[ScanResult]) -> Result<(), StoreError>;

    /// All results recorded with exactly this cycle timestamp
    fn results_at(&self, timestamp: DateTime<Utc>) -> Result<Vec<ScanResult>, StoreError>;

    /// The most recent result for every hardware id ever seen
    fn latest_per_hardware_id(&self) -> Result<Vec<ScanResult>, StoreError>;

    /// Distinct hardware ids present in history
    fn known_hardware_ids(&self) -> Result<HashSet<HardwareId>, StoreError>;
}

/// Everything the presence pipeline and the chat handlers need from storage
pub trait Store: DeviceRegistry + ScanHistory {}

impl<T: DeviceRegistry + ScanHistory + ?Sized> Store for T {}

/// Registry document stored in `registry.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    people: Vec<Person>,
    #[serde(default)]
    devices: Vec<Device>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            next_id: 1,
            people: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl RegistryFile {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }
}

/// Scan history kept in memory: one row per hardware id plus the last cycle
#[derive(Debug, Default)]
struct HistoryIndex {
    latest: HashMap<HardwareId, ScanResult>,
    last_cycle: Vec<ScanResult>,
}

impl HistoryIndex {
    fn record(&mut self, result: &ScanResult) {
        match self.newest() {
            Some(newest) if newest == result.timestamp => self.last_cycle.push(result.clone()),
            Some(newest) if newest > result.timestamp => {}
            _ => self.last_cycle = vec![result.clone()],
        }

        match self.latest.get(&result.hardware_id) {
            Some(seen) if seen.timestamp > result.timestamp => {}
            _ => {
                self.latest
                    .insert(result.hardware_id.clone(), result.clone());
            }
        }
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        self.last_cycle.first().map(|r| r.timestamp)
    }

    fn link(&mut self, hardware_id: &HardwareId, device_id: u64) {
        let rows = self
            .latest
            .get_mut(hardware_id)
            .into_iter()
            .chain(self.last_cycle.iter_mut());
        for row in rows {
            if &row.hardware_id == hardware_id {
                row.device = Some(device_id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    registry: RegistryFile,
    index: HistoryIndex,
    /// Full history of a store without a data directory; unused otherwise
    log: Vec<ScanResult>,
}

#[derive(Debug, Clone)]
struct StorePaths {
    registry: PathBuf,
    history: PathBuf,
}

/// JSON-file backed store (or purely in-memory when opened without a path)
#[derive(Debug)]
pub struct JsonStore {
    paths: Option<StorePaths>,
    inner: RwLock<Inner>,
}

impl JsonStore {
    /// Open (or create) a store in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;

        let paths = StorePaths {
            registry: data_dir.join("registry.json"),
            history: data_dir.join("scan_results.jsonl"),
        };

        let registry = if paths.registry.exists() {
            let content = std::fs::read_to_string(&paths.registry)?;
            serde_json::from_str(&content)?
        } else {
            RegistryFile::default()
        };

        let mut index = HistoryIndex::default();
        let loaded = read_history(&paths.history, |result| {
            index.record(&result);
        })?;

        info!(
            path = %data_dir.display(),
            people = registry.people.len(),
            devices = registry.devices.len(),
            scan_results = loaded,
            "Opened store"
        );

        Ok(Self {
            paths: Some(paths),
            inner: RwLock::new(Inner {
                registry,
                index,
                log: Vec::new(),
            }),
        })
    }

    /// Create a store that is never written to disk. It keeps its whole
    /// history in memory, so it suits tests and one-off scans.
    pub fn in_memory() -> Self {
        Self {
            paths: None,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }

    /// Apply a change to a copy of the registry and keep it only once it is
    /// on disk
    fn update_registry<T>(
        &self,
        inner: &mut Inner,
        change: impl FnOnce(&mut RegistryFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut registry = inner.registry.clone();
        let value = change(&mut registry)?;
        if let Some(paths) = &self.paths {
            let content = serde_json::to_string_pretty(&registry)?;
            write_atomic(&paths.registry, content.as_bytes())?;
        }
        inner.registry = registry;
        Ok(value)
    }

    fn append_history_lines(&self, results: &[ScanResult]) -> Result<(), StoreError> {
        if let Some(paths) = &self.paths {
            let mut buf = Vec::new();
            for result in results {
                serde_json::to_writer(&mut buf, result)?;
                buf.push(b'\n');
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&paths.history)?;
            file.write_all(&buf)?;
            file.flush()?;
        }
        Ok(())
    }
}

/// Stream the JSON-lines history, skipping lines that fail to parse.
/// Returns the number of results read.
fn read_history(path: &Path, mut visit: impl FnMut(ScanResult)) -> Result<usize, StoreError> {
    if !path.exists() {
        return Ok(0);
    }

    let file = File::open(path)?;
    let mut count = 0;

    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScanResult>(&line) {
            Ok(result) => {
                count += 1;
                visit(result);
            }
            Err(e) => warn!(line = number + 1, error = %e, "Skipping malformed scan result"),
        }
    }

    Ok(count)
}

/// Rewrite the history file with every row for `hardware_id` pointing at
/// `device_id`. The original stays untouched unless the rewrite completes.
fn relink_history(
    path: &Path,
    hardware_id: &HardwareId,
    device_id: u64,
) -> Result<usize, StoreError> {
    if !path.exists() {
        return Ok(0);
    }

    let tmp = path.with_extension("tmp");
    let rewritten = copy_relinked(path, &tmp, hardware_id, device_id).and_then(|changed| {
        if changed > 0 {
            std::fs::rename(&tmp, path)?;
        }
        Ok(changed)
    });

    if tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
    }
    rewritten
}

fn copy_relinked(
    from: &Path,
    to: &Path,
    hardware_id: &HardwareId,
    device_id: u64,
) -> Result<usize, StoreError> {
    let reader = BufReader::new(File::open(from)?);
    let mut writer = BufWriter::new(File::create(to)?);
    let mut changed = 0;

    for line in reader.lines() {
        let line = line?;
        match serde_json::from_str::<ScanResult>(&line) {
            Ok(mut result)
                if &result.hardware_id == hardware_id && result.device != Some(device_id) =>
            {
                result.device = Some(device_id);
                serde_json::to_writer(&mut writer, &result)?;
                changed += 1;
            }
            // Other rows and malformed lines are copied verbatim
            _ => writer.write_all(line.as_bytes())?,
        }
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    Ok(changed)
}

/// Write via a temporary sibling file and rename over the target
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

impl DeviceRegistry for JsonStore {
    fn find_by_hardware_id(&self, hardware_id: &HardwareId) -> Result<Option<Device>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .registry
            .devices
            .iter()
            .find(|d| &d.hardware_id == hardware_id)
            .cloned())
    }

    fn find_device(&self, id: u64) -> Result<Option<Device>, StoreError> {
        let inner = self.read()?;
        Ok(inner.registry.devices.iter().find(|d| d.id == id).cloned())
    }

    fn save(&self, device: NewDevice) -> Result<Device, StoreError> {
        let mut inner = self.write()?;

        let saved = self.update_registry(&mut inner, |registry| {
            if let Some(owner) = device.owner {
                if !registry.people.iter().any(|p| p.id == owner) {
                    return Err(StoreError::UnknownPerson(owner));
                }
            }

            let saved = match registry
                .devices
                .iter_mut()
                .find(|d| d.hardware_id == device.hardware_id)
            {
                Some(existing) => {
                    existing.name = device.name;
                    existing.owner = device.owner;
                    existing.clone()
                }
                None => {
                    let created = Device {
                        id: registry.allocate_id(),
                        hardware_id: device.hardware_id,
                        name: device.name,
                        owner: device.owner,
                    };
                    registry.devices.push(created.clone());
                    created
                }
            };
            Ok(saved)
        })?;

        debug!(device = %saved.hardware_id, id = saved.id, "Saved device");
        Ok(saved)
    }

    fn list_all(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.read()?.registry.devices.clone())
    }

    fn backfill_scan_results(
        &self,
        hardware_id: &HardwareId,
        device_id: u64,
    ) -> Result<usize, StoreError> {
        let mut inner = self.write()?;

        let changed = match &self.paths {
            Some(paths) => relink_history(&paths.history, hardware_id, device_id)?,
            None => {
                let mut changed = 0;
                for result in inner.log.iter_mut() {
                    if &result.hardware_id == hardware_id && result.device != Some(device_id) {
                        result.device = Some(device_id);
                        changed += 1;
                    }
                }
                changed
            }
        };
        inner.index.link(hardware_id, device_id);

        debug!(device = %hardware_id, rows = changed, "Backfilled scan results");
        Ok(changed)
    }

    fn add_person(&self, name: &str) -> Result<Person, StoreError> {
        let mut inner = self.write()?;
        let name = name.trim();

        self.update_registry(&mut inner, |registry| {
            if registry
                .people
                .iter()
                .any(|p| p.name.to_lowercase() == name.to_lowercase())
            {
                return Err(StoreError::DuplicatePerson(name.to_string()));
            }

            let person = Person {
                id: registry.allocate_id(),
                name: name.to_string(),
            };
            registry.people.push(person.clone());
            Ok(person)
        })
    }

    fn find_person(&self, id: u64) -> Result<Option<Person>, StoreError> {
        Ok(self.read()?.registry.people.iter().find(|p| p.id == id).cloned())
    }

    fn find_person_by_name(&self, name: &str) -> Result<Option<Person>, StoreError> {
        let wanted = name.trim().to_lowercase();
        Ok(self
            .read()?
            .registry
            .people
            .iter()
            .find(|p| p.name.to_lowercase() == wanted)
            .cloned())
    }

    fn list_people(&self) -> Result<Vec<Person>, StoreError> {
        Ok(self.read()?.registry.people.clone())
    }

    fn delete_person(&self, id: u64) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        if !inner.registry.people.iter().any(|p| p.id == id) {
            return Ok(false);
        }

        self.update_registry(&mut inner, |registry| {
            registry.people.retain(|p| p.id != id);
            for device in registry.devices.iter_mut() {
                if device.owner == Some(id) {
                    device.owner = None;
                }
            }
            Ok(())
        })?;
        Ok(true)
    }
}

impl ScanHistory for JsonStore {
    fn append_batch(&self, results: &[ScanResult]) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        self.append_history_lines(results)?;
        if self.paths.is_none() {
            inner.log.extend_from_slice(results);
        }
        for result in results {
            inner.index.record(result);
        }
        Ok(())
    }

    fn results_at(&self, timestamp: DateTime<Utc>) -> Result<Vec<ScanResult>, StoreError> {
        let inner = self.read()?;
        match inner.index.newest() {
            Some(newest) if newest == timestamp => return Ok(inner.index.last_cycle.clone()),
            Some(newest) if newest < timestamp => return Ok(Vec::new()),
            None => return Ok(Vec::new()),
            _ => {}
        }

        // An older cycle: read it back from the full history
        let mut found = Vec::new();
        match &self.paths {
            Some(paths) => {
                read_history(&paths.history, |result| {
                    if result.timestamp == timestamp {
                        found.push(result);
                    }
                })?;
            }
            None => found.extend(
                inner
                    .log
                    .iter()
                    .filter(|r| r.timestamp == timestamp)
                    .cloned(),
            ),
        }
        Ok(found)
    }

    fn latest_per_hardware_id(&self) -> Result<Vec<ScanResult>, StoreError> {
        Ok(self.read()?.index.latest.values().cloned().collect())
    }

    fn known_hardware_ids(&self) -> Result<HashSet<HardwareId>, StoreError> {
        Ok(self.read()?.index.latest.keys().cloned().collect())
    }
}
