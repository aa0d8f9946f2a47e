//! Presence correlation: resolve detections against the registry, persist
//! scan results and raise first-seen alerts

use chrono::{DateTime, Utc};
use lanwatch_core::{
    Detection, Device, DeviceRegistry, HardwareId, NewDevice, Person, ScanHistory, ScanResult,
    Store, StoreError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Raised the first time a hardware id is observed in the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeviceEvent {
    pub hardware_id: HardwareId,
    pub network_address: String,
}

/// Callback invoked synchronously inside the scan cycle. Keep it fast.
pub type NewDeviceCallback = Arc<dyn Fn(NewDeviceEvent) + Send + Sync>;

/// Outcome of one processed scan cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub timestamp: DateTime<Utc>,
    pub detections: usize,
    pub new_devices: usize,
}

/// A device saved through the correlator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub device: Device,
    /// Earlier scan results linked to the new device
    pub backfilled: usize,
}

/// Cross-references detections with the registry and tracks the known set
pub struct Correlator {
    store: Arc<dyn Store>,
    /// Hardware ids seen or registered. Held for a whole scan cycle and for
    /// every registration, so the registry cannot change mid-cycle.
    known: Mutex<HashSet<HardwareId>>,
    last_scan: Arc<RwLock<Option<DateTime<Utc>>>>,
    on_new_device: RwLock<Option<NewDeviceCallback>>,
}

impl Correlator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            known: Mutex::new(HashSet::new()),
            last_scan: Arc::new(RwLock::new(None)),
            on_new_device: RwLock::new(None),
        }
    }

    /// Register the New-Device callback, replacing any previous one
    pub fn set_new_device_alert<F>(&self, callback: F)
    where
        F: Fn(NewDeviceEvent) + Send + Sync + 'static,
    {
        let callback: NewDeviceCallback = Arc::new(callback);
        if let Ok(mut slot) = self.on_new_device.write() {
            *slot = Some(callback);
        }
    }

    /// Rebuild the known set from scan history and the device registry so
    /// that devices seen before a restart do not alert again
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        let mut ids = self.store.known_hardware_ids()?;
        ids.extend(self.store.list_all()?.into_iter().map(|d| d.hardware_id));

        let mut known = self.known.lock().map_err(|_| StoreError::Poisoned)?;
        known.extend(ids);

        info!(known = known.len(), "Reconciled known devices");
        Ok(known.len())
    }

    /// Correlate and persist one completed scan
    pub fn process(&self, detections: &[Detection]) -> Result<CycleSummary, StoreError> {
        let mut known = self.known.lock().map_err(|_| StoreError::Poisoned)?;

        // One registry snapshot per cycle
        let registry: HashMap<HardwareId, u64> = self
            .store
            .list_all()?
            .into_iter()
            .map(|d| (d.hardware_id, d.id))
            .collect();

        let timestamp = Utc::now();
        let results: Vec<ScanResult> = detections
            .iter()
            .map(|detection| {
                let hardware_id = HardwareId::from_detection(&detection.hardware_id);
                ScanResult {
                    timestamp,
                    device: registry.get(&hardware_id).copied(),
                    hardware_id,
                    network_address: detection.network_address.clone(),
                }
            })
            .collect();

        self.store.append_batch(&results)?;

        if let Ok(mut last) = self.last_scan.write() {
            *last = Some(timestamp);
        }

        let callback = self.on_new_device.read().ok().and_then(|slot| slot.clone());
        let mut new_devices = 0;

        for result in &results {
            if !known.insert(result.hardware_id.clone()) {
                continue;
            }
            new_devices += 1;
            info!(
                mac = %result.hardware_id,
                ip = %result.network_address,
                "New device detected"
            );
            if let Some(callback) = &callback {
                callback(NewDeviceEvent {
                    hardware_id: result.hardware_id.clone(),
                    network_address: result.network_address.clone(),
                });
            }
        }

        debug!(
            detections = results.len(),
            new = new_devices,
            "Scan cycle correlated"
        );

        Ok(CycleSummary {
            timestamp,
            detections: results.len(),
            new_devices,
        })
    }

    /// Save a device and link its earlier sightings, outside of any scan
    /// cycle. Only a newly created device is backfilled; updating an existing
    /// one leaves history alone.
    pub fn register(&self, device: NewDevice) -> Result<Registration, StoreError> {
        let mut known = self.known.lock().map_err(|_| StoreError::Poisoned)?;

        let existed = self.store.find_by_hardware_id(&device.hardware_id)?.is_some();
        let device = self.store.save(device)?;
        known.insert(device.hardware_id.clone());

        let backfilled = if existed {
            0
        } else {
            self.store
                .backfill_scan_results(&device.hardware_id, device.id)?
        };

        info!(
            device = %device.hardware_id,
            id = device.id,
            backfilled = backfilled,
            "Device registered"
        );
        Ok(Registration { device, backfilled })
    }

    /// Snapshot of the known set
    pub fn known_devices(&self) -> HashSet<HardwareId> {
        self.known.lock().map(|k| k.clone()).unwrap_or_default()
    }

    /// Read-only handle for query handlers
    pub fn view(&self) -> PresenceView {
        PresenceView {
            store: self.store.clone(),
            last_scan: self.last_scan.clone(),
        }
    }
}

/// One scan result joined with its device and owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub result: ScanResult,
    pub device: Option<Device>,
    pub owner: Option<Person>,
}

/// Everything seen in the most recent scan
#[derive(Debug, Clone)]
pub struct PresenceReport {
    pub timestamp: DateTime<Utc>,
    pub entries: Vec<PresenceEntry>,
}

impl PresenceReport {
    /// Entries whose hardware id belongs to a registered device
    pub fn registered(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.iter().filter(|e| e.device.is_some())
    }

    /// Entries nobody has registered yet
    pub fn unknown(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.iter().filter(|e| e.device.is_none())
    }
}

/// Read-only access to presence data for chat handlers
#[derive(Clone)]
pub struct PresenceView {
    store: Arc<dyn Store>,
    last_scan: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl PresenceView {
    /// Timestamp of the last fully persisted scan
    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.last_scan.read().ok().and_then(|t| *t)
    }

    /// Devices present in the last scan, or None before the first scan
    pub fn current(&self) -> Result<Option<PresenceReport>, StoreError> {
        let Some(timestamp) = self.last_scan() else {
            return Ok(None);
        };
        let results = self.store.results_at(timestamp)?;
        Ok(Some(PresenceReport {
            timestamp,
            entries: self.join(results)?,
        }))
    }

    /// Most recent sighting of every hardware id, newest first
    pub fn last_seen(&self) -> Result<Vec<PresenceEntry>, StoreError> {
        let mut entries = self.join(self.store.latest_per_hardware_id()?)?;
        entries.sort_by(|a, b| {
            b.result
                .timestamp
                .cmp(&a.result.timestamp)
                .then_with(|| a.result.hardware_id.cmp(&b.result.hardware_id))
        });
        Ok(entries)
    }

    fn join(&self, results: Vec<ScanResult>) -> Result<Vec<PresenceEntry>, StoreError> {
        let devices: HashMap<u64, Device> = self
            .store
            .list_all()?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let people: HashMap<u64, Person> = self
            .store
            .list_people()?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        Ok(results
            .into_iter()
            .map(|result| {
                let device = result.device.and_then(|id| devices.get(&id).cloned());
                let owner = device
                    .as_ref()
                    .and_then(|d| d.owner)
                    .and_then(|id| people.get(&id).cloned());
                PresenceEntry {
                    result,
                    device,
                    owner,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanwatch_core::{JsonStore, NewDevice};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hw(s: &str) -> HardwareId {
        HardwareId::parse(s).unwrap()
    }

    fn recording_correlator(store: Arc<JsonStore>) -> (Correlator, Arc<Mutex<Vec<NewDeviceEvent>>>) {
        let correlator = Correlator::new(store);
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = alerts.clone();
        correlator.set_new_device_alert(move |event| sink.lock().unwrap().push(event));
        (correlator, alerts)
    }

    #[test]
    fn test_alerts_once_per_hardware_id() {
        let store = Arc::new(JsonStore::in_memory());
        let (correlator, alerts) = recording_correlator(store.clone());

        let scan = vec![
            Detection::new("AA-BB-CC-DD-EE-FF", "10.0.0.2"),
            Detection::new("aa:bb:cc:dd:ee:ff", "10.0.0.2"),
            Detection::new("11:22:33:44:55:66", "10.0.0.3"),
        ];
        let first = correlator.process(&scan).unwrap();
        let second = correlator.process(&scan).unwrap();

        assert_eq!(first.new_devices, 2);
        assert_eq!(second.new_devices, 0);
        let alerts = alerts.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].hardware_id, hw("aa:bb:cc:dd:ee:ff"));
        assert_eq!(alerts[1].hardware_id, hw("11:22:33:44:55:66"));
    }

    #[test]
    fn test_every_detection_is_recorded() {
        let store = Arc::new(JsonStore::in_memory());
        let device = store
            .save(NewDevice {
                hardware_id: hw("aa:bb:cc:dd:ee:ff"),
                name: Some("Laptop".to_string()),
                owner: None,
            })
            .unwrap();
        let (correlator, _) = recording_correlator(store.clone());

        let summary = correlator
            .process(&[
                Detection::new("AA:BB:CC:DD:EE:FF", "10.0.0.2"),
                Detection::new("11:22:33:44:55:66", "10.0.0.3"),
            ])
            .unwrap();

        let results = store.results_at(summary.timestamp).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].device, Some(device.id));
        assert_eq!(results[1].device, None);
    }

    #[test]
    fn test_reconcile_suppresses_alerts_for_previously_seen() {
        let store = Arc::new(JsonStore::in_memory());
        let earlier = Utc::now();
        for mac in ["aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb"] {
            store
                .append(ScanResult {
                    timestamp: earlier,
                    hardware_id: hw(mac),
                    network_address: "10.0.0.9".to_string(),
                    device: None,
                })
                .unwrap();
        }
        store
            .save(NewDevice {
                hardware_id: hw("cc:cc:cc:cc:cc:cc"),
                name: None,
                owner: None,
            })
            .unwrap();

        let (correlator, alerts) = recording_correlator(store.clone());
        correlator.reconcile().unwrap();

        let expected: HashSet<HardwareId> = ["aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb", "cc:cc:cc:cc:cc:cc"]
            .into_iter()
            .map(hw)
            .collect();
        assert_eq!(correlator.known_devices(), expected);

        correlator
            .process(&[
                Detection::new("aa:aa:aa:aa:aa:aa", "10.0.0.2"),
                Detection::new("bb:bb:bb:bb:bb:bb", "10.0.0.3"),
                Detection::new("cc:cc:cc:cc:cc:cc", "10.0.0.4"),
            ])
            .unwrap();
        assert!(alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_callback_runs_inside_cycle() {
        let store = Arc::new(JsonStore::in_memory());
        let correlator = Correlator::new(store);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        correlator.set_new_device_alert(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        correlator
            .process(&[Detection::new("aa:bb:cc:dd:ee:ff", "10.0.0.2")])
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registered_device_does_not_alert_on_first_sighting() {
        let store = Arc::new(JsonStore::in_memory());
        let (correlator, alerts) = recording_correlator(store.clone());
        correlator.reconcile().unwrap();

        let registration = correlator
            .register(NewDevice {
                hardware_id: hw("aa:bb:cc:dd:ee:77"),
                name: Some("Phone".to_string()),
                owner: None,
            })
            .unwrap();
        assert!(correlator.known_devices().contains(&hw("aa:bb:cc:dd:ee:77")));
        assert_eq!(registration.backfilled, 0);

        let summary = correlator
            .process(&[Detection::new("AA-BB-CC-DD-EE-77", "10.0.0.7")])
            .unwrap();
        assert_eq!(summary.new_devices, 0);
        assert!(alerts.lock().unwrap().is_empty());

        let results = store.results_at(summary.timestamp).unwrap();
        assert_eq!(results[0].device, Some(registration.device.id));
    }

    #[test]
    fn test_register_backfills_only_new_devices() {
        let store = Arc::new(JsonStore::in_memory());
        let (correlator, _) = recording_correlator(store.clone());
        for ip in ["10.0.0.2", "10.0.0.3"] {
            correlator
                .process(&[Detection::new("aa:bb:cc:dd:ee:ff", ip)])
                .unwrap();
        }

        let first = correlator
            .register(NewDevice {
                hardware_id: hw("aa:bb:cc:dd:ee:ff"),
                name: Some("Laptop".to_string()),
                owner: None,
            })
            .unwrap();
        assert_eq!(first.backfilled, 2);

        let renamed = correlator
            .register(NewDevice {
                hardware_id: hw("aa:bb:cc:dd:ee:ff"),
                name: Some("Work laptop".to_string()),
                owner: None,
            })
            .unwrap();
        assert_eq!(renamed.device.id, first.device.id);
        assert_eq!(renamed.backfilled, 0);
    }

    #[test]
    fn test_register_waits_for_a_running_cycle() {
        let store = Arc::new(JsonStore::in_memory());
        let correlator = Arc::new(Correlator::new(store.clone()));

        // The callback runs inside the cycle: start a registration from it and
        // give it time to reach the lock before the cycle ends.
        let registrar = correlator.clone();
        let handle = Arc::new(Mutex::new(None));
        let slot = handle.clone();
        correlator.set_new_device_alert(move |event| {
            let registrar = registrar.clone();
            let thread = std::thread::spawn(move || {
                registrar
                    .register(NewDevice {
                        hardware_id: event.hardware_id,
                        name: None,
                        owner: None,
                    })
                    .unwrap()
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            let finished_during_cycle = thread.is_finished();
            *slot.lock().unwrap() = Some((thread, finished_during_cycle));
        });

        let summary = correlator
            .process(&[Detection::new("aa:bb:cc:dd:ee:01", "10.0.0.2")])
            .unwrap();
        let (thread, finished_during_cycle) = handle.lock().unwrap().take().unwrap();
        assert!(!finished_during_cycle);
        let registration = thread.join().unwrap();

        // The cycle's row existed before the registration, so it was linked
        assert_eq!(registration.backfilled, 1);
        let results = store.results_at(summary.timestamp).unwrap();
        assert_eq!(results[0].device, Some(registration.device.id));
    }

    #[test]
    fn test_view_reports_current_and_last_seen() {
        let store = Arc::new(JsonStore::in_memory());
        let alice = store.add_person("Alice").unwrap();
        store
            .save(NewDevice {
                hardware_id: hw("aa:bb:cc:dd:ee:ff"),
                name: Some("Laptop".to_string()),
                owner: Some(alice.id),
            })
            .unwrap();
        let correlator = Correlator::new(store);
        let view = correlator.view();
        assert!(view.current().unwrap().is_none());

        correlator
            .process(&[
                Detection::new("aa:bb:cc:dd:ee:ff", "10.0.0.2"),
                Detection::new("11:22:33:44:55:66", "10.0.0.3"),
            ])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        correlator
            .process(&[Detection::new("aa:bb:cc:dd:ee:ff", "10.0.0.2")])
            .unwrap();

        let report = view.current().unwrap().unwrap();
        assert_eq!(Some(report.timestamp), view.last_scan());
        assert_eq!(report.registered().count(), 1);
        assert_eq!(report.unknown().count(), 0);
        let entry = report.registered().next().unwrap();
        assert_eq!(entry.owner.as_ref().map(|p| p.name.as_str()), Some("Alice"));

        let seen = view.last_seen().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].result.hardware_id, hw("aa:bb:cc:dd:ee:ff"));
    }
}
