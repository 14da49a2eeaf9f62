use crate::types::{Station, StationName};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Snapshot of the station list, ordered online-first then by name
pub type StationList = Arc<Vec<Station>>;

/// In-memory set of known command stations.
///
/// Discovery events and health probes both write here, so every mutation
/// goes through one mutex. Stations are only ever marked offline; the sole
/// way to drop entries is [`StationRegistry::clear`]. Cloning yields another
/// handle to the same registry.
#[derive(Clone)]
pub struct StationRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    stations: Mutex<BTreeMap<StationName, Station>>,
    snapshot_tx: watch::Sender<StationList>,
}

impl StationRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(RegistryInner {
                stations: Mutex::new(BTreeMap::new()),
                snapshot_tx,
            }),
        }
    }

    /// Subscribe to snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<StationList> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Record a discovery sighting.
    ///
    /// Unknown names are inserted online with an unresolved address; known
    /// names are flipped back online and keep whatever address they had.
    /// A snapshot is published only if something changed. Returns `true` if
    /// the name was new.
    pub fn upsert_from_discovery(&self, name: &str, host_name: &str, port: u16) -> bool {
        let mut stations = self.lock();
        let (inserted, changed) = match stations.get_mut(name) {
            Some(station) => {
                let revived = !station.is_online;
                station.is_online = true;
                (false, revived)
            }
            None => {
                stations.insert(name.to_string(), Station::new(name, host_name, port));
                (true, true)
            }
        };
        if changed {
            self.publish(&stations);
        }
        inserted
    }

    /// Returns `true` if the station was online before
    pub fn mark_offline(&self, name: &str) -> bool {
        self.set_online(name, false)
    }

    /// Returns `true` if the station was offline before
    pub fn mark_online(&self, name: &str) -> bool {
        self.set_online(name, true)
    }

    fn set_online(&self, name: &str, online: bool) -> bool {
        let mut stations = self.lock();
        let Some(station) = stations.get_mut(name) else {
            return false;
        };
        if station.is_online == online {
            return false;
        }
        station.is_online = online;
        self.publish(&stations);
        true
    }

    /// Store the resolved IP for a station. Returns `true` if it changed.
    pub fn set_resolved_address(&self, name: &str, ip: &str) -> bool {
        let mut stations = self.lock();
        let Some(station) = stations.get_mut(name) else {
            return false;
        };
        if station.ip_address == ip {
            return false;
        }
        station.ip_address = ip.to_string();
        self.publish(&stations);
        true
    }

    /// Mark every station missing from `visible` offline.
    ///
    /// Never adds or removes entries. Returns the names that went offline.
    pub fn reconcile(&self, visible: &HashSet<StationName>) -> Vec<StationName> {
        let mut stations = self.lock();
        let mut demoted = Vec::new();
        for (name, station) in stations.iter_mut() {
            if station.is_online && !visible.contains(name) {
                station.is_online = false;
                demoted.push(name.clone());
            }
        }
        if !demoted.is_empty() {
            self.publish(&stations);
        }
        demoted
    }

    pub fn get(&self, name: &str) -> Option<Station> {
        self.lock().get(name).cloned()
    }

    /// Stations sorted online-first, then by name ascending
    pub fn snapshot(&self) -> Vec<Station> {
        sorted(&self.lock())
    }

    /// Stations currently believed online
    pub fn online(&self) -> Vec<Station> {
        self.lock().values().filter(|s| s.is_online).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every station
    pub fn clear(&self) {
        let mut stations = self.lock();
        stations.clear();
        self.publish(&stations);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<StationName, Station>> {
        self.inner
            .stations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, stations: &BTreeMap<StationName, Station>) {
        self.inner.snapshot_tx.send_replace(Arc::new(sorted(stations)));
    }
}

impl Default for StationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(stations: &BTreeMap<StationName, Station>) -> Vec<Station> {
    let mut list: Vec<Station> = stations.values().cloned().collect();
    list.sort_by(|a, b| {
        b.is_online
            .cmp(&a.is_online)
            .then_with(|| a.name.cmp(&b.name))
    });
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNRESOLVED_ADDRESS;

    fn names(list: &[Station]) -> Vec<(&str, bool)> {
        list.iter().map(|s| (s.name.as_str(), s.is_online)).collect()
    }

    #[test]
    fn re_adding_an_offline_station_does_not_duplicate() {
        let registry = StationRegistry::new();
        assert!(registry.upsert_from_discovery("A", "A.local.", 2560));
        assert!(registry.mark_offline("A"));
        assert!(!registry.upsert_from_discovery("A", "A.local.", 2560));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "A");
        assert!(snapshot[0].is_online);
    }

    #[test]
    fn re_add_keeps_resolved_address() {
        let registry = StationRegistry::new();
        registry.upsert_from_discovery("A", "A.local.", 2560);
        assert!(registry.set_resolved_address("A", "192.168.1.20"));
        assert!(!registry.set_resolved_address("A", "192.168.1.20"));
        registry.mark_offline("A");
        registry.upsert_from_discovery("A", "A.local.", 2560);
        assert_eq!(registry.get("A").unwrap().ip_address, "192.168.1.20");
    }

    #[test]
    fn mutations_on_unknown_names_are_noops() {
        let registry = StationRegistry::new();
        assert!(!registry.mark_offline("ghost"));
        assert!(!registry.mark_online("ghost"));
        assert!(!registry.set_resolved_address("ghost", "10.0.0.1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_orders_online_first_then_by_name() {
        let registry = StationRegistry::new();
        for name in ["delta", "alpha", "charlie", "bravo", "echo"] {
            registry.upsert_from_discovery(name, &format!("{name}.local."), 2560);
        }
        registry.mark_offline("alpha");
        registry.mark_offline("delta");

        assert_eq!(
            names(&registry.snapshot()),
            vec![
                ("bravo", true),
                ("charlie", true),
                ("echo", true),
                ("alpha", false),
                ("delta", false),
            ]
        );
    }

    #[test]
    fn reconcile_only_demotes() {
        let registry = StationRegistry::new();
        registry.upsert_from_discovery("A", "A.local.", 2560);
        registry.upsert_from_discovery("B", "B.local.", 2560);

        let visible: HashSet<String> = ["B".to_string(), "Z".to_string()].into();
        assert_eq!(registry.reconcile(&visible), vec!["A".to_string()]);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("Z").is_none());
        assert!(!registry.get("A").unwrap().is_online);
        assert!(registry.get("B").unwrap().is_online);
    }

    #[test]
    fn clear_empties_and_publishes() {
        let registry = StationRegistry::new();
        let rx = registry.subscribe();
        registry.upsert_from_discovery("A", "A.local.", 2560);
        assert_eq!(rx.borrow().len(), 1);
        assert_eq!(rx.borrow()[0].ip_address, UNRESOLVED_ADDRESS);

        registry.clear();
        assert!(registry.is_empty());
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn unchanged_sightings_do_not_publish() {
        let registry = StationRegistry::new();
        let mut rx = registry.subscribe();

        registry.upsert_from_discovery("A", "A.local.", 2560);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        registry.upsert_from_discovery("A", "A.local.", 2560);
        assert!(!registry.mark_online("A"));
        assert!(registry.reconcile(&["A".to_string()].into()).is_empty());
        assert!(!rx.has_changed().unwrap());

        registry.mark_offline("A");
        rx.borrow_and_update();
        registry.upsert_from_discovery("A", "A.local.", 2560);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update()[0].is_online);
    }

    #[test]
    fn concurrent_writers_never_duplicate() {
        let registry = StationRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.upsert_from_discovery("A", "A.local.", 2560);
                        if i % 2 == 0 {
                            registry.mark_offline("A");
                        } else {
                            registry.set_resolved_address("A", "10.0.0.7");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 1);
    }
}
