//! Mediated-device-type provisioning.
//!
//! Makes the set of mdev types instantiated on the node's cards match the
//! desired list. Creation walks a placement ring: one instance of the
//! current type per step, so several types sharing the same pool of cards
//! split it fairly instead of the first type exhausting every card before
//! the next gets a turn.

use crate::discovery::mediated::normalize_selector;
use crate::error::Result;
use crate::host::DeviceHandler;
use crate::observability::metrics as obs;
use crate::sysfs;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct MdevTypesManager {
    handler: Arc<dyn DeviceHandler>,
    mdev_bus_root: PathBuf,
    mdev_devices_root: PathBuf,
    /// Concurrent create/remove against one card's type directories is
    /// unsafe; every reconfiguration holds this lock end to end.
    lock: Mutex<()>,
}

impl MdevTypesManager {
    pub fn new(
        handler: Arc<dyn DeviceHandler>,
        mdev_bus_root: impl Into<PathBuf>,
        mdev_devices_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            handler,
            mdev_bus_root: mdev_bus_root.into(),
            mdev_devices_root: mdev_devices_root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Reconcile instantiated mdevs with the desired type list: remove
    /// instances of undesired types, then fill remaining card capacity
    /// round-robin across the desired ones. `externally_handled` UUIDs
    /// belong to an external device plugin and are never removed.
    ///
    /// Returns the types that ended up configured on at least one card.
    /// Individual create/remove failures are logged and skipped so one bad
    /// card never stalls provisioning of the others.
    pub async fn update_mdev_types_configuration(
        &self,
        desired: &[String],
        externally_handled: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;

        let supported = self.discover_supported_types(desired);
        let desired_type_ids: BTreeSet<String> = supported.keys().cloned().collect();
        self.remove_undesired_mdevs(&desired_type_ids, externally_handled);
        let configured = self.provision(&supported);

        Ok(configured)
    }

    /// Which desired types each parent card supports, from the
    /// supported-types tree. A desired entry may name a type id or a type's
    /// display name; the returned map is keyed by type id either way.
    fn discover_supported_types(&self, desired: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut supported: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if desired.is_empty() {
            return supported;
        }
        let desired_normalized: HashSet<String> =
            desired.iter().map(|entry| normalize_selector(entry)).collect();

        let parents = match std::fs::read_dir(&self.mdev_bus_root) {
            Ok(parents) => parents,
            Err(_) => {
                debug!(path = ?self.mdev_bus_root, "no mediated-device-capable cards found");
                return supported;
            }
        };
        for parent_entry in parents.flatten() {
            let parent = parent_entry.file_name().to_string_lossy().to_string();
            let types_dir = parent_entry.path().join("mdev_supported_types");
            let Ok(types) = std::fs::read_dir(&types_dir) else {
                continue;
            };
            for type_entry in types.flatten() {
                let type_id = type_entry.file_name().to_string_lossy().to_string();
                let matches = desired_normalized.contains(&type_id)
                    || std::fs::read_to_string(type_entry.path().join("name"))
                        .map(|name| desired_normalized.contains(&normalize_selector(&name)))
                        .unwrap_or(false);
                if matches {
                    supported.entry(type_id).or_default().push(parent.clone());
                }
            }
        }
        for parents in supported.values_mut() {
            parents.sort();
        }
        supported
    }

    fn remove_undesired_mdevs(
        &self,
        desired_type_ids: &BTreeSet<String>,
        externally_handled: &HashSet<String>,
    ) {
        let entries = match std::fs::read_dir(&self.mdev_devices_root) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let uuid = entry.file_name().to_string_lossy().to_string();
            let Some(type_id) = sysfs::read_link_name(&entry.path().join("mdev_type")) else {
                continue;
            };
            if desired_type_ids.contains(&type_id) || externally_handled.contains(&uuid) {
                continue;
            }
            info!(%uuid, %type_id, "removing mediated device of undesired type");
            match self.handler.remove_mdev(&uuid) {
                Ok(()) => obs::record_mdev_removed(&type_id),
                Err(e) => warn!(%uuid, error = %e, "failed to remove mediated device"),
            }
        }
    }

    /// Fill card capacity by advancing around a ring of the desired types,
    /// creating one instance per step. A card is claimed by the first type
    /// instantiated on it; a (type, card) pair drops out when the card's
    /// budget for the type is exhausted, and the type leaves the ring when
    /// it has no usable card left.
    fn provision(&self, supported: &BTreeMap<String, Vec<String>>) -> Vec<String> {
        let mut ring: VecDeque<String> = supported.keys().cloned().collect();
        let mut budgets: HashMap<(String, String), u32> = HashMap::new();
        let mut claims = self.existing_claims(supported);
        let mut configured: BTreeSet<String> = claims.values().cloned().collect();

        while let Some(type_id) = ring.pop_front() {
            let Some(parents) = supported.get(&type_id) else {
                continue;
            };
            let Some(parent) = self.pick_parent(&type_id, parents, &mut budgets, &claims) else {
                // Out of capacity: the type leaves the ring.
                continue;
            };
            let uuid = Uuid::new_v4();
            match self.handler.create_mdev(&type_id, &parent, &uuid) {
                Ok(()) => {
                    if let Some(budget) = budgets.get_mut(&(type_id.clone(), parent.clone())) {
                        *budget = budget.saturating_sub(1);
                    }
                    claims.insert(parent, type_id.clone());
                    configured.insert(type_id.clone());
                    obs::record_mdev_created(&type_id);
                }
                Err(e) => {
                    warn!(%type_id, %parent, error = %e, "failed to create mediated device, skipping this card");
                    budgets.insert((type_id.clone(), parent), 0);
                }
            }
            ring.push_back(type_id);
        }
        configured.into_iter().collect()
    }

    /// Pick the card the next instance lands on: a card already committed to
    /// this type if one still has budget, else the lowest-address unclaimed
    /// supporting card.
    fn pick_parent(
        &self,
        type_id: &str,
        parents: &[String],
        budgets: &mut HashMap<(String, String), u32>,
        claims: &HashMap<String, String>,
    ) -> Option<String> {
        let mut candidates: Vec<&String> = parents
            .iter()
            .filter(|parent| claims.get(*parent).map(|t| t == type_id).unwrap_or(true))
            .collect();
        candidates.sort_by_key(|parent| (!claims.contains_key(*parent), (*parent).clone()));

        for parent in candidates {
            let key = (type_id.to_string(), parent.clone());
            let budget = match budgets.get(&key) {
                Some(budget) => *budget,
                None => {
                    let available = self
                        .handler
                        .read_mdev_available_instances(type_id, parent)
                        .unwrap_or_else(|e| {
                            warn!(%type_id, %parent, error = %e, "could not read available instances");
                            0
                        });
                    budgets.insert(key, available);
                    available
                }
            };
            if budget > 0 {
                return Some(parent.clone());
            }
        }
        None
    }

    /// Cards already hosting an instance of a desired type are committed to
    /// that type before the ring starts, so repeated reconciliation is
    /// idempotent.
    fn existing_claims(&self, supported: &BTreeMap<String, Vec<String>>) -> HashMap<String, String> {
        let mut claims = HashMap::new();
        let Ok(entries) = std::fs::read_dir(&self.mdev_devices_root) else {
            return claims;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(type_id) = sysfs::read_link_name(&path.join("mdev_type")) else {
                continue;
            };
            if !supported.contains_key(&type_id) {
                continue;
            }
            if let Some(parent) = parent_of_mdev(&path) {
                claims.insert(parent, type_id);
            }
        }
        claims
    }
}

/// The parent card of an instantiated mdev, two levels above its resolved
/// type directory.
fn parent_of_mdev(uuid_dir: &Path) -> Option<String> {
    let type_dir = std::fs::canonicalize(uuid_dir.join("mdev_type")).ok()?;
    let supported_types_dir = type_dir.parent()?;
    supported_types_dir.parent()?.file_name().map(|n| n.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DevletError;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// Simulates the kernel side of mdev provisioning: `create` grows a uuid
    /// directory with an `mdev_type` symlink, `remove` deletes it.
    struct FakeHandler {
        bus_root: PathBuf,
        devices_root: PathBuf,
        instances: HashMap<String, u32>,
        fail_parents: HashSet<String>,
    }

    impl FakeHandler {
        fn new(bus_root: &Path, devices_root: &Path, instances: &[(&str, u32)]) -> Self {
            Self {
                bus_root: bus_root.to_path_buf(),
                devices_root: devices_root.to_path_buf(),
                instances: instances.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
                fail_parents: HashSet::new(),
            }
        }
    }

    impl DeviceHandler for FakeHandler {
        fn create_mdev(&self, type_id: &str, parent: &str, uuid: &Uuid) -> Result<()> {
            if self.fail_parents.contains(parent) {
                return Err(DevletError::Internal(format!("card {} is broken", parent)));
            }
            let uuid_dir = self.devices_root.join(uuid.to_string());
            std::fs::create_dir_all(&uuid_dir).unwrap();
            let type_dir =
                self.bus_root.join(parent).join("mdev_supported_types").join(type_id);
            symlink(type_dir, uuid_dir.join("mdev_type")).unwrap();
            Ok(())
        }

        fn remove_mdev(&self, uuid: &str) -> Result<()> {
            std::fs::remove_dir_all(self.devices_root.join(uuid)).unwrap();
            Ok(())
        }

        fn read_mdev_available_instances(&self, type_id: &str, _parent: &str) -> Result<u32> {
            Ok(*self.instances.get(type_id).unwrap_or(&0))
        }

        fn chown_unprivileged(&self, _: &Path) -> Result<()> {
            Ok(())
        }

        fn relabel(&self, _: &str, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn fake_card(bus_root: &Path, parent: &str, types: &[&str]) {
        for type_id in types {
            let dir = bus_root.join(parent).join("mdev_supported_types").join(type_id);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("create"), "").unwrap();
        }
    }

    fn count_mdevs_by_type(devices_root: &Path) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(devices_root) {
            for entry in entries.flatten() {
                if let Some(type_id) = sysfs::read_link_name(&entry.path().join("mdev_type")) {
                    *counts.entry(type_id).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn manager(handler: FakeHandler, bus: &Path, devices: &Path) -> MdevTypesManager {
        MdevTypesManager::new(Arc::new(handler), bus, devices)
    }

    #[tokio::test]
    async fn test_round_robin_spreads_types_over_identical_cards() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        fake_card(bus.path(), "0000:65:00.0", &["nvidia-222", "nvidia-223"]);
        fake_card(bus.path(), "0000:66:00.0", &["nvidia-222", "nvidia-223"]);

        let handler = FakeHandler::new(
            bus.path(),
            devices.path(),
            &[("nvidia-222", 4), ("nvidia-223", 4)],
        );
        let mgr = manager(handler, bus.path(), devices.path());

        let desired = vec!["nvidia-222".to_string(), "nvidia-223".to_string()];
        let configured =
            mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();
        assert_eq!(configured, vec!["nvidia-222", "nvidia-223"]);

        // Round-robin fairness: each type ends up on one of the two cards,
        // filled to its capacity.
        let counts = count_mdevs_by_type(devices.path());
        assert_eq!(counts.get("nvidia-222"), Some(&4));
        assert_eq!(counts.get("nvidia-223"), Some(&4));
    }

    #[tokio::test]
    async fn test_removing_all_desired_types_leaves_nothing() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        fake_card(bus.path(), "0000:65:00.0", &["nvidia-222"]);

        let handler = FakeHandler::new(bus.path(), devices.path(), &[("nvidia-222", 3)]);
        let mgr = manager(handler, bus.path(), devices.path());

        let desired = vec!["nvidia-222".to_string()];
        mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();
        assert_eq!(count_mdevs_by_type(devices.path()).get("nvidia-222"), Some(&3));

        let configured =
            mgr.update_mdev_types_configuration(&[], &HashSet::new()).await.unwrap();
        assert!(configured.is_empty());
        assert!(std::fs::read_dir(devices.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_no_supporting_cards_configures_nothing() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        fake_card(bus.path(), "0000:65:00.0", &["nvidia-222"]);

        let handler = FakeHandler::new(bus.path(), devices.path(), &[("i915-GVTg_V5_4", 1)]);
        let mgr = manager(handler, bus.path(), devices.path());

        let desired = vec!["i915-GVTg_V5_4".to_string()];
        let configured =
            mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();
        assert!(configured.is_empty());
        assert!(count_mdevs_by_type(devices.path()).is_empty());
    }

    #[tokio::test]
    async fn test_more_types_than_cards_fills_the_single_card() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        let all_types = ["nvidia-222", "nvidia-223", "nvidia-224"];
        fake_card(bus.path(), "0000:65:00.0", &all_types);

        let handler = FakeHandler::new(
            bus.path(),
            devices.path(),
            &[("nvidia-222", 2), ("nvidia-223", 2), ("nvidia-224", 2)],
        );
        let mgr = manager(handler, bus.path(), devices.path());

        let desired: Vec<String> = all_types.iter().map(|t| t.to_string()).collect();
        let configured =
            mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();

        // One card can only be committed to one type; that type is filled to
        // capacity and nothing else is created.
        assert_eq!(configured.len(), 1);
        let counts = count_mdevs_by_type(devices.path());
        let total: usize = counts.values().sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_desired_display_name_matches_type() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        fake_card(bus.path(), "0000:65:00.0", &["nvidia-222"]);
        std::fs::write(
            bus.path().join("0000:65:00.0/mdev_supported_types/nvidia-222/name"),
            "GRID T4-1B\n",
        )
        .unwrap();

        let handler = FakeHandler::new(bus.path(), devices.path(), &[("nvidia-222", 2)]);
        let mgr = manager(handler, bus.path(), devices.path());

        let desired = vec!["GRID T4-1B".to_string()];
        let configured =
            mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();
        assert_eq!(configured, vec!["nvidia-222"]);
        assert_eq!(count_mdevs_by_type(devices.path()).get("nvidia-222"), Some(&2));
    }

    #[tokio::test]
    async fn test_externally_handled_mdevs_survive() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        fake_card(bus.path(), "0000:65:00.0", &["nvidia-222"]);

        let handler = FakeHandler::new(bus.path(), devices.path(), &[("nvidia-222", 2)]);
        // Pre-provision one instance, then declare it externally handled.
        let uuid = Uuid::new_v4();
        handler.create_mdev("nvidia-222", "0000:65:00.0", &uuid).unwrap();
        let mgr = manager(handler, bus.path(), devices.path());

        let externally_handled = HashSet::from([uuid.to_string()]);
        mgr.update_mdev_types_configuration(&[], &externally_handled).await.unwrap();
        assert_eq!(count_mdevs_by_type(devices.path()).get("nvidia-222"), Some(&1));
    }

    #[tokio::test]
    async fn test_one_broken_card_does_not_stall_the_rest() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        fake_card(bus.path(), "0000:65:00.0", &["nvidia-222"]);
        fake_card(bus.path(), "0000:66:00.0", &["nvidia-222"]);

        let mut handler = FakeHandler::new(bus.path(), devices.path(), &[("nvidia-222", 2)]);
        handler.fail_parents.insert("0000:65:00.0".to_string());
        let mgr = manager(handler, bus.path(), devices.path());

        let desired = vec!["nvidia-222".to_string()];
        let configured =
            mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();
        assert_eq!(configured, vec!["nvidia-222"]);
        // The working card still got its full capacity.
        assert_eq!(count_mdevs_by_type(devices.path()).get("nvidia-222"), Some(&2));
    }

    #[tokio::test]
    async fn test_total_never_exceeds_capacity_times_cards() {
        let bus = TempDir::new().unwrap();
        let devices = TempDir::new().unwrap();
        for parent in ["0000:65:00.0", "0000:66:00.0", "0000:67:00.0"] {
            fake_card(bus.path(), parent, &["nvidia-222", "nvidia-223"]);
        }

        let handler = FakeHandler::new(
            bus.path(),
            devices.path(),
            &[("nvidia-222", 4), ("nvidia-223", 8)],
        );
        let mgr = manager(handler, bus.path(), devices.path());

        let desired = vec!["nvidia-222".to_string(), "nvidia-223".to_string()];
        mgr.update_mdev_types_configuration(&desired, &HashSet::new()).await.unwrap();

        let counts = count_mdevs_by_type(devices.path());
        assert!(*counts.get("nvidia-222").unwrap_or(&0) <= 4 * 3);
        assert!(*counts.get("nvidia-223").unwrap_or(&0) <= 8 * 3);
        // Both types got cards, neither starved.
        assert!(*counts.get("nvidia-222").unwrap_or(&0) > 0);
        assert!(*counts.get("nvidia-223").unwrap_or(&0) > 0);
    }
}
