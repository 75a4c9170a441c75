//! Earlier storage generations and the steps that migrate them forward.
//!
//! Generation 1 kept flat top-level keys, generation 2 namespaced them per
//! component, generation 3 is the unified schema in [`crate::keys`]. A step
//! copies each value to its new key, then deletes the old one. Values that do
//! not decode are left in place and reported; a step never aborts on them.
//! A decodable value whose target key is already taken is a conflict: the
//! step stops without bumping the version so no data is stranded behind it.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use tracker_core::{MaterialMap, Project};

use crate::keys::{Component, RecordKey, INVENTORY_PREFIX, PROJECTS_PREFIX};
use crate::store::{KeyValueStore, StoreError};

pub const FLAT_MATERIAL_PREFIX: &str = "material_";
pub const FLAT_PROJECTS: &str = "activeProjects";
pub const FLAT_ACTIVE_CRAFTS: &str = "activeCrafts";
pub const FLAT_CURRENT_CRAFT: &str = "currentCraft";
pub const FLAT_HISTORY: &str = "craftHistory";

pub const NS_MATERIAL_PREFIX: &str = "inventory_";
pub const NS_PROJECTS: &str = "craftTracker_projects";
pub const NS_PRIORITIES: &str = "craftTracker_priorities";
pub const NS_DEPENDENCIES: &str = "craftTracker_dependencies";
pub const NS_NAV_ACTIVE: &str = "craftNavigation_active";
pub const NS_NAV_CURRENT: &str = "craftNavigation_current";
pub const NS_NAV_BREADCRUMBS: &str = "craftNavigation_breadcrumbs";

const NS_TRACKER_PREFIX: &str = "craftTracker_";
const NS_NAVIGATION_PREFIX: &str = "craftNavigation_";

/// Storage layout generations, oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageGeneration {
    Flat = 1,
    Namespaced = 2,
    Unified = 3,
}

pub const CURRENT_GENERATION: StorageGeneration = StorageGeneration::Unified;

impl StorageGeneration {
    pub fn from_version(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Flat),
            2 => Some(Self::Namespaced),
            3 => Some(Self::Unified),
            _ => None,
        }
    }

    pub fn version(self) -> u32 {
        self as u32
    }

    fn next(self) -> Option<Self> {
        Self::from_version(self.version() + 1)
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unsupported storage version {0}")]
    UnknownVersion(u32),
    #[error("storage version record is corrupt: {0}")]
    CorruptVersion(String),
    /// Legacy values whose unified key already holds data.
    #[error("migration from version {from} blocked: {} legacy key(s) collide with existing data ({})", .keys.len(), .keys.join(", "))]
    Conflict { from: u32, keys: Vec<String> },
}

/// Outcome of a single generation step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub from: u32,
    pub to: u32,
    /// Keys moved to their new location.
    pub moved: usize,
    /// Old keys left in place because their value did not decode.
    pub skipped: Vec<String>,
}

/// Whether `raw` belongs to generation 1 or 2.
pub fn is_legacy_key(raw: &str) -> bool {
    raw.starts_with(FLAT_MATERIAL_PREFIX)
        || raw.starts_with(NS_MATERIAL_PREFIX)
        || raw.starts_with(NS_TRACKER_PREFIX)
        || raw.starts_with(NS_NAVIGATION_PREFIX)
        || matches!(
            raw,
            FLAT_PROJECTS | FLAT_ACTIVE_CRAFTS | FLAT_CURRENT_CRAFT | FLAT_HISTORY
        )
}

fn is_flat_key(raw: &str) -> bool {
    raw.starts_with(FLAT_MATERIAL_PREFIX)
        || matches!(
            raw,
            FLAT_PROJECTS | FLAT_ACTIVE_CRAFTS | FLAT_CURRENT_CRAFT | FLAT_HISTORY
        )
}

/// Component a legacy key maps to.
pub fn component_of(raw: &str) -> Option<Component> {
    if raw.starts_with(FLAT_MATERIAL_PREFIX) || raw.starts_with(NS_MATERIAL_PREFIX) {
        Some(Component::Inventory)
    } else if raw == FLAT_PROJECTS || raw.starts_with(NS_TRACKER_PREFIX) {
        Some(Component::Projects)
    } else if matches!(raw, FLAT_ACTIVE_CRAFTS | FLAT_CURRENT_CRAFT | FLAT_HISTORY)
        || raw.starts_with(NS_NAVIGATION_PREFIX)
    {
        Some(Component::Navigation)
    } else {
        None
    }
}

/// Generation of the data in `store`; `None` when it holds no tracker data.
pub fn detect_generation(
    store: &dyn KeyValueStore,
) -> Result<Option<StorageGeneration>, MigrationError> {
    let version_key = RecordKey::StorageVersion.to_string();
    if let Some(raw) = store.get(&version_key)? {
        let v: u32 = serde_json::from_str(&raw)
            .map_err(|_| MigrationError::CorruptVersion(raw.clone()))?;
        return StorageGeneration::from_version(v)
            .map(Some)
            .ok_or(MigrationError::UnknownVersion(v));
    }
    // Without a recorded version the oldest layout present wins, so unified
    // keys written before a migration never hide legacy data.
    let keys = store.keys()?;
    let mut found = None;
    for key in &keys {
        let generation = if is_flat_key(key) {
            StorageGeneration::Flat
        } else if is_legacy_key(key) {
            StorageGeneration::Namespaced
        } else if key.starts_with(INVENTORY_PREFIX) || key.starts_with(PROJECTS_PREFIX) {
            StorageGeneration::Unified
        } else {
            continue;
        };
        found = Some(found.map_or(generation, |g: StorageGeneration| g.min(generation)));
    }
    Ok(found)
}

/// Apply the single step out of `from`.
pub fn migrate_step(
    store: &dyn KeyValueStore,
    from: StorageGeneration,
) -> Result<StepReport, MigrationError> {
    let Some(to) = from.next() else {
        return Ok(StepReport {
            from: from.version(),
            to: from.version(),
            ..StepReport::default()
        });
    };
    let mut mover = Mover::new(store, from, to);
    match from {
        StorageGeneration::Flat => {
            mover.prefixed::<u64>(FLAT_MATERIAL_PREFIX, |n| format!("{NS_MATERIAL_PREFIX}{n}"))?;
            mover.exact::<Vec<Project>>(FLAT_PROJECTS, NS_PROJECTS)?;
            mover.exact::<Vec<String>>(FLAT_ACTIVE_CRAFTS, NS_NAV_ACTIVE)?;
            mover.current_craft(FLAT_CURRENT_CRAFT, NS_NAV_CURRENT)?;
            mover.exact::<Vec<String>>(FLAT_HISTORY, NS_NAV_BREADCRUMBS)?;
        }
        StorageGeneration::Namespaced => {
            mover.prefixed::<u64>(NS_MATERIAL_PREFIX, |n| {
                RecordKey::Material(n.to_string()).to_string()
            })?;
            mover.exact::<Vec<Project>>(NS_PROJECTS, &RecordKey::ActiveProjects.to_string())?;
            mover.exact::<BTreeMap<String, u32>>(
                NS_PRIORITIES,
                &RecordKey::ProjectPriorities.to_string(),
            )?;
            mover.exact::<BTreeMap<String, Vec<String>>>(
                NS_DEPENDENCIES,
                &RecordKey::ProjectDependencies.to_string(),
            )?;
            mover.exact::<Vec<String>>(NS_NAV_ACTIVE, &RecordKey::NavigationActive.to_string())?;
            mover.current_craft(NS_NAV_CURRENT, &RecordKey::NavigationCurrent.to_string())?;
            mover.exact::<Vec<String>>(
                NS_NAV_BREADCRUMBS,
                &RecordKey::NavigationBreadcrumbs.to_string(),
            )?;
        }
        StorageGeneration::Unified => {}
    }
    if !mover.conflicts.is_empty() {
        let keys = std::mem::take(&mut mover.conflicts);
        warn!(from = from.version(), conflicts = keys.len(), "storage migration blocked");
        return Err(MigrationError::Conflict {
            from: from.version(),
            keys,
        });
    }
    store.set(&RecordKey::StorageVersion.to_string(), &to.version().to_string())?;
    let report = mover.finish();
    info!(
        from = report.from,
        to = report.to,
        moved = report.moved,
        skipped = report.skipped.len(),
        "storage generation migrated"
    );
    Ok(report)
}

/// Apply steps until the store reaches [`CURRENT_GENERATION`].
///
/// An empty store is stamped as current without any step. A step that meets
/// a [`MigrationError::Conflict`] returns it before stamping its version.
pub fn migrate_to_current(store: &dyn KeyValueStore) -> Result<Vec<StepReport>, MigrationError> {
    let mut reports = Vec::new();
    let Some(mut generation) = detect_generation(store)? else {
        store.set(
            &RecordKey::StorageVersion.to_string(),
            &CURRENT_GENERATION.version().to_string(),
        )?;
        return Ok(reports);
    };
    while generation < CURRENT_GENERATION {
        let report = migrate_step(store, generation)?;
        generation = StorageGeneration::from_version(report.to)
            .ok_or(MigrationError::UnknownVersion(report.to))?;
        reports.push(report);
    }
    if store.get(&RecordKey::StorageVersion.to_string())?.is_none() {
        store.set(
            &RecordKey::StorageVersion.to_string(),
            &CURRENT_GENERATION.version().to_string(),
        )?;
    }
    Ok(reports)
}

/// Sum of material quantities and project names in any generation's layout.
///
/// Used to compare data before and after a migration.
pub fn census(store: &dyn KeyValueStore) -> Result<(MaterialMap, Vec<String>), StoreError> {
    let mut materials = MaterialMap::new();
    let mut projects = Vec::new();
    for key in store.keys()? {
        let name = key
            .strip_prefix(INVENTORY_PREFIX)
            .or_else(|| key.strip_prefix(NS_MATERIAL_PREFIX))
            .or_else(|| key.strip_prefix(FLAT_MATERIAL_PREFIX));
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if let Some(q) = store.get(&key)?.and_then(|raw| raw.trim().parse::<u64>().ok()) {
                *materials.entry(name.to_string()).or_insert(0) += q;
            }
            continue;
        }
        let is_project_list = key == FLAT_PROJECTS
            || key == NS_PROJECTS
            || RecordKey::parse(&key) == Some(RecordKey::ActiveProjects);
        if is_project_list {
            if let Some(list) = store
                .get(&key)?
                .and_then(|raw| serde_json::from_str::<Vec<Project>>(&raw).ok())
            {
                projects.extend(list.into_iter().map(|p| p.name));
            }
        }
    }
    projects.sort();
    projects.dedup();
    Ok((materials, projects))
}

struct Mover<'a> {
    store: &'a dyn KeyValueStore,
    report: StepReport,
    /// Old keys whose target already holds different data.
    conflicts: Vec<String>,
}

impl<'a> Mover<'a> {
    fn new(store: &'a dyn KeyValueStore, from: StorageGeneration, to: StorageGeneration) -> Self {
        Self {
            store,
            report: StepReport {
                from: from.version(),
                to: to.version(),
                ..StepReport::default()
            },
            conflicts: Vec::new(),
        }
    }

    fn exact<T: DeserializeOwned + Serialize>(
        &mut self,
        old: &str,
        new: &str,
    ) -> Result<(), StoreError> {
        let Some(raw) = self.store.get(old)? else {
            return Ok(());
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(_) => self.relocate(old, new, &raw),
            Err(e) => {
                warn!(key = old, error = %e, "legacy value does not decode; left in place");
                self.report.skipped.push(old.to_string());
                Ok(())
            }
        }
    }

    fn prefixed<T: DeserializeOwned + Serialize>(
        &mut self,
        prefix: &str,
        new_key: impl Fn(&str) -> String,
    ) -> Result<(), StoreError> {
        let keys: Vec<String> = self
            .store
            .keys()?
            .into_iter()
            .filter(|k| k.len() > prefix.len() && k.starts_with(prefix))
            .collect();
        for old in keys {
            let new = new_key(&old[prefix.len()..]);
            self.exact::<T>(&old, &new)?;
        }
        Ok(())
    }

    /// Old layouts sometimes stored the current craft as bare text instead of JSON.
    fn current_craft(&mut self, old: &str, new: &str) -> Result<(), StoreError> {
        let Some(raw) = self.store.get(old)? else {
            return Ok(());
        };
        let value = match serde_json::from_str::<Option<String>>(&raw) {
            Ok(v) => v,
            Err(_) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
            Err(_) => None,
        };
        let encoded = serde_json::to_string(&value.map(Value::String).unwrap_or(Value::Null))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.relocate(old, new, &encoded)
    }

    fn relocate(&mut self, old: &str, new: &str, value: &str) -> Result<(), StoreError> {
        match self.store.get(new)? {
            // Same value already migrated; only the old copy is left to drop.
            Some(existing) if existing == value => {
                self.store.remove(old)?;
                self.report.moved += 1;
                return Ok(());
            }
            Some(_) => {
                warn!(old, new, "migration target already holds different data");
                self.conflicts.push(old.to_string());
                return Ok(());
            }
            None => {}
        }
        self.store.set(new, value)?;
        self.store.remove(old)?;
        self.report.moved += 1;
        Ok(())
    }

    fn finish(self) -> StepReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn flat_store() -> MemoryStore {
        let projects = serde_json::to_string(&vec![Project::new(
            "Brig",
            "ship",
            [("Plywood".to_string(), 10)].into_iter().collect(),
        )])
        .unwrap();
        MemoryStore::from_entries([
            ("material_Plywood", "7".to_string()),
            ("material_Iron", "3".to_string()),
            ("activeProjects", projects),
            ("activeCrafts", "[\"Brig\"]".to_string()),
            ("currentCraft", "Brig".to_string()),
            ("craftHistory", "[\"Brig\"]".to_string()),
        ])
    }

    #[test]
    fn detects_each_generation() {
        assert_eq!(detect_generation(&MemoryStore::new()).unwrap(), None);
        assert_eq!(
            detect_generation(&flat_store()).unwrap(),
            Some(StorageGeneration::Flat)
        );
        let ns = MemoryStore::from_entries([("inventory_Plywood", "1")]);
        assert_eq!(
            detect_generation(&ns).unwrap(),
            Some(StorageGeneration::Namespaced)
        );
        let unified = MemoryStore::from_entries([("inventory:Plywood", "1")]);
        assert_eq!(
            detect_generation(&unified).unwrap(),
            Some(StorageGeneration::Unified)
        );
        let bad = MemoryStore::from_entries([("meta:storage_version", "9")]);
        assert!(matches!(
            detect_generation(&bad),
            Err(MigrationError::UnknownVersion(9))
        ));
    }

    #[test]
    fn flat_store_reaches_unified_without_loss() {
        let store = flat_store();
        let before = census(&store).unwrap();
        let reports = migrate_to_current(&store).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.skipped.is_empty()));
        assert_eq!(census(&store).unwrap(), before);
        assert_eq!(store.get("inventory:Plywood").unwrap().as_deref(), Some("7"));
        assert_eq!(
            store.get("navigation:current").unwrap().as_deref(),
            Some("\"Brig\"")
        );
        assert!(store.keys().unwrap().iter().all(|k| !is_legacy_key(k)));
        assert_eq!(
            detect_generation(&store).unwrap(),
            Some(StorageGeneration::Unified)
        );
    }

    #[test]
    fn undecodable_values_are_left_and_reported() {
        let store = MemoryStore::from_entries([
            ("inventory_Plywood", "lots"),
            ("craftTracker_projects", "{broken"),
        ]);
        let report = migrate_step(&store, StorageGeneration::Namespaced).unwrap();
        assert_eq!(report.moved, 0);
        assert_eq!(report.skipped.len(), 2);
        assert!(store.get("inventory_Plywood").unwrap().is_some());
        assert_eq!(store.get("meta:storage_version").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn unified_writes_do_not_hide_legacy_data() {
        let store = flat_store();
        store.set("inventory:Resin", "5").unwrap();
        assert_eq!(
            detect_generation(&store).unwrap(),
            Some(StorageGeneration::Flat)
        );
        migrate_to_current(&store).unwrap();
        assert_eq!(store.get("inventory:Iron").unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("inventory:Resin").unwrap().as_deref(), Some("5"));
        assert!(store.get("projects:active").unwrap().is_some());
        assert!(store.keys().unwrap().iter().all(|k| !is_legacy_key(k)));
    }

    #[test]
    fn conflicting_target_blocks_the_step() {
        let store = MemoryStore::from_entries([
            ("inventory_Plywood", "7"),
            ("inventory_Iron", "2"),
            ("inventory:Plywood", "5"),
        ]);
        let err = migrate_to_current(&store).unwrap_err();
        assert!(matches!(
            &err,
            MigrationError::Conflict { from: 2, keys } if keys == &["inventory_Plywood".to_string()]
        ));
        assert_eq!(store.get("inventory_Plywood").unwrap().as_deref(), Some("7"));
        assert!(store.get("meta:storage_version").unwrap().is_none());
        assert_eq!(
            detect_generation(&store).unwrap(),
            Some(StorageGeneration::Namespaced)
        );
    }

    #[test]
    fn identical_target_absorbs_the_legacy_copy() {
        let store = MemoryStore::from_entries([("inventory_Plywood", "7"), ("inventory:Plywood", "7")]);
        let reports = migrate_to_current(&store).unwrap();
        assert_eq!(reports[0].moved, 1);
        assert!(store.get("inventory_Plywood").unwrap().is_none());
        assert_eq!(store.get("inventory:Plywood").unwrap().as_deref(), Some("7"));
    }

    #[test]
    fn empty_store_is_stamped_current() {
        let store = MemoryStore::new();
        assert!(migrate_to_current(&store).unwrap().is_empty());
        assert_eq!(store.get("meta:storage_version").unwrap().as_deref(), Some("3"));
    }
}
