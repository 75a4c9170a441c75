//! Unified storage facade: typed access to every tracker record.
//!
//! All reads and writes of inventory, projects, navigation, priorities,
//! dependencies and preferences go through [`UnifiedStorage`]. Each mutation
//! writes through to the injected store and then emits a [`StorageEvent`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use tracker_core::{
    aggregate_requirements, clamp_quantity, shortfall, validate_project, validate_projects,
    MaterialMap, NavigationState, Project, ValidationError,
};

use crate::events::{EventBus, StorageEvent};
use crate::keys::{Component, RecordKey, INVENTORY_PREFIX};
use crate::legacy::CURRENT_GENERATION;
use crate::store::{SharedStore, StoreError};

/// Errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The stored value exists but does not decode as its record type.
    #[error("corrupt record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("project already tracked: {0}")]
    DuplicateProject(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// Untyped writes are limited to the `system:` bookkeeping records.
    #[error("not a system record: {0}")]
    NotSystemRecord(String),
}

impl StorageError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt { .. })
    }
}

/// Priority map: project name -> priority (lower first).
pub type Priorities = BTreeMap<String, u32>;
/// Dependency map: project name -> names of projects it waits on.
pub type Dependencies = BTreeMap<String, Vec<String>>;

/// Encode a record value.
pub fn encode<T: Serialize>(key: &RecordKey, value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })
}

/// Decode a record value; a failure is [`StorageError::Corrupt`].
pub fn decode<T: DeserializeOwned>(key: &RecordKey, raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|source| StorageError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// Single point of truth over the shared store.
#[derive(Clone)]
pub struct UnifiedStorage {
    store: SharedStore,
    events: EventBus,
}

impl UnifiedStorage {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            events: EventBus::new(),
        }
    }

    /// Facade publishing on an existing bus.
    pub fn with_events(store: SharedStore, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Typed read: `Ok(None)` when missing, `Err(Corrupt)` when undecodable.
    pub fn read<T: DeserializeOwned>(&self, key: &RecordKey) -> Result<Option<T>, StorageError> {
        match self.store.get(&key.to_string())? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Typed read that substitutes the default for a missing or corrupt value.
    ///
    /// Corruption is logged; store failures still propagate.
    pub fn read_or_default<T: DeserializeOwned + Default>(
        &self,
        key: &RecordKey,
    ) -> Result<T, StorageError> {
        match self.read(key) {
            Ok(v) => Ok(v.unwrap_or_default()),
            Err(e) if e.is_corrupt() => {
                warn!(key = %key, error = %e, "corrupt record treated as missing");
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn write<T: Serialize>(&self, key: &RecordKey, value: &T) -> Result<(), StorageError> {
        let raw = encode(key, value)?;
        self.store.set(&key.to_string(), &raw)?;
        Ok(())
    }

    /// Write a rollback or health bookkeeping record. Tracker data goes
    /// through the typed mutators so every change is published.
    pub fn write_system<T: Serialize>(
        &self,
        key: &RecordKey,
        value: &T,
    ) -> Result<(), StorageError> {
        if key.component() != Component::System {
            return Err(StorageError::NotSystemRecord(key.to_string()));
        }
        self.write(key, value)
    }

    fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.store.remove(&key.to_string())?;
        Ok(())
    }

    // ----- inventory -----

    /// Stored quantity, distinguishing missing from corrupt.
    pub fn material_quantity(&self, name: &str) -> Result<Option<u64>, StorageError> {
        self.read(&RecordKey::Material(name.to_string()))
    }

    /// Quantity owned; missing, corrupt or unreadable values count as zero.
    pub fn get_quantity(&self, name: &str) -> u64 {
        match self.material_quantity(name) {
            Ok(q) => q.unwrap_or(0),
            Err(e) => {
                warn!(material = name, error = %e, "quantity unreadable; using 0");
                0
            }
        }
    }

    /// Store `qty` clamped to zero and return the stored value.
    pub fn set_material_quantity(&self, name: &str, qty: i64) -> Result<u64, StorageError> {
        let key = RecordKey::Material(name.to_string());
        let new = clamp_quantity(qty);
        let old = self.read_or_default::<u64>(&key)?;
        self.write(&key, &new)?;
        debug!(material = name, old, new, "material quantity set");
        self.events.emit(&StorageEvent::MaterialChanged {
            name: name.to_string(),
            old,
            new,
        });
        Ok(new)
    }

    /// Add `delta` (possibly negative) to the stored quantity, clamping at zero.
    pub fn adjust_material(&self, name: &str, delta: i64) -> Result<u64, StorageError> {
        let current = self.read_or_default::<u64>(&RecordKey::Material(name.to_string()))?;
        let target = i64::try_from(current)
            .unwrap_or(i64::MAX)
            .saturating_add(delta);
        self.set_material_quantity(name, target)
    }

    /// Every readable material quantity. Corrupt entries are skipped with a warning.
    pub fn inventory(&self) -> Result<MaterialMap, StorageError> {
        let mut out = MaterialMap::new();
        for raw_key in self.store.keys()? {
            let Some(RecordKey::Material(name)) = RecordKey::parse(&raw_key) else {
                continue;
            };
            match self.material_quantity(&name) {
                Ok(Some(q)) => {
                    out.insert(name, q);
                }
                Ok(None) => {}
                Err(e) if e.is_corrupt() => {
                    warn!(key = %raw_key, error = %e, "skipping corrupt material record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Delete every material record. Returns how many were removed.
    ///
    /// The reset event carries the quantities that were readable beforehand.
    pub fn reset_inventory(&self) -> Result<usize, StorageError> {
        let old = self.inventory()?;
        let keys: Vec<String> = self
            .store
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(INVENTORY_PREFIX))
            .collect();
        for k in &keys {
            self.store.remove(k)?;
        }
        info!(cleared = keys.len(), materials = old.len(), "inventory reset");
        self.events.emit(&StorageEvent::InventoryReset { old });
        Ok(keys.len())
    }

    // ----- projects -----

    /// Active projects; corruption is an error.
    pub fn projects(&self) -> Result<Vec<Project>, StorageError> {
        Ok(self.read(&RecordKey::ActiveProjects)?.unwrap_or_default())
    }

    /// Active projects; corruption yields an empty list.
    pub fn active_projects(&self) -> Result<Vec<Project>, StorageError> {
        self.read_or_default(&RecordKey::ActiveProjects)
    }

    pub fn project(&self, name: &str) -> Result<Option<Project>, StorageError> {
        Ok(self.projects()?.into_iter().find(|p| p.name == name))
    }

    /// Start tracking `project`. Names are unique; the navigation list follows.
    pub fn add_project(&self, project: Project) -> Result<(), StorageError> {
        let mut projects = self.projects()?;
        projects.push(project.clone());
        match validate_projects(&projects) {
            Ok(()) => {}
            Err(ValidationError::DuplicateProject(name)) => {
                return Err(StorageError::DuplicateProject(name))
            }
            Err(e) => return Err(e.into()),
        }
        self.write(&RecordKey::ActiveProjects, &projects)?;
        info!(project = %project.name, "project added");
        self.events.emit(&StorageEvent::ProjectAdded(project.clone()));

        let old_nav = self.navigation()?;
        if !old_nav.active.contains(&project.name) {
            let mut nav = old_nav.clone();
            nav.active.push(project.name);
            self.write_navigation(old_nav, nav)?;
        }
        Ok(())
    }

    /// Stop tracking `name`, dropping it from navigation, priorities and dependencies.
    pub fn remove_project(&self, name: &str) -> Result<Project, StorageError> {
        let mut projects = self.projects()?;
        let idx = projects
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| StorageError::ProjectNotFound(name.to_string()))?;
        let removed = projects.remove(idx);
        self.write(&RecordKey::ActiveProjects, &projects)?;
        info!(project = name, "project removed");
        self.events.emit(&StorageEvent::ProjectRemoved(removed.clone()));

        let old_nav = self.navigation()?;
        let mut nav = old_nav.clone();
        nav.active.retain(|a| a != name);
        nav.breadcrumbs.retain(|b| b != name);
        if nav.current.as_deref() == Some(name) {
            nav.current = None;
        }
        if nav != old_nav {
            self.write_navigation(old_nav, nav)?;
        }

        let mut priorities = self.priorities()?;
        if let Some(old) = priorities.remove(name) {
            self.write(&RecordKey::ProjectPriorities, &priorities)?;
            self.events.emit(&StorageEvent::PriorityChanged {
                project: name.to_string(),
                old: Some(old),
                new: None,
            });
        }
        let old_deps = self.dependencies()?;
        let mut deps = old_deps.clone();
        deps.remove(name);
        for list in deps.values_mut() {
            list.retain(|d| d != name);
        }
        if deps != old_deps {
            self.write(&RecordKey::ProjectDependencies, &deps)?;
            for (project, old) in &old_deps {
                let new = deps.get(project);
                if new == Some(old) {
                    continue;
                }
                self.events.emit(&StorageEvent::DependenciesChanged {
                    project: project.clone(),
                    old: old.clone(),
                    new: new.cloned().unwrap_or_default(),
                });
            }
        }
        Ok(removed)
    }

    /// Replace the requirements of an active project.
    pub fn update_requirements(
        &self,
        name: &str,
        requirements: MaterialMap,
    ) -> Result<Project, StorageError> {
        let mut projects = self.projects()?;
        let slot = projects
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| StorageError::ProjectNotFound(name.to_string()))?;
        let old = slot.clone();
        slot.requirements = requirements;
        slot.last_updated = chrono::Utc::now();
        validate_project(slot)?;
        let new = slot.clone();
        self.write(&RecordKey::ActiveProjects, &projects)?;
        self.events.emit(&StorageEvent::ProjectUpdated {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    // ----- navigation -----

    pub fn navigation(&self) -> Result<NavigationState, StorageError> {
        Ok(NavigationState {
            current: self.read_or_default(&RecordKey::NavigationCurrent)?,
            breadcrumbs: self.read_or_default(&RecordKey::NavigationBreadcrumbs)?,
            active: self.read_or_default(&RecordKey::NavigationActive)?,
        })
    }

    /// Select a craft (or clear the selection), extending the breadcrumb trail.
    pub fn select_craft(&self, name: Option<&str>) -> Result<NavigationState, StorageError> {
        let old = self.navigation()?;
        let mut nav = old.clone();
        nav.current = name.map(str::to_string);
        if let Some(n) = name {
            if let Some(pos) = nav.breadcrumbs.iter().position(|b| b == n) {
                nav.breadcrumbs.truncate(pos + 1);
            } else {
                nav.breadcrumbs.push(n.to_string());
            }
        } else {
            nav.breadcrumbs.clear();
        }
        self.write_navigation(old, nav.clone())?;
        Ok(nav)
    }

    /// Overwrite navigation state as a whole.
    pub fn set_navigation(&self, nav: NavigationState) -> Result<(), StorageError> {
        let old = self.navigation()?;
        self.write_navigation(old, nav)
    }

    fn write_navigation(
        &self,
        old: NavigationState,
        new: NavigationState,
    ) -> Result<(), StorageError> {
        match &new.current {
            Some(c) => self.write(&RecordKey::NavigationCurrent, c)?,
            None => self.delete(&RecordKey::NavigationCurrent)?,
        }
        self.write(&RecordKey::NavigationBreadcrumbs, &new.breadcrumbs)?;
        self.write(&RecordKey::NavigationActive, &new.active)?;
        self.events.emit(&StorageEvent::NavigationChanged { old, new });
        Ok(())
    }

    // ----- priorities & dependencies -----

    pub fn priorities(&self) -> Result<Priorities, StorageError> {
        self.read_or_default(&RecordKey::ProjectPriorities)
    }

    /// Set a priority for an active project.
    pub fn set_priority(&self, project: &str, priority: u32) -> Result<(), StorageError> {
        self.require_project(project)?;
        let mut map = self.priorities()?;
        let old = map.insert(project.to_string(), priority);
        self.write(&RecordKey::ProjectPriorities, &map)?;
        self.events.emit(&StorageEvent::PriorityChanged {
            project: project.to_string(),
            old,
            new: Some(priority),
        });
        Ok(())
    }

    pub fn dependencies(&self) -> Result<Dependencies, StorageError> {
        self.read_or_default(&RecordKey::ProjectDependencies)
    }

    /// Record which active projects `project` waits on.
    pub fn set_dependencies(&self, project: &str, deps: Vec<String>) -> Result<(), StorageError> {
        self.require_project(project)?;
        for d in &deps {
            self.require_project(d)?;
        }
        let mut map = self.dependencies()?;
        let old = map.insert(project.to_string(), deps.clone()).unwrap_or_default();
        self.write(&RecordKey::ProjectDependencies, &map)?;
        self.events.emit(&StorageEvent::DependenciesChanged {
            project: project.to_string(),
            old,
            new: deps,
        });
        Ok(())
    }

    fn require_project(&self, name: &str) -> Result<(), StorageError> {
        if self.projects()?.iter().any(|p| p.name == name) {
            Ok(())
        } else {
            Err(StorageError::ProjectNotFound(name.to_string()))
        }
    }

    // ----- preferences & meta -----

    pub fn preference(&self, name: &str) -> Result<Option<Value>, StorageError> {
        self.read(&RecordKey::Preference(name.to_string()))
    }

    pub fn set_preference(&self, name: &str, value: Value) -> Result<(), StorageError> {
        let key = RecordKey::Preference(name.to_string());
        let old = self.read_or_default::<Option<Value>>(&key)?;
        self.write(&key, &value)?;
        self.events.emit(&StorageEvent::PreferenceChanged {
            name: name.to_string(),
            old,
            new: Some(value),
        });
        Ok(())
    }

    pub fn storage_version(&self) -> Result<Option<u32>, StorageError> {
        self.read(&RecordKey::StorageVersion)
    }

    /// Stamp the store with the current generation.
    pub fn mark_current(&self) -> Result<(), StorageError> {
        self.write(&RecordKey::StorageVersion, &CURRENT_GENERATION.version())
    }

    // ----- derived views -----

    /// Total materials needed across every active project.
    pub fn aggregate_requirements(&self) -> Result<MaterialMap, StorageError> {
        Ok(aggregate_requirements(&self.active_projects()?))
    }

    /// Materials still missing for every active project.
    pub fn shortfall(&self) -> Result<MaterialMap, StorageError> {
        let totals = self.aggregate_requirements()?;
        Ok(shortfall(&totals, &self.inventory()?))
    }
}
