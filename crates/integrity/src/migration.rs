//! Storage migration guarded by a rollback point and a validation floor.

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};

use persistence::legacy::census;
use persistence::{
    detect_generation, migrate_to_current, MigrationError, RecordKey, SharedStore, StepReport,
    StorageGeneration, StoreError, CURRENT_GENERATION,
};
use tracker_core::TrackerConfig;

use crate::rollback::{RollbackError, RollbackManager, RollbackOptions, RollbackStrategy};
use crate::validator::{check_migration_preservation, MigrationValidator, ValidationReport};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Rollback(#[from] RollbackError),
    /// The migration was undone by restoring `checkpoint`.
    #[error("migration rolled back to {checkpoint}: {reason}")]
    RolledBack {
        checkpoint: String,
        reason: String,
        validation: Option<Box<ValidationReport>>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MigrationOutcome {
    /// Generation found before migrating; `None` for an empty store.
    pub from: Option<StorageGeneration>,
    pub steps: Vec<StepReport>,
    /// Rollback point created before the first step.
    pub checkpoint: Option<String>,
    pub validation: Option<ValidationReport>,
}

impl MigrationOutcome {
    pub fn migrated(&self) -> bool {
        !self.steps.is_empty()
    }
}

pub struct MigrationRunner {
    store: SharedStore,
    rollback: RollbackManager,
    validator: MigrationValidator,
    min_score: f64,
}

impl MigrationRunner {
    pub fn new(store: SharedStore, config: &TrackerConfig) -> Self {
        Self {
            rollback: RollbackManager::new(
                store.clone(),
                config.rollback.clone(),
                config.validation.clone(),
            ),
            validator: MigrationValidator::new(store.clone(), config.validation.clone()),
            min_score: config.validation.migration_min_score,
            store,
        }
    }

    /// Use an existing manager so restores publish on its event bus.
    pub fn with_rollback(mut self, rollback: RollbackManager) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn run(&self) -> Result<MigrationOutcome, GuardError> {
        let store = &*self.store;
        let from = detect_generation(store)?;
        let needs_steps = from.map_or(false, |g| g < CURRENT_GENERATION);
        if !needs_steps {
            migrate_to_current(store)?;
            return Ok(MigrationOutcome {
                from,
                steps: Vec::new(),
                checkpoint: None,
                validation: None,
            });
        }
        let version = from.map(StorageGeneration::version).unwrap_or_default();

        let before = census(store)?;
        let checkpoint = self.checkpoint_name(version)?;
        self.rollback
            .create_point(&checkpoint, Some("automatic checkpoint before storage migration"))?;
        info!(from = version, %checkpoint, "storage migration started");

        let steps = match migrate_to_current(store) {
            Ok(steps) => steps,
            Err(e) => return Err(self.undo(&checkpoint, e.to_string(), None)),
        };

        let after = census(store)?;
        let mut report = self.validator.validate()?;
        report.push(check_migration_preservation(&before, &after));
        if report.score < self.min_score {
            let reason = format!(
                "validation score {:.1} below {:.1}",
                report.score, self.min_score
            );
            return Err(self.undo(&checkpoint, reason, Some(report)));
        }

        info!(
            from = version,
            to = CURRENT_GENERATION.version(),
            score = report.score,
            "storage migration complete"
        );
        Ok(MigrationOutcome {
            from,
            steps,
            checkpoint: Some(checkpoint),
            validation: Some(report),
        })
    }

    fn checkpoint_name(&self, version: u32) -> Result<String, StoreError> {
        let name = format!("pre-migration-v{version}");
        let taken = self
            .store
            .get(&RecordKey::RollbackPoint(name.clone()).to_string())?
            .is_some();
        Ok(if taken {
            format!("{name}-{}", Utc::now().timestamp_millis())
        } else {
            name
        })
    }

    fn undo(
        &self,
        checkpoint: &str,
        reason: String,
        validation: Option<ValidationReport>,
    ) -> GuardError {
        error!(%checkpoint, %reason, "storage migration failed, rolling back");
        match self
            .rollback
            .rollback(checkpoint, RollbackStrategy::Complete, RollbackOptions::default())
        {
            Ok(_) => GuardError::RolledBack {
                checkpoint: checkpoint.to_string(),
                reason,
                validation: validation.map(Box::new),
            },
            Err(e) => GuardError::Rollback(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::{KeyValueStore, MemoryStore, UnifiedStorage};
    use std::sync::Arc;
    use tracker_core::{MaterialMap, Project};

    fn flat_store() -> MemoryStore {
        let projects = serde_json::to_string(&vec![Project::new("Brig", "ship", MaterialMap::new())])
            .unwrap();
        MemoryStore::from_entries([
            ("material_Plywood".to_string(), "10".to_string()),
            ("activeProjects".to_string(), projects),
            ("activeCrafts".to_string(), "[\"Brig\"]".to_string()),
            ("currentCraft".to_string(), "Brig".to_string()),
        ])
    }

    #[test]
    fn flat_store_migrates_behind_a_checkpoint() {
        let mem = flat_store();
        let shared: SharedStore = Arc::new(mem.clone());
        let outcome = MigrationRunner::new(shared.clone(), &TrackerConfig::default())
            .run()
            .unwrap();
        assert_eq!(outcome.from, Some(StorageGeneration::Flat));
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.checkpoint.as_deref(), Some("pre-migration-v1"));
        let report = outcome.validation.unwrap();
        assert!(report.score >= 80.0, "{report:?}");

        let storage = UnifiedStorage::new(shared);
        assert_eq!(storage.get_quantity("Plywood"), 10);
        assert_eq!(storage.navigation().unwrap().current.as_deref(), Some("Brig"));
        assert!(mem.get("system:rollback:pre-migration-v1").unwrap().is_some());
    }

    #[test]
    fn low_score_rolls_back_to_legacy_layout() {
        let mem = flat_store();
        let mut config = TrackerConfig::default();
        config.validation.migration_min_score = 101.0;
        let err = MigrationRunner::new(Arc::new(mem.clone()), &config)
            .run()
            .unwrap_err();
        match err {
            GuardError::RolledBack {
                checkpoint,
                validation,
                ..
            } => {
                assert_eq!(checkpoint, "pre-migration-v1");
                assert!(validation.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mem.get("material_Plywood").unwrap().as_deref(), Some("10"));
        assert!(mem.get("inventory:Plywood").unwrap().is_none());
        assert!(mem.get("meta:storage_version").unwrap().is_none());
    }

    #[test]
    fn quantity_set_before_migrating_keeps_legacy_data_reachable() {
        let projects = serde_json::to_string(&vec![Project::new("Brig", "ship", MaterialMap::new())])
            .unwrap();
        let mem = MemoryStore::from_entries([
            ("material_Iron".to_string(), "3".to_string()),
            ("activeProjects".to_string(), projects),
            ("activeCrafts".to_string(), "[\"Brig\"]".to_string()),
        ]);
        let shared: SharedStore = Arc::new(mem.clone());
        let storage = UnifiedStorage::new(shared.clone());
        storage.set_material_quantity("Plywood", 5).unwrap();

        let outcome = MigrationRunner::new(shared, &TrackerConfig::default())
            .run()
            .unwrap();
        assert!(outcome.migrated());
        assert_eq!(outcome.from, Some(StorageGeneration::Flat));
        assert_eq!(storage.get_quantity("Iron"), 3);
        assert_eq!(storage.get_quantity("Plywood"), 5);
        assert_eq!(storage.projects().unwrap().len(), 1);
        assert!(mem.get("material_Iron").unwrap().is_none());
    }

    #[test]
    fn conflicting_legacy_value_rolls_back() {
        let mem = flat_store();
        let shared: SharedStore = Arc::new(mem.clone());
        UnifiedStorage::new(shared.clone())
            .set_material_quantity("Plywood", 4)
            .unwrap();
        let err = MigrationRunner::new(shared, &TrackerConfig::default())
            .run()
            .unwrap_err();
        match err {
            GuardError::RolledBack { reason, .. } => assert!(reason.contains("inventory_Plywood")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mem.get("material_Plywood").unwrap().as_deref(), Some("10"));
        assert_eq!(mem.get("inventory:Plywood").unwrap().as_deref(), Some("4"));
        assert!(mem.get("meta:storage_version").unwrap().is_none());
    }

    #[test]
    fn current_store_needs_no_checkpoint() {
        let mem = MemoryStore::new();
        let runner = MigrationRunner::new(Arc::new(mem.clone()), &TrackerConfig::default());
        let outcome = runner.run().unwrap();
        assert!(!outcome.migrated());
        assert!(outcome.checkpoint.is_none());
        assert_eq!(mem.get("meta:storage_version").unwrap().as_deref(), Some("3"));
        assert!(!runner.run().unwrap().migrated());
    }

    #[test]
    fn existing_checkpoint_name_gets_a_suffix() {
        let mem = flat_store();
        mem.set("system:rollback:pre-migration-v1", "{}").unwrap();
        let outcome = MigrationRunner::new(Arc::new(mem), &TrackerConfig::default())
            .run()
            .unwrap();
        let name = outcome.checkpoint.unwrap();
        assert!(name.starts_with("pre-migration-v1-"), "{name}");
    }
}
