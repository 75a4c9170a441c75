//! Named rollback points, emergency backups and restore strategies.
//!
//! A rollback point is an immutable snapshot of every key outside the
//! manager's own bookkeeping. Restores run through a small state machine:
//!
//! ```text
//! requested -> checkpoint-before -> clearing -> restoring -> verifying -> success
//!                                       \___________\____________\-> failed -> emergency-recovery
//! ```
//!
//! Emergency recovery tries the latest emergency backup, then the latest
//! rollback point, then a factory reset. Only exhausting that chain is
//! returned as an error.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use persistence::keys::{is_preference_key, is_rollback_storage};
use persistence::snapshot::{capture, diff};
use persistence::{
    is_application_key, Component, EventBus, RecordKey, SharedStore, SnapshotDiff, StorageError,
    StorageEvent, StoreError, StoreSnapshot, UnifiedStorage,
};
use tracker_core::{RollbackConfig, ValidationConfig};

use crate::validator::{MigrationValidator, ValidationReport};

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("rollback point not found: {0}")]
    PointNotFound(String),
    #[error("rollback point already exists: {0}")]
    PointExists(String),
    #[error("invalid rollback point name: {0:?}")]
    InvalidName(String),
    #[error("unknown rollback strategy: {0}")]
    InvalidStrategy(String),
    /// The pre-rollback checkpoint could not be written; nothing was changed.
    #[error("pre-rollback checkpoint failed: {0}")]
    CheckpointFailed(String),
    #[error("restored data does not match the snapshot: {} key(s) differ", .mismatched.len())]
    VerificationFailed { mismatched: Vec<String> },
    /// Every recovery source failed. Storage state is unknown.
    #[error("emergency recovery exhausted after {cause}: {last}")]
    RecoveryExhausted { cause: String, last: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStrategy {
    /// Wipe every snapshot-scope key and restore the point verbatim.
    Complete,
    /// Restore only keys owned by the listed components.
    Selective(Vec<Component>),
    /// Restore everything except preferences.
    DataOnly,
    /// Ignore the named point and run the emergency recovery chain.
    Emergency,
}

impl RollbackStrategy {
    /// Build a strategy from its CLI name.
    pub fn parse(name: &str, components: &[Component]) -> Result<Self, RollbackError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(Self::Complete),
            "selective" if !components.is_empty() => Ok(Self::Selective(components.to_vec())),
            "selective" => Err(RollbackError::InvalidStrategy(
                "selective requires at least one component".into(),
            )),
            "data-only" | "data" => Ok(Self::DataOnly),
            "emergency" => Ok(Self::Emergency),
            other => Err(RollbackError::InvalidStrategy(other.to_string())),
        }
    }

    fn includes(&self, key: &str) -> bool {
        in_snapshot_scope(key)
            && match self {
                Self::Complete | Self::Emergency => true,
                Self::Selective(components) => components.iter().any(|c| c.owns(key)),
                Self::DataOnly => !is_preference_key(key),
            }
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("complete"),
            Self::Selective(components) => {
                let names: Vec<&str> = components.iter().map(Component::as_str).collect();
                write!(f, "selective({})", names.join(","))
            }
            Self::DataOnly => f.write_str("data-only"),
            Self::Emergency => f.write_str("emergency"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointMetadata {
    pub description: Option<String>,
    pub key_count: usize,
    pub size_bytes: u64,
    pub storage_version: Option<u32>,
}

/// Named immutable snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot: StoreSnapshot,
    /// Validation run at creation; absent when it could not run.
    pub validation: Option<ValidationReport>,
    pub metadata: PointMetadata,
}

/// Listing entry; does not carry the snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointSummary {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub key_count: usize,
    pub size_bytes: u64,
    pub validation_score: Option<f64>,
}

/// Which keys an emergency backup holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupScope {
    /// Only the critical keys; restoring leaves every other key alone.
    #[default]
    Critical,
    /// Every snapshot-scope key, taken before a rollback.
    Full,
}

impl BackupScope {
    fn includes(self, key: &str) -> bool {
        match self {
            Self::Critical => is_critical_key(key),
            Self::Full => in_snapshot_scope(key),
        }
    }
}

/// Snapshot of the critical keys, or of the whole store before a rollback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyBackup {
    pub id: String,
    /// Increases with every backup, across evictions.
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub scope: BackupScope,
    pub entries: StoreSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPhase {
    Requested,
    CheckpointBefore,
    Clearing,
    Restoring,
    Verifying,
    Success,
    Failed,
    EmergencyRecovery,
}

/// Where emergency recovery restored data from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "id")]
pub enum RecoverySource {
    EmergencyBackup(String),
    RollbackPoint(String),
    FactoryReset,
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmergencyBackup(id) => write!(f, "emergency backup {id}"),
            Self::RollbackPoint(name) => write!(f, "rollback point {name}"),
            Self::FactoryReset => f.write_str("factory reset"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum RollbackOutcome {
    Pending,
    Success,
    /// The requested restore failed and recovery restored `source` instead.
    Recovered { source: RecoverySource, error: String },
}

/// Audit entry for one rollback attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub point: String,
    pub strategy: RollbackStrategy,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<RollbackPhase>,
    /// Emergency backup taken before the restore.
    pub checkpoint: Option<String>,
    pub restored_keys: usize,
    pub outcome: RollbackOutcome,
}

impl RollbackRecord {
    fn new(point: &str, strategy: RollbackStrategy) -> Self {
        Self {
            point: point.to_string(),
            strategy,
            started_at: Utc::now(),
            finished_at: None,
            phases: vec![RollbackPhase::Requested],
            checkpoint: None,
            restored_keys: 0,
            outcome: RollbackOutcome::Pending,
        }
    }

    fn enter(&mut self, phase: RollbackPhase) {
        self.phases.push(phase);
    }

    pub fn phase(&self) -> RollbackPhase {
        self.phases.last().copied().unwrap_or(RollbackPhase::Requested)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RollbackOutcome::Success
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Do not take an emergency backup before restoring.
    pub skip_checkpoint: bool,
}

/// Keys a rollback point captures.
pub fn in_snapshot_scope(key: &str) -> bool {
    !is_rollback_storage(key) && RecordKey::parse(key) != Some(RecordKey::HealthCanary)
}

/// Keys an emergency backup captures.
pub fn is_critical_key(key: &str) -> bool {
    matches!(
        RecordKey::parse(key),
        Some(
            RecordKey::Material(_)
                | RecordKey::ActiveProjects
                | RecordKey::NavigationActive
                | RecordKey::NavigationCurrent
                | RecordKey::NavigationBreadcrumbs
                | RecordKey::StorageVersion
        )
    )
}

#[derive(Clone)]
pub struct RollbackManager {
    store: SharedStore,
    storage: UnifiedStorage,
    validator: MigrationValidator,
    config: RollbackConfig,
}

impl RollbackManager {
    pub fn new(store: SharedStore, config: RollbackConfig, validation: ValidationConfig) -> Self {
        Self {
            validator: MigrationValidator::new(store.clone(), validation),
            storage: UnifiedStorage::new(store.clone()),
            store,
            config,
        }
    }

    /// Publish restore events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.storage = UnifiedStorage::with_events(self.store.clone(), events);
        self
    }

    fn store(&self) -> &SharedStore {
        &self.store
    }

    // ----- rollback points -----

    pub fn create_point(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<RollbackPoint, RollbackError> {
        let name = name.trim();
        if name.is_empty() || name.contains(':') {
            return Err(RollbackError::InvalidName(name.to_string()));
        }
        let key = RecordKey::RollbackPoint(name.to_string());
        if self.store().get(&key.to_string())?.is_some() {
            return Err(RollbackError::PointExists(name.to_string()));
        }
        let snapshot = capture(&**self.store(), in_snapshot_scope)?;
        let validation = match self.validator.validate() {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(point = name, error = %e, "validation skipped for rollback point");
                None
            }
        };
        let point = RollbackPoint {
            name: name.to_string(),
            timestamp: Utc::now(),
            metadata: PointMetadata {
                description: description.map(str::to_string),
                key_count: snapshot.len(),
                size_bytes: snapshot.values().map(|e| e.size).sum(),
                storage_version: self.storage.storage_version().ok().flatten(),
            },
            snapshot,
            validation,
        };
        self.storage.write_system(&key, &point)?;
        info!(
            point = name,
            keys = point.metadata.key_count,
            bytes = point.metadata.size_bytes,
            "rollback point created"
        );
        Ok(point)
    }

    pub fn load_point(&self, name: &str) -> Result<RollbackPoint, RollbackError> {
        self.storage
            .read(&RecordKey::RollbackPoint(name.to_string()))?
            .ok_or_else(|| RollbackError::PointNotFound(name.to_string()))
    }

    /// Every readable point, oldest first. Corrupt points are logged and skipped.
    pub fn list_points(&self) -> Result<Vec<PointSummary>, RollbackError> {
        let mut out: Vec<PointSummary> = self
            .points()?
            .into_iter()
            .map(|p| PointSummary {
                name: p.name,
                timestamp: p.timestamp,
                key_count: p.metadata.key_count,
                size_bytes: p.metadata.size_bytes,
                validation_score: p.validation.map(|v| v.score),
            })
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    pub fn latest_point(&self) -> Result<Option<RollbackPoint>, RollbackError> {
        Ok(self.points()?.into_iter().max_by_key(|p| p.timestamp))
    }

    fn points(&self) -> Result<Vec<RollbackPoint>, RollbackError> {
        let mut points = Vec::new();
        for raw in self.store().keys()? {
            let Some(key @ RecordKey::RollbackPoint(_)) = RecordKey::parse(&raw) else {
                continue;
            };
            match self.storage.read::<RollbackPoint>(&key) {
                Ok(Some(p)) => points.push(p),
                Ok(None) => {}
                Err(StorageError::Store(e)) => return Err(e.into()),
                Err(e) => warn!(key = %raw, error = %e, "skipping unreadable rollback point"),
            }
        }
        Ok(points)
    }

    pub fn delete_point(&self, name: &str) -> Result<(), RollbackError> {
        let key = RecordKey::RollbackPoint(name.to_string()).to_string();
        match self.store().remove(&key)? {
            Some(_) => {
                info!(point = name, "rollback point deleted");
                Ok(())
            }
            None => Err(RollbackError::PointNotFound(name.to_string())),
        }
    }

    /// Keys added, removed and changed going from point `a` to point `b`.
    pub fn diff_points(&self, a: &str, b: &str) -> Result<SnapshotDiff, RollbackError> {
        let older = self.load_point(a)?;
        let newer = self.load_point(b)?;
        Ok(diff(&older.snapshot, &newer.snapshot))
    }

    // ----- emergency backups -----

    /// Capture the critical keys, dropping the oldest backups past the cap.
    pub fn create_emergency_backup(&self, reason: &str) -> Result<EmergencyBackup, RollbackError> {
        self.push_backup(reason, BackupScope::Critical)
    }

    fn push_backup(&self, reason: &str, scope: BackupScope) -> Result<EmergencyBackup, RollbackError> {
        let entries = capture(&**self.store(), |k: &str| scope.includes(k))?;
        let mut backups = self.emergency_backups()?;
        let sequence = backups.iter().map(|b| b.sequence + 1).max().unwrap_or(0);
        let timestamp = Utc::now();
        let backup = EmergencyBackup {
            id: format!("emergency-{}-{sequence}", timestamp.timestamp_millis()),
            sequence,
            timestamp,
            reason: reason.to_string(),
            scope,
            entries,
        };
        backups.push(backup.clone());
        let excess = backups.len().saturating_sub(self.config.emergency_backup_cap.max(1));
        let backups = backups.split_off(excess);
        self.storage.write_system(&RecordKey::EmergencyBackups, &backups)?;
        info!(id = %backup.id, keys = backup.entries.len(), reason, "emergency backup created");
        Ok(backup)
    }

    /// Stored backups, oldest first. A corrupt list reads as empty.
    pub fn emergency_backups(&self) -> Result<Vec<EmergencyBackup>, RollbackError> {
        Ok(self.storage.read_or_default(&RecordKey::EmergencyBackups)?)
    }

    // ----- restores -----

    /// Restore point `name` with `strategy`.
    ///
    /// Returns the audit record. A restore that failed but was recovered is
    /// `Ok` with a [`RollbackOutcome::Recovered`] outcome.
    pub fn rollback(
        &self,
        name: &str,
        strategy: RollbackStrategy,
        options: RollbackOptions,
    ) -> Result<RollbackRecord, RollbackError> {
        if strategy == RollbackStrategy::Emergency {
            return self.recover("requested");
        }
        let point = self.load_point(name)?;
        let mut record = RollbackRecord::new(name, strategy.clone());
        info!(point = name, %strategy, "rollback requested");

        if self.config.checkpoint_before && !options.skip_checkpoint {
            record.enter(RollbackPhase::CheckpointBefore);
            let backup = self
                .push_backup(&format!("before rollback to {name}"), BackupScope::Full)
                .map_err(|e| RollbackError::CheckpointFailed(e.to_string()))?;
            record.checkpoint = Some(backup.id);
        }

        let include = |k: &str| strategy.includes(k);
        let result = self.restore(&point.snapshot, &include, Some(&mut record));
        match result {
            Ok(restored) => {
                record.restored_keys = restored;
                record.enter(RollbackPhase::Success);
                record.outcome = RollbackOutcome::Success;
                info!(point = name, restored, "rollback complete");
                self.emit_restored(&format!("rollback:{name}"), restored);
            }
            Err(e) => {
                error!(point = name, error = %e, "rollback failed, starting emergency recovery");
                record.enter(RollbackPhase::Failed);
                record.enter(RollbackPhase::EmergencyRecovery);
                let source = self.emergency_recovery().map_err(|last| {
                    RollbackError::RecoveryExhausted {
                        cause: e.to_string(),
                        last: last.to_string(),
                    }
                })?;
                record.outcome = RollbackOutcome::Recovered {
                    source,
                    error: e.to_string(),
                };
            }
        }
        self.finish(record)
    }

    /// Run the emergency recovery chain as its own audited operation.
    pub fn recover(&self, reason: &str) -> Result<RollbackRecord, RollbackError> {
        let mut record = RollbackRecord::new("emergency", RollbackStrategy::Emergency);
        record.enter(RollbackPhase::EmergencyRecovery);
        let source = self
            .emergency_recovery()
            .map_err(|last| RollbackError::RecoveryExhausted {
                cause: reason.to_string(),
                last: last.to_string(),
            })?;
        record.enter(RollbackPhase::Success);
        record.outcome = RollbackOutcome::Recovered {
            source,
            error: reason.to_string(),
        };
        self.finish(record)
    }

    /// Latest emergency backup, then latest rollback point, then factory reset.
    pub fn emergency_recovery(&self) -> Result<RecoverySource, RollbackError> {
        match self.emergency_backups() {
            Ok(backups) => {
                if let Some(backup) = backups.into_iter().rev().find(|b| !b.entries.is_empty()) {
                    let scope = backup.scope;
                    match self.restore(&backup.entries, &|k: &str| scope.includes(k), None) {
                        Ok(n) => {
                            info!(id = %backup.id, restored = n, "recovered from emergency backup");
                            self.emit_restored(&format!("emergency:{}", backup.id), n);
                            return Ok(RecoverySource::EmergencyBackup(backup.id));
                        }
                        Err(e) => {
                            warn!(id = %backup.id, error = %e, "emergency backup restore failed")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "emergency backups unreadable"),
        }

        match self.latest_point() {
            Ok(Some(point)) => match self.restore(&point.snapshot, &in_snapshot_scope, None) {
                Ok(n) => {
                    info!(point = %point.name, restored = n, "recovered from rollback point");
                    self.emit_restored(&format!("rollback:{}", point.name), n);
                    return Ok(RecoverySource::RollbackPoint(point.name));
                }
                Err(e) => warn!(point = %point.name, error = %e, "rollback point restore failed"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "rollback points unreadable"),
        }

        self.factory_reset()?;
        Ok(RecoverySource::FactoryReset)
    }

    /// Remove every application key, rollback bookkeeping included.
    pub fn factory_reset(&self) -> Result<usize, RollbackError> {
        let mut removed = 0;
        for key in self.store().keys()? {
            if is_application_key(&key) {
                self.store().remove(&key)?;
                removed += 1;
            }
        }
        warn!(removed, "factory reset");
        self.emit_restored("factory-reset", removed);
        Ok(removed)
    }

    /// Stored audit history, oldest first.
    pub fn history(&self) -> Result<Vec<RollbackRecord>, RollbackError> {
        Ok(self.storage.read_or_default(&RecordKey::RollbackHistory)?)
    }

    /// Bring every `include` key to its value in `snapshot`.
    ///
    /// Keys absent from the snapshot are removed and keys whose value differs
    /// are rewritten; keys already matching are not touched, so a failed
    /// restore never wipes a value it could not write back.
    fn restore(
        &self,
        snapshot: &StoreSnapshot,
        include: &dyn Fn(&str) -> bool,
        mut record: Option<&mut RollbackRecord>,
    ) -> Result<usize, RollbackError> {
        let store = self.store();
        let expected: StoreSnapshot = snapshot
            .iter()
            .filter(|(k, _)| include(k.as_str()))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        let current = capture(&**store, include)?;
        let pending = diff(&current, &expected);

        if let Some(r) = record.as_deref_mut() {
            r.enter(RollbackPhase::Clearing);
        }
        for key in &pending.removed {
            store.remove(key)?;
        }

        if let Some(r) = record.as_deref_mut() {
            r.enter(RollbackPhase::Restoring);
        }
        for key in pending.added.iter().chain(&pending.changed) {
            if let Some(entry) = expected.get(key) {
                store.set(key, &entry.raw)?;
            }
        }

        if let Some(r) = record.as_deref_mut() {
            r.enter(RollbackPhase::Verifying);
        }
        let actual = capture(&**store, include)?;
        let d = diff(&expected, &actual);
        if !d.is_empty() {
            let mismatched = d.added.into_iter().chain(d.removed).chain(d.changed).collect();
            return Err(RollbackError::VerificationFailed { mismatched });
        }
        Ok(expected.len())
    }

    fn finish(&self, mut record: RollbackRecord) -> Result<RollbackRecord, RollbackError> {
        record.finished_at = Some(Utc::now());
        let reset = matches!(
            record.outcome,
            RollbackOutcome::Recovered {
                source: RecoverySource::FactoryReset,
                ..
            }
        );
        // After a factory reset no application key may remain, history included.
        if !reset {
            if let Err(e) = self.append_history(&record) {
                warn!(error = %e, "failed to persist rollback history");
            }
        }
        Ok(record)
    }

    fn append_history(&self, record: &RollbackRecord) -> Result<(), RollbackError> {
        let mut history = self.history()?;
        history.push(record.clone());
        let excess = history.len().saturating_sub(self.config.history_cap);
        let history = history.split_off(excess);
        self.storage.write_system(&RecordKey::RollbackHistory, &history)?;
        Ok(())
    }

    fn emit_restored(&self, source: &str, keys: usize) {
        self.storage.events().emit(&StorageEvent::Restored {
            source: source.to_string(),
            keys,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::{KeyValueStore, MemoryStore};
    use std::sync::{Arc, Mutex, RwLock};
    use tracker_core::{MaterialMap, Project};

    fn manager(store: SharedStore) -> RollbackManager {
        RollbackManager::new(store, RollbackConfig::default(), ValidationConfig::default())
    }

    fn seeded() -> (MemoryStore, UnifiedStorage, RollbackManager) {
        let mem = MemoryStore::new();
        let shared: SharedStore = Arc::new(mem.clone());
        let storage = UnifiedStorage::new(shared.clone());
        storage.mark_current().unwrap();
        storage
            .add_project(Project::new("Brig", "ship", MaterialMap::new()))
            .unwrap();
        storage.set_material_quantity("Plywood", 10).unwrap();
        storage.set_preference("theme", serde_json::json!("dark")).unwrap();
        (mem, storage, manager(shared))
    }

    fn app_key_count(mem: &MemoryStore) -> usize {
        mem.keys().unwrap().iter().filter(|k| is_application_key(k)).count()
    }

    #[test]
    fn complete_rollback_restores_plywood() {
        let (_, storage, mgr) = seeded();
        mgr.create_point("p1", None).unwrap();
        storage.set_material_quantity("Plywood", 999).unwrap();
        let record = mgr
            .rollback("p1", RollbackStrategy::Complete, RollbackOptions::default())
            .unwrap();
        assert!(record.succeeded());
        assert_eq!(storage.get_quantity("Plywood"), 10);
        assert_eq!(
            record.phases,
            vec![
                RollbackPhase::Requested,
                RollbackPhase::CheckpointBefore,
                RollbackPhase::Clearing,
                RollbackPhase::Restoring,
                RollbackPhase::Verifying,
                RollbackPhase::Success,
            ]
        );
        assert!(record.checkpoint.is_some());
        assert_eq!(mgr.history().unwrap().len(), 1);
        assert_eq!(mgr.emergency_backups().unwrap().len(), 1);
    }

    #[test]
    fn point_captures_exactly_present_keys_and_restores_checksums() {
        let (mem, _, mgr) = seeded();
        let before = capture(&mem, in_snapshot_scope).unwrap();
        let point = mgr.create_point("p1", Some("baseline")).unwrap();
        assert_eq!(
            point.snapshot.keys().collect::<Vec<_>>(),
            before.keys().collect::<Vec<_>>()
        );
        assert!(point.validation.is_some());

        mgr.rollback("p1", RollbackStrategy::Complete, RollbackOptions::default())
            .unwrap();
        let after = capture(&mem, in_snapshot_scope).unwrap();
        assert!(diff(&before, &after).is_empty());
        for (key, entry) in &before {
            assert_eq!(entry.checksum, after[key].checksum);
        }
    }

    #[test]
    fn selective_rollback_leaves_other_components() {
        let (mem, storage, mgr) = seeded();
        mgr.create_point("p1", None).unwrap();
        storage.set_material_quantity("Plywood", 999).unwrap();
        storage.set_material_quantity("Iron", 3).unwrap();
        storage.set_preference("theme", serde_json::json!("light")).unwrap();
        let outside = |k: &str| in_snapshot_scope(k) && !Component::Inventory.owns(k);
        let untouched = capture(&mem, outside).unwrap();

        let record = mgr
            .rollback(
                "p1",
                RollbackStrategy::Selective(vec![Component::Inventory]),
                RollbackOptions::default(),
            )
            .unwrap();
        assert!(record.succeeded());
        assert_eq!(storage.get_quantity("Plywood"), 10);
        assert_eq!(storage.material_quantity("Iron").unwrap(), None);
        assert!(diff(&untouched, &capture(&mem, outside).unwrap()).is_empty());
    }

    #[test]
    fn data_only_keeps_preferences() {
        let (_, storage, mgr) = seeded();
        mgr.create_point("p1", None).unwrap();
        storage.set_material_quantity("Plywood", 1).unwrap();
        storage.set_preference("theme", serde_json::json!("light")).unwrap();
        mgr.rollback("p1", RollbackStrategy::DataOnly, RollbackOptions::default())
            .unwrap();
        assert_eq!(storage.get_quantity("Plywood"), 10);
        assert_eq!(
            storage.preference("theme").unwrap(),
            Some(serde_json::json!("light"))
        );
    }

    #[test]
    fn points_are_immutable_and_missing_points_error() {
        let (_, _, mgr) = seeded();
        mgr.create_point("p1", None).unwrap();
        assert!(matches!(
            mgr.create_point("p1", None),
            Err(RollbackError::PointExists(_))
        ));
        assert!(matches!(
            mgr.create_point("  ", None),
            Err(RollbackError::InvalidName(_))
        ));
        assert!(matches!(
            mgr.rollback("nope", RollbackStrategy::Complete, RollbackOptions::default()),
            Err(RollbackError::PointNotFound(_))
        ));
        assert!(mgr.emergency_backups().unwrap().is_empty());
    }

    #[test]
    fn list_diff_and_delete_points() {
        let (_, storage, mgr) = seeded();
        mgr.create_point("a", None).unwrap();
        storage.set_material_quantity("Plywood", 11).unwrap();
        storage.set_material_quantity("Iron", 2).unwrap();
        mgr.create_point("b", None).unwrap();
        let names: Vec<String> = mgr.list_points().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names.len(), 2);
        let d = mgr.diff_points("a", "b").unwrap();
        assert_eq!(d.added, vec!["inventory:Iron".to_string()]);
        assert_eq!(d.changed, vec!["inventory:Plywood".to_string()]);
        assert!(d.removed.is_empty());
        mgr.delete_point("a").unwrap();
        assert!(matches!(mgr.delete_point("a"), Err(RollbackError::PointNotFound(_))));
        assert_eq!(mgr.list_points().unwrap().len(), 1);
    }

    #[test]
    fn emergency_backups_are_capped() {
        let (mem, _, _) = seeded();
        let config = RollbackConfig {
            emergency_backup_cap: 2,
            ..RollbackConfig::default()
        };
        let mgr = RollbackManager::new(Arc::new(mem), config, ValidationConfig::default());
        let ids: Vec<String> = (0..3)
            .map(|i| mgr.create_emergency_backup(&format!("b{i}")).unwrap().id)
            .collect();
        let kept: Vec<String> = mgr.emergency_backups().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
        let backup = mgr.emergency_backups().unwrap().pop().unwrap();
        assert!(backup.entries.contains_key("inventory:Plywood"));
        assert!(!backup.entries.contains_key("preferences:theme"));
        assert_eq!(backup.scope, BackupScope::Critical);
    }

    #[test]
    fn backup_ids_stay_unique_past_the_cap() {
        let (mem, _, _) = seeded();
        let config = RollbackConfig {
            emergency_backup_cap: 2,
            ..RollbackConfig::default()
        };
        let mgr = RollbackManager::new(Arc::new(mem), config, ValidationConfig::default());
        let backups: Vec<EmergencyBackup> = (0..5)
            .map(|i| mgr.create_emergency_backup(&format!("b{i}")).unwrap())
            .collect();
        let mut ids: Vec<&str> = backups.iter().map(|b| b.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        let sequences: Vec<u64> = backups.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn emergency_with_nothing_saved_factory_resets() {
        let (mem, _, mgr) = seeded();
        mem.set("unrelated", "kept").unwrap();
        let record = mgr
            .rollback("ignored", RollbackStrategy::Emergency, RollbackOptions::default())
            .unwrap();
        assert_eq!(
            record.outcome,
            RollbackOutcome::Recovered {
                source: RecoverySource::FactoryReset,
                error: "requested".into()
            }
        );
        assert_eq!(app_key_count(&mem), 0);
        assert_eq!(mem.get("unrelated").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn emergency_prefers_backup_then_point() {
        let (_, storage, mgr) = seeded();
        mgr.create_point("p1", None).unwrap();
        storage.set_material_quantity("Plywood", 50).unwrap();
        assert_eq!(
            mgr.emergency_recovery().unwrap(),
            RecoverySource::RollbackPoint("p1".into())
        );
        assert_eq!(storage.get_quantity("Plywood"), 10);

        storage.set_material_quantity("Plywood", 60).unwrap();
        let backup = mgr.create_emergency_backup("manual").unwrap();
        storage.set_material_quantity("Plywood", 70).unwrap();
        assert_eq!(
            mgr.emergency_recovery().unwrap(),
            RecoverySource::EmergencyBackup(backup.id)
        );
        assert_eq!(storage.get_quantity("Plywood"), 60);
    }

    /// Store whose writes to one key fail once armed.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_key: Arc<RwLock<Option<String>>>,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if self.fail_key.read().unwrap().as_deref() == Some(key) {
                return Err(StoreError::Backend(format!("write to {key} rejected")));
            }
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.remove(key)
        }
        fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keys()
        }
        fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear()
        }
    }

    #[test]
    fn failed_restore_recovers_from_pre_rollback_checkpoint() {
        let flaky = FlakyStore::default();
        let shared: SharedStore = Arc::new(flaky.clone());
        let storage = UnifiedStorage::new(shared.clone());
        storage.set_material_quantity("Plywood", 10).unwrap();
        storage.set_preference("theme", serde_json::json!("dark")).unwrap();
        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        events.subscribe(move |e| s.lock().unwrap().push(e.name()));
        let mgr = manager(shared).with_events(events);
        mgr.create_point("p1", None).unwrap();

        storage.set_material_quantity("Plywood", 999).unwrap();
        storage.set_preference("theme", serde_json::json!("light")).unwrap();
        *flaky.fail_key.write().unwrap() = Some("preferences:theme".into());
        let record = mgr
            .rollback("p1", RollbackStrategy::Complete, RollbackOptions::default())
            .unwrap();

        assert!(!record.succeeded());
        assert!(matches!(
            record.outcome,
            RollbackOutcome::Recovered {
                source: RecoverySource::EmergencyBackup(_),
                ..
            }
        ));
        assert!(record.phases.contains(&RollbackPhase::Failed));
        assert_eq!(record.phase(), RollbackPhase::EmergencyRecovery);
        assert_eq!(storage.get_quantity("Plywood"), 999);
        assert_eq!(
            storage.preference("theme").unwrap(),
            Some(serde_json::json!("light"))
        );
        assert_eq!(*seen.lock().unwrap(), vec!["storage-restored"]);
    }

    #[test]
    fn recovered_rollback_keeps_non_critical_keys() {
        let flaky = FlakyStore::default();
        let shared: SharedStore = Arc::new(flaky.clone());
        let storage = UnifiedStorage::new(shared.clone());
        storage
            .add_project(Project::new("Brig", "ship", MaterialMap::new()))
            .unwrap();
        storage
            .add_project(Project::new("Cannon", "part", MaterialMap::new()))
            .unwrap();
        storage.set_priority("Brig", 1).unwrap();
        storage.set_dependencies("Brig", vec!["Cannon".into()]).unwrap();
        let mgr = manager(shared);
        mgr.create_point("p1", None).unwrap();

        storage.set_priority("Brig", 5).unwrap();
        storage.set_material_quantity("Plywood", 3).unwrap();
        *flaky.fail_key.write().unwrap() = Some("projects:priorities".into());
        let record = mgr
            .rollback("p1", RollbackStrategy::Complete, RollbackOptions::default())
            .unwrap();

        assert!(matches!(
            record.outcome,
            RollbackOutcome::Recovered {
                source: RecoverySource::EmergencyBackup(_),
                ..
            }
        ));
        assert_eq!(storage.priorities().unwrap().get("Brig"), Some(&5));
        assert_eq!(
            storage.dependencies().unwrap().get("Brig"),
            Some(&vec!["Cannon".to_string()])
        );
        assert_eq!(storage.get_quantity("Plywood"), 3);
        let checkpoint = mgr.emergency_backups().unwrap().pop().unwrap();
        assert_eq!(checkpoint.scope, BackupScope::Full);
        assert!(checkpoint.entries.contains_key("projects:dependencies"));
    }

    #[test]
    fn data_only_restores_materials_named_like_preferences() {
        let (_, storage, mgr) = seeded();
        storage.set_material_quantity("ui_frame", 4).unwrap();
        mgr.create_point("p1", None).unwrap();
        storage.set_material_quantity("ui_frame", 40).unwrap();
        mgr.rollback("p1", RollbackStrategy::DataOnly, RollbackOptions::default())
            .unwrap();
        assert_eq!(storage.get_quantity("ui_frame"), 4);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            RollbackStrategy::parse("Complete", &[]).unwrap(),
            RollbackStrategy::Complete
        );
        assert_eq!(
            RollbackStrategy::parse("selective", &[Component::Navigation]).unwrap(),
            RollbackStrategy::Selective(vec![Component::Navigation])
        );
        assert!(RollbackStrategy::parse("selective", &[]).is_err());
        assert_eq!(
            RollbackStrategy::parse("data-only", &[]).unwrap(),
            RollbackStrategy::DataOnly
        );
        assert!(RollbackStrategy::parse("partial", &[]).is_err());
    }
}
