#![deny(warnings)]

//! Integrity layer over unified storage.
//!
//! Storage offers no multi-key atomicity, so related keys can drift apart.
//! This crate detects the drift (validator, health monitor) and undoes it
//! (rollback points, emergency backups, guarded migration).

pub mod health;
pub mod migration;
pub mod report;
pub mod rollback;
pub mod validator;

pub use health::{Category, CategoryReport, HealthMonitor, HealthReport, HealthStatus, Remediation};
pub use migration::{GuardError, MigrationOutcome, MigrationRunner};
pub use report::Severity;
pub use rollback::{
    BackupScope, EmergencyBackup, PointSummary, RecoverySource, RollbackError, RollbackManager,
    RollbackOptions, RollbackOutcome, RollbackPhase, RollbackPoint, RollbackRecord,
    RollbackStrategy,
};
pub use validator::{find_cycles, CheckResult, Issue, MigrationValidator, ValidationReport};
