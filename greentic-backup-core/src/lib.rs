//! Reconciliation of declared backup governance against the backup service.
//!
//! [`VaultRegistry`] owns vault identity, [`ProtectionEnforcer`] keeps each
//! vault's deny-everyone access policy applied, [`PolicyCatalog`] owns plans
//! and [`SelectionBinder`] binds tagged resources to them. [`Reconciler`]
//! drives all four through a [`GovernanceManifest`] in dependency order.

pub mod binder;
pub mod catalog;
pub mod enforcer;
pub mod governance;
pub mod graph;
pub mod ledger;
pub mod manifest;
pub mod memory;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod retry;
pub mod watch;

pub use binder::SelectionBinder;
pub use catalog::PolicyCatalog;
pub use enforcer::{ProtectionEnforcer, ProtectionSettings, ProtectionStatus, ReconcileOutcome};
pub use governance::{Governance, GovernanceBuilder};
pub use graph::{DependencyGraph, Node};
pub use ledger::{AppliedProtection, FileLedger, MemoryLedger, ProtectionLedger};
pub use manifest::{GovernanceManifest, PlanSpec, SelectionSpec};
pub use memory::{MemoryBackupService, Operation};
pub use reconcile::{ReconcileOptions, Reconciler};
pub use registry::VaultRegistry;
pub use report::{Change, EntityOutcome, PassError, PassReport, PlannedAction};
pub use retry::{RetryPolicy, call_with_timeout, retry_async};
pub use watch::spawn_protection_watch;
