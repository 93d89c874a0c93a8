//! Shared data model and service contract for backup governance.

pub mod context;
pub mod document;
pub mod error;
pub mod names;
pub mod plan;
pub mod selection;
pub mod service;
pub mod vault;

pub use context::DeploymentContext;
pub use document::{
    DocumentHash, Effect, MANDATORY_DENIED_ACTIONS, POLICY_VERSION, PolicyStatement, Principal,
    ProtectionPolicyDocument,
};
pub use error::{Error, ErrorClass, Result, ServiceError, ServiceResult};
pub use names::{PlanName, SelectionName, VaultName, validate_name};
pub use plan::{
    BackupPlan, BackupRule, MAX_RETENTION_DAYS, PlanHandle, RetentionDays, RuleSpec, Schedule,
};
pub use selection::{
    ConditionOperator, SelectionHandle, SelectionRule, TagCondition, plans_covering,
};
pub use service::{BackupService, DynBackupService};
pub use vault::VaultHandle;
