use thiserror::Error;

/// Result alias for governance operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Result alias for raw calls against the external backup service.
pub type ServiceResult<T> = core::result::Result<T, ServiceError>;

/// Errors reported by the external backup service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{entity} already exists")]
    AlreadyExists { entity: String },
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("request throttled")]
    Throttled,
    #[error("request timed out")]
    Timeout,
    #[error("service did not confirm the change")]
    NotConfirmed,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid policy document: {0}")]
    InvalidDocument(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid retention: {0}")]
    InvalidRetention(String),
    #[error("plan {plan} not found")]
    PlanNotFound { plan: String },
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),
    #[error("role {role} not found")]
    RoleNotFound { role: String },
    #[error("{entity} not found")]
    NotFound { entity: String },
    #[error("conflicting request: {0}")]
    Conflict(String),
}

/// Coarse classification used by callers to decide between retrying and escalating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed input; surfaced immediately, never retried.
    Validation,
    /// A referenced vault or plan is absent; the caller must reorder operations.
    DependencyNotReady,
    /// Timeout, throttling or network trouble; retried with backoff.
    Transient,
    /// Credentials lack rights; retrying cannot succeed.
    Permission,
    /// Anything else that needs operator attention.
    Fatal,
    /// The retry budget was exhausted.
    ReconciliationFailed,
}

/// Canonical governance error surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("{field} must not be empty")]
    EmptyComponent { field: &'static str },
    #[error("{field} contains invalid characters: {value}")]
    InvalidCharacters { field: &'static str, value: String },
    #[error("{field} must be between {min} and {max} characters: {value}")]
    InvalidLength {
        field: &'static str,
        value: String,
        min: usize,
        max: usize,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid schedule `{expression}`: {reason}")]
    InvalidSchedule { expression: String, reason: String },
    #[error("retention must be between 1 and {max} days, got {days}")]
    InvalidRetention { days: i64, max: u32 },
    #[error("selection {selection} has an empty predicate")]
    EmptyPredicate { selection: String },
    #[error("invalid predicate for selection {selection}: {reason}")]
    InvalidPredicate { selection: String, reason: String },
    #[error("{entity} is declared more than once")]
    Duplicate { entity: String },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("invalid policy document: {0}")]
    InvalidDocument(String),
    #[error("{entity} already exists")]
    AlreadyExists { entity: String },
    #[error("{entity} not found")]
    NotFound { entity: String },
    #[error("{entity} depends on {dependency}, which does not exist yet")]
    DependencyNotReady { entity: String, dependency: String },
    #[error("role {role} not found")]
    RoleNotFound { role: String },
    #[error("quota exceeded during {operation}: {reason}")]
    QuotaExceeded {
        operation: &'static str,
        reason: String,
    },
    #[error("{operation} for {entity} failed transiently: {reason}")]
    Transient {
        operation: &'static str,
        entity: String,
        reason: String,
    },
    #[error("{operation} for {entity} was denied: {reason}")]
    Permission {
        operation: &'static str,
        entity: String,
        reason: String,
    },
    #[error("reconciliation of {entity} failed after {attempts} attempts: {last_error}")]
    ReconciliationFailed {
        entity: String,
        attempts: u32,
        last_error: String,
    },
    #[error("{entity} conflicts with existing state: {reason}")]
    Conflict { entity: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Classify the error per the governance error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::EmptyComponent { .. }
            | Error::InvalidCharacters { .. }
            | Error::InvalidLength { .. }
            | Error::Invalid { .. }
            | Error::InvalidSchedule { .. }
            | Error::InvalidRetention { .. }
            | Error::EmptyPredicate { .. }
            | Error::InvalidPredicate { .. }
            | Error::Duplicate { .. }
            | Error::Manifest(_) => ErrorClass::Validation,
            Error::DependencyNotReady { .. } => ErrorClass::DependencyNotReady,
            Error::Transient { .. } => ErrorClass::Transient,
            Error::Permission { .. } => ErrorClass::Permission,
            Error::ReconciliationFailed { .. } => ErrorClass::ReconciliationFailed,
            Error::InvalidDocument(_)
            | Error::AlreadyExists { .. }
            | Error::NotFound { .. }
            | Error::RoleNotFound { .. }
            | Error::QuotaExceeded { .. }
            | Error::Conflict { .. }
            | Error::Storage(_) => ErrorClass::Fatal,
        }
    }

    /// Whether repeating the same call may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Attach operation and entity context to a raw service error.
    pub fn from_service(err: ServiceError, operation: &'static str, entity: &str) -> Self {
        match err {
            ServiceError::AlreadyExists { entity } => Error::AlreadyExists { entity },
            ServiceError::QuotaExceeded(reason) => Error::QuotaExceeded { operation, reason },
            ServiceError::Transient(reason) => Error::Transient {
                operation,
                entity: entity.to_string(),
                reason,
            },
            ServiceError::Throttled | ServiceError::Timeout | ServiceError::NotConfirmed => {
                Error::Transient {
                    operation,
                    entity: entity.to_string(),
                    reason: err.to_string(),
                }
            }
            ServiceError::PermissionDenied(reason) => Error::Permission {
                operation,
                entity: entity.to_string(),
                reason,
            },
            ServiceError::InvalidDocument(reason) => Error::InvalidDocument(reason),
            // The service does not echo the expression back, so only the
            // reason and the owning entity are known here.
            ServiceError::InvalidSchedule(reason) => Error::Invalid {
                field: "schedule",
                reason: format!("{reason} (rejected for {entity})"),
            },
            ServiceError::InvalidRetention(reason) => Error::Invalid {
                field: "retention",
                reason,
            },
            ServiceError::InvalidPredicate(reason) => Error::InvalidPredicate {
                selection: entity.to_string(),
                reason,
            },
            ServiceError::PlanNotFound { plan } => Error::DependencyNotReady {
                entity: entity.to_string(),
                dependency: format!("plan:{plan}"),
            },
            ServiceError::RoleNotFound { role } => Error::RoleNotFound { role },
            ServiceError::NotFound { entity: missing } => Error::DependencyNotReady {
                entity: entity.to_string(),
                dependency: missing,
            },
            ServiceError::Conflict(reason) => Error::Conflict {
                entity: entity.to_string(),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_outcomes_are_retryable() {
        for err in [
            ServiceError::Throttled,
            ServiceError::Timeout,
            ServiceError::NotConfirmed,
            ServiceError::Transient("connection reset".into()),
        ] {
            let mapped = Error::from_service(err, "put_vault_access_policy", "vault-a");
            assert!(mapped.is_retryable(), "{mapped} should be retryable");
        }
    }

    #[test]
    fn permission_and_validation_are_not_retryable() {
        let denied = Error::from_service(
            ServiceError::PermissionDenied("no backup:PutBackupVaultAccessPolicy".into()),
            "put_vault_access_policy",
            "vault-a",
        );
        assert_eq!(denied.class(), ErrorClass::Permission);
        assert!(!denied.is_retryable());

        let invalid = Error::InvalidRetention { days: 0, max: 36500 };
        assert_eq!(invalid.class(), ErrorClass::Validation);
    }

    #[test]
    fn service_schedule_rejection_keeps_reason_and_entity() {
        let err = Error::from_service(
            ServiceError::InvalidSchedule("day-of-week out of range".into()),
            "create_plan",
            "plan:daily",
        );
        assert_eq!(err.class(), ErrorClass::Validation);
        match err {
            Error::Invalid { field, reason } => {
                assert_eq!(field, "schedule");
                assert!(reason.contains("day-of-week out of range"));
                assert!(reason.contains("plan:daily"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_plan_maps_to_dependency_not_ready() {
        let err = Error::from_service(
            ServiceError::PlanNotFound {
                plan: "plan-0001".into(),
            },
            "create_selection",
            "selection:sel-1",
        );
        assert_eq!(err.class(), ErrorClass::DependencyNotReady);
        assert!(err.to_string().contains("plan:plan-0001"));
    }
}
