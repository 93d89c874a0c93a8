//! Development backup service.
//!
//! Keeps vaults, access policies, plans and selections in memory and, when
//! configured, persists them to a JSON file so repeated CLI invocations see
//! the same service state.

use async_trait::async_trait;
use fs2::FileExt;
use greentic_backup_spec::{
    BackupPlan, BackupService, DeploymentContext, Error, PlanHandle, ProtectionPolicyDocument,
    Result, SelectionHandle, SelectionRule, ServiceError, ServiceResult, VaultHandle, VaultName,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_PERSIST_PATH: &str = ".greentic-backup-dev.json";
const PERSIST_ENV: &str = "GREENTIC_BACKUP_DEV_STORE";

#[derive(Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    vaults: BTreeMap<VaultName, StoredVault>,
    #[serde(default)]
    plans: BTreeMap<String, BackupPlan>,
    #[serde(default)]
    selections: BTreeMap<String, SelectionHandle>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredVault {
    handle: VaultHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_policy: Option<ProtectionPolicyDocument>,
}

#[derive(Clone)]
struct Persistence {
    path: PathBuf,
}

impl Persistence {
    fn load(path: PathBuf) -> Result<(State, Self)> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(storage)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(storage)?;

        file.lock_exclusive().map_err(storage)?;
        let result = (|| -> Result<State> {
            let mut raw = String::new();
            file.read_to_string(&mut raw).map_err(storage)?;
            if raw.trim().is_empty() {
                return Ok(State::default());
            }
            serde_json::from_str(&raw).map_err(storage)
        })();
        let _ = FileExt::unlock(&file);

        result.map(|state| (state, Self { path }))
    }

    fn persist(&self, state: &State) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).map_err(storage)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(storage)?;

        file.lock_exclusive().map_err(storage)?;
        let result = file
            .write_all(&json)
            .and_then(|()| file.flush())
            .map_err(storage);
        let _ = FileExt::unlock(&file);
        debug!(path = %self.path.display(), "dev backup store persisted");
        result
    }
}

fn storage(err: impl std::fmt::Display) -> Error {
    Error::Storage(err.to_string())
}

/// Development service that validates requests like the real one would.
#[derive(Clone)]
pub struct DevBackupService {
    context: DeploymentContext,
    state: Arc<RwLock<State>>,
    persistence: Option<Persistence>,
}

impl DevBackupService {
    /// Purely in-memory service.
    pub fn new(context: DeploymentContext) -> Self {
        Self {
            context,
            state: Arc::new(RwLock::new(State::default())),
            persistence: None,
        }
    }

    /// Service persisted to `path`, loading whatever is already stored there.
    pub fn with_persistence<P: Into<PathBuf>>(context: DeploymentContext, path: P) -> Result<Self> {
        let (state, persistence) = Persistence::load(path.into())?;
        Ok(Self {
            context,
            state: Arc::new(RwLock::new(state)),
            persistence: Some(persistence),
        })
    }

    /// Use `GREENTIC_BACKUP_DEV_STORE` when set, else `.greentic-backup-dev.json`
    /// if it exists, else memory only.
    pub fn from_env(context: DeploymentContext) -> Result<Self> {
        if let Ok(path) = std::env::var(PERSIST_ENV) {
            return Self::with_persistence(context, PathBuf::from(path));
        }
        let default_path = PathBuf::from(DEFAULT_PERSIST_PATH);
        if default_path.exists() {
            Self::with_persistence(context, default_path)
        } else {
            Ok(Self::new(context))
        }
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.path.as_path())
    }

    /// Access policy attached to `vault`, if any.
    pub fn access_policy(&self, vault: &VaultName) -> Option<ProtectionPolicyDocument> {
        self.state
            .read()
            .vaults
            .get(vault)
            .and_then(|stored| stored.access_policy.clone())
    }

    /// Apply `mutate` to the state and persist the result. The in-memory state
    /// only changes when persisting succeeded.
    fn commit<T>(&self, mutate: impl FnOnce(&mut State) -> ServiceResult<T>) -> ServiceResult<T> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let value = mutate(&mut next)?;
        if let Some(persistence) = &self.persistence {
            persistence
                .persist(&next)
                .map_err(|err| ServiceError::Transient(err.to_string()))?;
        }
        *guard = next;
        Ok(value)
    }
}

fn next_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn check_plan_targets(state: &State, plan: &BackupPlan) -> ServiceResult<()> {
    match plan
        .target_vaults()
        .into_iter()
        .find(|vault| !state.vaults.contains_key(*vault))
    {
        Some(missing) => Err(ServiceError::NotFound {
            entity: format!("vault:{missing}"),
        }),
        None => Ok(()),
    }
}

#[async_trait]
impl BackupService for DevBackupService {
    async fn create_vault(&self, name: &VaultName) -> ServiceResult<VaultHandle> {
        let arn = self.context.vault_arn(name);
        self.commit(|state| {
            if state.vaults.contains_key(name) {
                return Err(ServiceError::AlreadyExists {
                    entity: format!("vault:{name}"),
                });
            }
            let handle = VaultHandle::new(name.clone(), next_id("vault"), arn);
            state.vaults.insert(
                name.clone(),
                StoredVault {
                    handle: handle.clone(),
                    access_policy: None,
                },
            );
            Ok(handle)
        })
    }

    async fn describe_vault(&self, name: &VaultName) -> ServiceResult<Option<VaultHandle>> {
        Ok(self
            .state
            .read()
            .vaults
            .get(name)
            .map(|stored| stored.handle.clone()))
    }

    async fn list_vaults(&self) -> ServiceResult<Vec<VaultHandle>> {
        Ok(self
            .state
            .read()
            .vaults
            .values()
            .map(|stored| stored.handle.clone())
            .collect())
    }

    async fn put_vault_access_policy(
        &self,
        vault: &VaultHandle,
        document: &ProtectionPolicyDocument,
    ) -> ServiceResult<bool> {
        document
            .validate_for(&vault.arn)
            .map_err(|err| ServiceError::InvalidDocument(err.to_string()))?;
        self.commit(|state| {
            let stored = state
                .vaults
                .get_mut(&vault.name)
                .ok_or_else(|| ServiceError::NotFound {
                    entity: format!("vault:{}", vault.name),
                })?;
            stored.access_policy = Some(document.clone());
            Ok(true)
        })
    }

    async fn create_plan(&self, plan: &BackupPlan) -> ServiceResult<String> {
        self.commit(|state| {
            if state.plans.values().any(|existing| existing.name == plan.name) {
                return Err(ServiceError::AlreadyExists {
                    entity: format!("plan:{}", plan.name),
                });
            }
            check_plan_targets(state, plan)?;
            let id = next_id("plan");
            state.plans.insert(id.clone(), plan.clone());
            Ok(id)
        })
    }

    async fn update_plan(&self, plan_id: &str, plan: &BackupPlan) -> ServiceResult<()> {
        self.commit(|state| {
            if !state.plans.contains_key(plan_id) {
                return Err(ServiceError::PlanNotFound {
                    plan: plan_id.to_string(),
                });
            }
            check_plan_targets(state, plan)?;
            state.plans.insert(plan_id.to_string(), plan.clone());
            Ok(())
        })
    }

    async fn delete_plan(&self, plan_id: &str) -> ServiceResult<()> {
        self.commit(|state| {
            if state
                .selections
                .values()
                .any(|selection| selection.plan_id == plan_id)
            {
                return Err(ServiceError::Conflict(format!(
                    "plan {plan_id} still has selections"
                )));
            }
            state
                .plans
                .remove(plan_id)
                .map(|_| ())
                .ok_or_else(|| ServiceError::PlanNotFound {
                    plan: plan_id.to_string(),
                })
        })
    }

    async fn list_plans(&self) -> ServiceResult<Vec<PlanHandle>> {
        Ok(self
            .state
            .read()
            .plans
            .iter()
            .map(|(id, plan)| PlanHandle {
                id: id.clone(),
                plan: plan.clone(),
            })
            .collect())
    }

    async fn create_selection(
        &self,
        plan_id: &str,
        rule: &SelectionRule,
        role_arn: &str,
    ) -> ServiceResult<String> {
        if rule.conditions.is_empty() {
            return Err(ServiceError::InvalidPredicate(format!(
                "selection {} has no conditions",
                rule.name
            )));
        }
        if !role_arn.starts_with("arn:") || !role_arn.contains(":role/") {
            return Err(ServiceError::RoleNotFound {
                role: role_arn.to_string(),
            });
        }
        self.commit(|state| {
            if !state.plans.contains_key(plan_id) {
                return Err(ServiceError::PlanNotFound {
                    plan: plan_id.to_string(),
                });
            }
            if state
                .selections
                .values()
                .any(|existing| existing.plan_id == plan_id && existing.rule.name == rule.name)
            {
                return Err(ServiceError::AlreadyExists {
                    entity: format!("selection:{}", rule.name),
                });
            }
            let id = next_id("selection");
            state.selections.insert(
                id.clone(),
                SelectionHandle {
                    id: id.clone(),
                    plan_id: plan_id.to_string(),
                    role_arn: role_arn.to_string(),
                    rule: rule.clone(),
                },
            );
            Ok(id)
        })
    }

    async fn delete_selection(&self, plan_id: &str, selection_id: &str) -> ServiceResult<()> {
        self.commit(|state| match state.selections.get(selection_id) {
            Some(selection) if selection.plan_id == plan_id => {
                state.selections.remove(selection_id);
                Ok(())
            }
            _ => Err(ServiceError::NotFound {
                entity: format!("selection:{selection_id}"),
            }),
        })
    }

    async fn list_selections(&self, plan_id: &str) -> ServiceResult<Vec<SelectionHandle>> {
        Ok(self
            .state
            .read()
            .selections
            .values()
            .filter(|selection| selection.plan_id == plan_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greentic_backup_spec::{PlanName, RuleSpec, SelectionName, TagCondition};
    use tempfile::tempdir;

    fn context() -> DeploymentContext {
        DeploymentContext::new("123456789012", "eu-west-1").unwrap()
    }

    #[tokio::test]
    async fn rejects_documents_missing_mandatory_denies() {
        let service = DevBackupService::new(context());
        let vault = service
            .create_vault(&VaultName::new("vault-a").unwrap())
            .await
            .unwrap();
        let mut document = ProtectionPolicyDocument::deny_destructive(&vault, &[]);
        document.statements[0].actions.pop();

        let err = service
            .put_vault_access_policy(&vault, &document)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn plans_need_existing_vaults() {
        let service = DevBackupService::new(context());
        let rule = RuleSpec::new("0 3 * * ?", "vault-a", 14).validate().unwrap();
        let plan = BackupPlan::new(PlanName::new("daily").unwrap(), vec![rule]);
        let err = service.create_plan(&plan).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        let vault_name = VaultName::new("vault-a").unwrap();
        {
            let service = DevBackupService::with_persistence(context(), &path).unwrap();
            let vault = service.create_vault(&vault_name).await.unwrap();
            service
                .put_vault_access_policy(
                    &vault,
                    &ProtectionPolicyDocument::deny_destructive(&vault, &[]),
                )
                .await
                .unwrap();
            let plan_id = service
                .create_plan(&BackupPlan::new(PlanName::new("daily").unwrap(), Vec::new()))
                .await
                .unwrap();
            let rule = SelectionRule::new(
                SelectionName::new("sel-1").unwrap(),
                PlanName::new("daily").unwrap(),
                "r1",
                vec![TagCondition::string_equals("backup_policy", "daily")],
            )
            .unwrap();
            service
                .create_selection(&plan_id, &rule, &context().role_arn("r1"))
                .await
                .unwrap();
        }

        let reopened = DevBackupService::with_persistence(context(), &path).unwrap();
        assert_eq!(reopened.list_vaults().await.unwrap().len(), 1);
        assert!(reopened.access_policy(&vault_name).is_some());
        let plans = reopened.list_plans().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(
            reopened.list_selections(&plans[0].id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn bare_role_names_are_rejected() {
        let service = DevBackupService::new(context());
        let plan_id = service
            .create_plan(&BackupPlan::new(PlanName::new("daily").unwrap(), Vec::new()))
            .await
            .unwrap();
        let rule = SelectionRule::new(
            SelectionName::new("sel-1").unwrap(),
            PlanName::new("daily").unwrap(),
            "r1",
            vec![TagCondition::string_equals("k", "v")],
        )
        .unwrap();
        let err = service
            .create_selection(&plan_id, &rule, "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RoleNotFound { .. }));
    }
}
