//! In-process backup service used by tests and the `memory` service kind.

use async_trait::async_trait;
use greentic_backup_spec::{
    BackupPlan, BackupService, DeploymentContext, PlanHandle, PlanName, ProtectionPolicyDocument,
    SelectionHandle, SelectionRule, ServiceError, ServiceResult, VaultHandle, VaultName,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Service operations, used for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateVault,
    DescribeVault,
    ListVaults,
    PutVaultAccessPolicy,
    CreatePlan,
    UpdatePlan,
    DeletePlan,
    ListPlans,
    CreateSelection,
    DeleteSelection,
    ListSelections,
}

#[derive(Default)]
struct State {
    vaults: BTreeMap<VaultName, StoredVault>,
    plans: BTreeMap<String, BackupPlan>,
    selections: BTreeMap<String, SelectionHandle>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

struct StoredVault {
    handle: VaultHandle,
    policy: Option<ProtectionPolicyDocument>,
}

/// Backup service kept entirely in memory.
///
/// Mirrors the validation the real service performs and lets tests script
/// failures per operation.
pub struct MemoryBackupService {
    context: DeploymentContext,
    state: Mutex<State>,
    faults: Mutex<HashMap<Operation, VecDeque<ServiceError>>>,
    lost_replies: Mutex<HashMap<Operation, usize>>,
    calls: Mutex<HashMap<Operation, usize>>,
    known_roles: Mutex<Option<BTreeSet<String>>>,
}

impl MemoryBackupService {
    pub fn new(context: DeploymentContext) -> Self {
        Self {
            context,
            state: Mutex::new(State::default()),
            faults: Mutex::new(HashMap::new()),
            lost_replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            known_roles: Mutex::new(None),
        }
    }

    /// Fail the next `times` calls of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: ServiceError, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Let the next `times` calls of `operation` take effect, then answer
    /// with [`ServiceError::Timeout`] as if the reply had been lost.
    pub fn lose_reply_next(&self, operation: Operation, times: usize) {
        *self.lost_replies.lock().entry(operation).or_default() += times;
    }

    /// Number of calls made for `operation`, including failed ones.
    pub fn calls(&self, operation: Operation) -> usize {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Restrict execution roles to the given ARNs; unknown roles are rejected
    /// with `RoleNotFound`.
    pub fn restrict_roles<I, S>(&self, roles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.known_roles.lock() = Some(roles.into_iter().map(Into::into).collect());
    }

    /// Create a vault out of band, as if another tool had provisioned it.
    pub fn seed_vault(&self, name: &VaultName) -> VaultHandle {
        let mut state = self.state.lock();
        let id = state.next_id("vault");
        let handle = VaultHandle::new(name.clone(), id, self.context.vault_arn(name));
        state.vaults.insert(
            name.clone(),
            StoredVault {
                handle: handle.clone(),
                policy: None,
            },
        );
        handle
    }

    /// The access policy currently attached to `vault`.
    pub fn access_policy(&self, vault: &VaultName) -> Option<ProtectionPolicyDocument> {
        self.state
            .lock()
            .vaults
            .get(vault)
            .and_then(|stored| stored.policy.clone())
    }

    pub fn plan_by_name(&self, name: &PlanName) -> Option<PlanHandle> {
        self.state
            .lock()
            .plans
            .iter()
            .find(|(_, plan)| &plan.name == name)
            .map(|(id, plan)| PlanHandle {
                id: id.clone(),
                plan: plan.clone(),
            })
    }

    pub fn selection_count(&self) -> usize {
        self.state.lock().selections.len()
    }

    fn enter(&self, operation: Operation) -> ServiceResult<()> {
        *self.calls.lock().entry(operation).or_default() += 1;
        match self
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run a mutating call, honouring scripted faults and lost replies.
    fn commit<T>(
        &self,
        operation: Operation,
        apply: impl FnOnce() -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        self.enter(operation)?;
        let value = apply()?;
        let mut lost = self.lost_replies.lock();
        match lost.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ServiceError::Timeout)
            }
            _ => Ok(value),
        }
    }
}

#[async_trait]
impl BackupService for MemoryBackupService {
    async fn create_vault(&self, name: &VaultName) -> ServiceResult<VaultHandle> {
        self.commit(Operation::CreateVault, || {
            if self.state.lock().vaults.contains_key(name) {
                return Err(ServiceError::AlreadyExists {
                    entity: format!("vault:{name}"),
                });
            }
            Ok(self.seed_vault(name))
        })
    }

    async fn describe_vault(&self, name: &VaultName) -> ServiceResult<Option<VaultHandle>> {
        self.enter(Operation::DescribeVault)?;
        Ok(self
            .state
            .lock()
            .vaults
            .get(name)
            .map(|stored| stored.handle.clone()))
    }

    async fn list_vaults(&self) -> ServiceResult<Vec<VaultHandle>> {
        self.enter(Operation::ListVaults)?;
        Ok(self
            .state
            .lock()
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
        self.commit(Operation::PutVaultAccessPolicy, || {
            document
                .validate_for(&vault.arn)
                .map_err(|err| ServiceError::InvalidDocument(err.to_string()))?;
            let mut state = self.state.lock();
            let stored = state
                .vaults
                .get_mut(&vault.name)
                .ok_or_else(|| ServiceError::NotFound {
                    entity: format!("vault:{}", vault.name),
                })?;
            stored.policy = Some(document.clone());
            Ok(true)
        })
    }

    async fn create_plan(&self, plan: &BackupPlan) -> ServiceResult<String> {
        self.commit(Operation::CreatePlan, || {
            let mut state = self.state.lock();
            if state.plans.values().any(|existing| existing.name == plan.name) {
                return Err(ServiceError::AlreadyExists {
                    entity: format!("plan:{}", plan.name),
                });
            }
            check_plan_targets(&state, plan)?;
            let id = state.next_id("plan");
            state.plans.insert(id.clone(), plan.clone());
            Ok(id)
        })
    }

    async fn update_plan(&self, plan_id: &str, plan: &BackupPlan) -> ServiceResult<()> {
        self.commit(Operation::UpdatePlan, || {
            let mut state = self.state.lock();
            if !state.plans.contains_key(plan_id) {
                return Err(ServiceError::PlanNotFound {
                    plan: plan_id.to_string(),
                });
            }
            check_plan_targets(&state, plan)?;
            state.plans.insert(plan_id.to_string(), plan.clone());
            Ok(())
        })
    }

    async fn delete_plan(&self, plan_id: &str) -> ServiceResult<()> {
        self.commit(Operation::DeletePlan, || {
            let mut state = self.state.lock();
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
        self.enter(Operation::ListPlans)?;
        Ok(self
            .state
            .lock()
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
        self.commit(Operation::CreateSelection, || {
            if rule.conditions.is_empty() {
                return Err(ServiceError::InvalidPredicate(format!(
                    "selection {} has no conditions",
                    rule.name
                )));
            }
            if let Some(roles) = self.known_roles.lock().as_ref()
                && !roles.contains(role_arn)
            {
                return Err(ServiceError::RoleNotFound {
                    role: role_arn.to_string(),
                });
            }
            let mut state = self.state.lock();
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
            let id = state.next_id("selection");
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
        self.commit(Operation::DeleteSelection, || {
            let mut state = self.state.lock();
            match state.selections.get(selection_id) {
                Some(selection) if selection.plan_id == plan_id => {
                    state.selections.remove(selection_id);
                    Ok(())
                }
                _ => Err(ServiceError::NotFound {
                    entity: format!("selection:{selection_id}"),
                }),
            }
        })
    }

    async fn list_selections(&self, plan_id: &str) -> ServiceResult<Vec<SelectionHandle>> {
        self.enter(Operation::ListSelections)?;
        Ok(self
            .state
            .lock()
            .selections
            .values()
            .filter(|selection| selection.plan_id == plan_id)
            .cloned()
            .collect())
    }
}

fn check_plan_targets(state: &State, plan: &BackupPlan) -> ServiceResult<()> {
    for vault in plan.target_vaults() {
        if !state.vaults.contains_key(vault) {
            return Err(ServiceError::NotFound {
                entity: format!("vault:{vault}"),
            });
        }
    }
    Ok(())
}
