use crate::registry::VaultRegistry;
use crate::report::Change;
use crate::retry::{Created, RetryPolicy, call_with_timeout, create_with_retry, retry_async};
use greentic_backup_spec::{
    BackupPlan, BackupRule, DynBackupService, Error, PlanHandle, PlanName, Result, RuleSpec,
    ServiceError,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Named backup plans and their service identifiers.
///
/// Every rule is validated before any external call, and every target vault
/// must already be registered.
pub struct PolicyCatalog {
    service: DynBackupService,
    registry: Arc<VaultRegistry>,
    retry: RetryPolicy,
    plans: RwLock<BTreeMap<PlanName, PlanHandle>>,
}

impl PolicyCatalog {
    pub fn new(service: DynBackupService, registry: Arc<VaultRegistry>, retry: RetryPolicy) -> Self {
        Self {
            service,
            registry,
            retry,
            plans: RwLock::new(BTreeMap::new()),
        }
    }

    /// Validate `rules` and assemble the plan without touching the service.
    pub fn build_plan(&self, name: &PlanName, rules: &[RuleSpec]) -> Result<BackupPlan> {
        let rules = rules
            .iter()
            .map(RuleSpec::validate)
            .collect::<Result<Vec<BackupRule>>>()?;
        Ok(BackupPlan::new(name.clone(), rules))
    }

    pub async fn define_plan(&self, name: &PlanName, rules: &[RuleSpec]) -> Result<PlanHandle> {
        let plan = self.build_plan(name, rules)?;
        if self.plans.read().contains_key(name) {
            return Err(Error::AlreadyExists {
                entity: format!("plan:{name}"),
            });
        }
        self.check_targets(&plan)?;

        let entity = format!("plan:{name}");
        let created = create_with_retry(&self.retry, "create_plan", &entity, || {
            self.service.create_plan(&plan)
        })
        .await?;
        let handle = match created {
            Created::New(id) => PlanHandle { id, plan },
            Created::Existing { after_retry: true } => {
                // An earlier attempt may have landed before its answer was lost.
                let existing = self.lookup(name).await?;
                if existing.plan != plan {
                    return Err(Error::AlreadyExists { entity });
                }
                debug!(
                    plan = %name,
                    plan_id = %existing.id,
                    "adopted plan created by an unanswered attempt"
                );
                existing
            }
            Created::Existing { after_retry: false } => {
                return Err(Error::AlreadyExists { entity });
            }
        };
        self.plans.write().insert(name.clone(), handle.clone());
        info!(
            target = "audit",
            action = "plan.define",
            plan = %name,
            plan_id = %handle.id,
            rules = handle.plan.rules.len(),
            inert = handle.plan.is_inert(),
            "backup plan defined"
        );
        Ok(handle)
    }

    /// Replace the rule set of an existing plan wholesale.
    pub async fn update_plan(&self, name: &PlanName, rules: &[RuleSpec]) -> Result<PlanHandle> {
        let plan = self.build_plan(name, rules)?;
        let current = self.resolve(name)?;
        self.check_targets(&plan)?;

        let entity = format!("plan:{name}");
        retry_async(&self.retry, &entity, || async {
            call_with_timeout(
                self.retry.call_timeout,
                self.service.update_plan(&current.id, &plan),
            )
            .await
            .map_err(|err| Error::from_service(err, "update_plan", &entity))
        })
        .await?;

        let handle = PlanHandle {
            id: current.id,
            plan,
        };
        self.plans.write().insert(name.clone(), handle.clone());
        info!(
            target = "audit",
            action = "plan.update",
            plan = %name,
            plan_id = %handle.id,
            rules = handle.plan.rules.len(),
            "backup plan updated"
        );
        Ok(handle)
    }

    /// Define, update or leave the plan alone depending on what is registered.
    pub async fn ensure_plan(
        &self,
        name: &PlanName,
        rules: &[RuleSpec],
    ) -> Result<(PlanHandle, Change)> {
        let desired = self.build_plan(name, rules)?;
        match self.get(name) {
            Some(existing) if existing.plan == desired => {
                debug!(plan = %name, "plan unchanged");
                Ok((existing, Change::Unchanged))
            }
            Some(_) => Ok((self.update_plan(name, rules).await?, Change::Updated)),
            None => match self.define_plan(name, rules).await {
                Ok(handle) => Ok((handle, Change::Created)),
                // Known to the service but not to us: adopt it, then converge.
                Err(Error::AlreadyExists { .. }) if !self.contains(name) => {
                    let existing = self.lookup(name).await?;
                    self.plans.write().insert(name.clone(), existing.clone());
                    if existing.plan == desired {
                        debug!(plan = %name, plan_id = %existing.id, "adopted existing plan");
                        Ok((existing, Change::Unchanged))
                    } else {
                        Ok((self.update_plan(name, rules).await?, Change::Updated))
                    }
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Delete the plan. Existing recovery points stay governed by their vault.
    ///
    /// The service refuses while selections still reference the plan; use
    /// [`SelectionBinder::retire_plan`](crate::SelectionBinder::retire_plan)
    /// to remove both.
    pub async fn remove_plan(&self, name: &PlanName) -> Result<PlanHandle> {
        let current = self.resolve(name)?;
        let entity = format!("plan:{name}");
        retry_async(&self.retry, &entity, || async {
            match call_with_timeout(self.retry.call_timeout, self.service.delete_plan(&current.id))
                .await
            {
                Ok(()) | Err(ServiceError::PlanNotFound { .. }) => Ok(()),
                Err(err) => Err(Error::from_service(err, "delete_plan", &entity)),
            }
        })
        .await?;

        self.plans.write().remove(name);
        info!(
            target = "audit",
            action = "plan.remove",
            plan = %name,
            plan_id = %current.id,
            "backup plan removed"
        );
        Ok(current)
    }

    pub fn resolve(&self, name: &PlanName) -> Result<PlanHandle> {
        self.get(name).ok_or_else(|| Error::NotFound {
            entity: format!("plan:{name}"),
        })
    }

    pub fn get(&self, name: &PlanName) -> Option<PlanHandle> {
        self.plans.read().get(name).cloned()
    }

    pub fn contains(&self, name: &PlanName) -> bool {
        self.plans.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<PlanHandle> {
        self.plans.read().values().cloned().collect()
    }

    /// Load every plan the service already knows about.
    pub async fn hydrate(&self) -> Result<usize> {
        let plans = retry_async(&self.retry, "plans", || async {
            call_with_timeout(self.retry.call_timeout, self.service.list_plans())
                .await
                .map_err(|err| Error::from_service(err, "list_plans", "plans"))
        })
        .await?;
        let mut map = self.plans.write();
        for handle in &plans {
            map.insert(handle.plan.name.clone(), handle.clone());
        }
        Ok(plans.len())
    }

    /// Find a plan the service holds under `name`.
    async fn lookup(&self, name: &PlanName) -> Result<PlanHandle> {
        let entity = format!("plan:{name}");
        retry_async(&self.retry, &entity, || async {
            let plans = call_with_timeout(self.retry.call_timeout, self.service.list_plans())
                .await
                .map_err(|err| Error::from_service(err, "list_plans", &entity))?;
            plans
                .into_iter()
                .find(|handle| &handle.plan.name == name)
                .ok_or_else(|| Error::Transient {
                    operation: "list_plans",
                    entity: entity.clone(),
                    reason: "plan exists but is not yet visible".into(),
                })
        })
        .await
    }

    fn check_targets(&self, plan: &BackupPlan) -> Result<()> {
        for vault in plan.target_vaults() {
            if !self.registry.contains(vault) {
                return Err(Error::DependencyNotReady {
                    entity: format!("plan:{}", plan.name),
                    dependency: format!("vault:{vault}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackupService, Operation};
    use greentic_backup_spec::{DeploymentContext, ErrorClass, VaultName};

    async fn setup() -> (Arc<MemoryBackupService>, PolicyCatalog) {
        let ctx = DeploymentContext::new("123456789012", "eu-west-1").unwrap();
        let service = Arc::new(MemoryBackupService::new(ctx));
        let registry = Arc::new(VaultRegistry::new(
            service.clone(),
            RetryPolicy::immediate(3),
        ));
        registry
            .create_vault(&VaultName::new("vault-a").unwrap())
            .await
            .unwrap();
        let catalog = PolicyCatalog::new(service.clone(), registry, RetryPolicy::immediate(3));
        (service, catalog)
    }

    fn daily() -> PlanName {
        PlanName::new("daily_two_weeks").unwrap()
    }

    #[tokio::test]
    async fn define_valid_plan() {
        let (service, catalog) = setup().await;
        let handle = catalog
            .define_plan(&daily(), &[RuleSpec::new("0 3 * * ?", "vault-a", 14)])
            .await
            .unwrap();
        assert!(!handle.id.is_empty());
        assert_eq!(handle.plan.rules[0].retention.days(), 14);
        assert_eq!(service.calls(Operation::CreatePlan), 1);
    }

    #[tokio::test]
    async fn validation_happens_before_any_call() {
        let (service, catalog) = setup().await;
        let err = catalog
            .define_plan(&daily(), &[RuleSpec::new("0 3 * * ?", "vault-a", 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRetention { days: 0, .. }));

        let err = catalog
            .define_plan(&daily(), &[RuleSpec::new("not a cron", "vault-a", 14)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(service.calls(Operation::CreatePlan), 0);
    }

    #[tokio::test]
    async fn unknown_target_vault_is_dependency_not_ready() {
        let (service, catalog) = setup().await;
        let err = catalog
            .define_plan(&daily(), &[RuleSpec::new("0 3 * * ?", "vault-z", 14)])
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::DependencyNotReady);
        assert_eq!(service.calls(Operation::CreatePlan), 0);
    }

    #[tokio::test]
    async fn empty_plans_are_inert_but_valid() {
        let (_service, catalog) = setup().await;
        let handle = catalog.define_plan(&daily(), &[]).await.unwrap();
        assert!(handle.plan.is_inert());
    }

    #[tokio::test]
    async fn ensure_updates_wholesale_then_settles() {
        let (service, catalog) = setup().await;
        let rules = [RuleSpec::new("0 3 * * ?", "vault-a", 14)];
        let (_, change) = catalog.ensure_plan(&daily(), &rules).await.unwrap();
        assert_eq!(change, Change::Created);
        let (_, change) = catalog.ensure_plan(&daily(), &rules).await.unwrap();
        assert_eq!(change, Change::Unchanged);

        let overlapping = [
            RuleSpec::new("0 3 * * ?", "vault-a", 14),
            RuleSpec::new("0 */4 * * ?", "vault-a", 2),
        ];
        let (handle, change) = catalog.ensure_plan(&daily(), &overlapping).await.unwrap();
        assert_eq!(change, Change::Updated);
        assert_eq!(handle.plan.rules.len(), 2);
        assert_eq!(service.calls(Operation::CreatePlan), 1);
        assert_eq!(service.calls(Operation::UpdatePlan), 1);
        assert_eq!(
            service.plan_by_name(&daily()).unwrap().plan.rules.len(),
            2
        );
    }

    #[tokio::test]
    async fn define_twice_is_already_exists() {
        let (_service, catalog) = setup().await;
        catalog.define_plan(&daily(), &[]).await.unwrap();
        let err = catalog.define_plan(&daily(), &[]).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn define_adopts_plan_whose_reply_was_lost() {
        let (service, catalog) = setup().await;
        service.lose_reply_next(Operation::CreatePlan, 1);
        let handle = catalog
            .define_plan(&daily(), &[RuleSpec::new("0 3 * * ?", "vault-a", 14)])
            .await
            .unwrap();
        assert_eq!(service.plan_by_name(&daily()).unwrap(), handle);
        assert_eq!(service.calls(Operation::CreatePlan), 2);

        let (_, change) = catalog
            .ensure_plan(&daily(), &[RuleSpec::new("0 3 * * ?", "vault-a", 14)])
            .await
            .unwrap();
        assert_eq!(change, Change::Unchanged);
    }

    #[tokio::test]
    async fn ensure_updates_foreign_plan_with_the_same_name() {
        let (service, catalog) = setup().await;
        let other = PolicyCatalog::new(
            service.clone(),
            catalog.registry.clone(),
            RetryPolicy::immediate(3),
        );
        other
            .define_plan(&daily(), &[RuleSpec::new("0 4 * * ?", "vault-a", 7)])
            .await
            .unwrap();

        let rules = [RuleSpec::new("0 3 * * ?", "vault-a", 14)];
        let (handle, change) = catalog.ensure_plan(&daily(), &rules).await.unwrap();
        assert_eq!(change, Change::Updated);
        assert_eq!(service.plan_by_name(&daily()).unwrap(), handle);
        assert_eq!(service.calls(Operation::UpdatePlan), 1);
    }

    #[tokio::test]
    async fn remove_forgets_the_plan() {
        let (service, catalog) = setup().await;
        catalog.define_plan(&daily(), &[]).await.unwrap();
        catalog.remove_plan(&daily()).await.unwrap();
        assert!(!catalog.contains(&daily()));
        assert!(service.plan_by_name(&daily()).is_none());
    }
}
