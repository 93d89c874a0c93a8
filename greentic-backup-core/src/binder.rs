use crate::catalog::PolicyCatalog;
use crate::report::Change;
use crate::retry::{Created, RetryPolicy, call_with_timeout, create_with_retry, retry_async};
use greentic_backup_spec::{
    DeploymentContext, DynBackupService, Error, PlanName, Result, SelectionHandle, SelectionName,
    SelectionRule, ServiceError, TagCondition, plans_covering,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Binds tagged resources to plans.
///
/// Predicates are evaluated by the backup service at each firing; the binder
/// only declares them and rejects structurally broken ones.
pub struct SelectionBinder {
    service: DynBackupService,
    catalog: Arc<PolicyCatalog>,
    context: DeploymentContext,
    retry: RetryPolicy,
    selections: RwLock<BTreeMap<SelectionName, SelectionHandle>>,
}

impl SelectionBinder {
    pub fn new(
        service: DynBackupService,
        catalog: Arc<PolicyCatalog>,
        context: DeploymentContext,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            catalog,
            context,
            retry,
            selections: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn bind_selection(
        &self,
        name: SelectionName,
        plan: &PlanName,
        execution_role: &str,
        predicate: Vec<TagCondition>,
    ) -> Result<SelectionHandle> {
        let rule = SelectionRule::new(name, plan.clone(), execution_role, predicate)?;
        self.bind(rule).await
    }

    /// Register an already validated rule.
    pub async fn bind(&self, rule: SelectionRule) -> Result<SelectionHandle> {
        let entity = format!("selection:{}", rule.name);
        if self.selections.read().contains_key(&rule.name) {
            return Err(Error::AlreadyExists { entity });
        }
        let plan = self
            .catalog
            .get(&rule.plan)
            .ok_or_else(|| Error::DependencyNotReady {
                entity: entity.clone(),
                dependency: format!("plan:{}", rule.plan),
            })?;
        let role_arn = self.context.role_arn(&rule.execution_role);

        let created = create_with_retry(&self.retry, "create_selection", &entity, || {
            self.service.create_selection(&plan.id, &rule, &role_arn)
        })
        .await?;
        let handle = match created {
            Created::New(id) => SelectionHandle {
                id,
                plan_id: plan.id,
                role_arn,
                rule,
            },
            Created::Existing { after_retry: true } => {
                let existing = self.lookup(&plan.id, &rule.name).await?;
                if existing.rule != rule || existing.role_arn != role_arn {
                    return Err(Error::AlreadyExists { entity });
                }
                debug!(
                    selection = %rule.name,
                    selection_id = %existing.id,
                    "adopted selection created by an unanswered attempt"
                );
                existing
            }
            Created::Existing { after_retry: false } => {
                return Err(Error::AlreadyExists { entity });
            }
        };
        self.selections
            .write()
            .insert(handle.rule.name.clone(), handle.clone());
        info!(
            target = "audit",
            action = "selection.bind",
            selection = %handle.rule.name,
            plan = %handle.rule.plan,
            role = %handle.role_arn,
            conditions = handle.rule.conditions.len(),
            "selection bound"
        );
        Ok(handle)
    }

    /// Converge a selection. Selections are immutable on the service side, so
    /// a changed one is removed and bound again.
    pub async fn ensure_selection(&self, rule: SelectionRule) -> Result<(SelectionHandle, Change)> {
        let Some(existing) = self.get(&rule.name) else {
            return self.bind_or_adopt(rule).await;
        };
        let plan_id = self.catalog.get(&rule.plan).map(|plan| plan.id);
        if existing.rule == rule
            && plan_id.as_deref() == Some(existing.plan_id.as_str())
            && existing.role_arn == self.context.role_arn(&rule.execution_role)
        {
            debug!(selection = %rule.name, "selection unchanged");
            return Ok((existing, Change::Unchanged));
        }
        self.unbind(&rule.name).await?;
        Ok((self.bind(rule).await?, Change::Updated))
    }

    async fn bind_or_adopt(&self, rule: SelectionRule) -> Result<(SelectionHandle, Change)> {
        match self.bind(rule.clone()).await {
            Ok(handle) => Ok((handle, Change::Created)),
            // Known to the service but not to us: adopt it, then converge.
            Err(Error::AlreadyExists { .. }) if self.get(&rule.name).is_none() => {
                let plan = self.catalog.resolve(&rule.plan)?;
                let existing = self.lookup(&plan.id, &rule.name).await?;
                self.selections
                    .write()
                    .insert(rule.name.clone(), existing.clone());
                if existing.rule == rule
                    && existing.role_arn == self.context.role_arn(&rule.execution_role)
                {
                    debug!(selection = %rule.name, "adopted existing selection");
                    return Ok((existing, Change::Unchanged));
                }
                self.unbind(&rule.name).await?;
                Ok((self.bind(rule).await?, Change::Updated))
            }
            Err(err) => Err(err),
        }
    }

    /// Whether `rule` differs from what is bound under its name.
    pub fn needs_rebind(&self, rule: &SelectionRule) -> Option<bool> {
        self.get(&rule.name).map(|existing| {
            existing.rule != *rule
                || existing.role_arn != self.context.role_arn(&rule.execution_role)
        })
    }

    pub async fn unbind(&self, name: &SelectionName) -> Result<SelectionHandle> {
        let handle = self.get(name).ok_or_else(|| Error::NotFound {
            entity: format!("selection:{name}"),
        })?;
        let entity = format!("selection:{name}");
        retry_async(&self.retry, &entity, || async {
            match call_with_timeout(
                self.retry.call_timeout,
                self.service.delete_selection(&handle.plan_id, &handle.id),
            )
            .await
            {
                Ok(()) | Err(ServiceError::NotFound { .. }) => Ok(()),
                Err(err) => Err(Error::from_service(err, "delete_selection", &entity)),
            }
        })
        .await?;

        self.selections.write().remove(name);
        info!(
            target = "audit",
            action = "selection.unbind",
            selection = %name,
            plan = %handle.rule.plan,
            "selection removed"
        );
        Ok(handle)
    }

    /// Remove every selection of `plan`, then the plan itself.
    pub async fn retire_plan(&self, plan: &PlanName) -> Result<Vec<SelectionName>> {
        let mut removed = Vec::new();
        for selection in self.selections_for_plan(plan) {
            self.unbind(&selection.rule.name).await?;
            removed.push(selection.rule.name);
        }
        self.catalog.remove_plan(plan).await?;
        Ok(removed)
    }

    pub fn selections_for_plan(&self, plan: &PlanName) -> Vec<SelectionHandle> {
        self.selections
            .read()
            .values()
            .filter(|handle| &handle.rule.plan == plan)
            .cloned()
            .collect()
    }

    /// Plans that would protect a resource carrying `tags`. Every matching
    /// plan applies independently.
    pub fn plans_covering(&self, tags: &BTreeMap<String, String>) -> Vec<PlanName> {
        let selections = self.selections.read();
        plans_covering(selections.values().map(|handle| &handle.rule), tags)
    }

    pub fn get(&self, name: &SelectionName) -> Option<SelectionHandle> {
        self.selections.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<SelectionHandle> {
        self.selections.read().values().cloned().collect()
    }

    /// Find the selection the service holds under `name` for `plan_id`.
    async fn lookup(&self, plan_id: &str, name: &SelectionName) -> Result<SelectionHandle> {
        let entity = format!("selection:{name}");
        retry_async(&self.retry, &entity, || async {
            let selections = call_with_timeout(
                self.retry.call_timeout,
                self.service.list_selections(plan_id),
            )
            .await
            .map_err(|err| Error::from_service(err, "list_selections", &entity))?;
            selections
                .into_iter()
                .find(|handle| &handle.rule.name == name)
                .ok_or_else(|| Error::Transient {
                    operation: "list_selections",
                    entity: entity.clone(),
                    reason: "selection exists but is not yet visible".into(),
                })
        })
        .await
    }

    /// Load the selections of every plan the catalog knows about.
    pub async fn hydrate(&self) -> Result<usize> {
        let mut loaded = 0;
        for plan in self.catalog.list() {
            let entity = format!("plan:{}", plan.plan.name);
            let selections = retry_async(&self.retry, &entity, || async {
                call_with_timeout(
                    self.retry.call_timeout,
                    self.service.list_selections(&plan.id),
                )
                .await
                .map_err(|err| Error::from_service(err, "list_selections", &entity))
            })
            .await?;
            let mut map = self.selections.write();
            for handle in selections {
                map.insert(handle.rule.name.clone(), handle);
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackupService, Operation};
    use crate::registry::VaultRegistry;
    use greentic_backup_spec::{ErrorClass, RuleSpec, VaultName};

    struct Fixture {
        service: Arc<MemoryBackupService>,
        catalog: Arc<PolicyCatalog>,
        binder: SelectionBinder,
    }

    async fn setup() -> Fixture {
        let ctx = DeploymentContext::new("123456789012", "eu-west-1").unwrap();
        let service = Arc::new(MemoryBackupService::new(ctx.clone()));
        let retry = RetryPolicy::immediate(3);
        let registry = Arc::new(VaultRegistry::new(service.clone(), retry.clone()));
        registry
            .create_vault(&VaultName::new("vault-a").unwrap())
            .await
            .unwrap();
        let catalog = Arc::new(PolicyCatalog::new(service.clone(), registry, retry.clone()));
        let binder = SelectionBinder::new(service.clone(), catalog.clone(), ctx, retry);
        Fixture {
            service,
            catalog,
            binder,
        }
    }

    fn plan(name: &str) -> PlanName {
        PlanName::new(name).unwrap()
    }

    fn sel(name: &str) -> SelectionName {
        SelectionName::new(name).unwrap()
    }

    fn tagged(value: &str) -> Vec<TagCondition> {
        vec![TagCondition::string_equals("backup_policy", value)]
    }

    #[tokio::test]
    async fn binding_before_plan_is_dependency_not_ready() {
        let fx = setup().await;
        let err = fx
            .binder
            .bind_selection(
                sel("sel-1"),
                &plan("daily_two_weeks"),
                "r1",
                tagged("daily_two_weeks"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::DependencyNotReady);
        assert_eq!(fx.service.calls(Operation::CreateSelection), 0);
    }

    #[tokio::test]
    async fn empty_predicate_fails_fast() {
        let fx = setup().await;
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        let err = fx
            .binder
            .bind_selection(sel("sel-1"), &plan("daily"), "r1", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPredicate { .. }));
        assert_eq!(fx.service.calls(Operation::CreateSelection), 0);
    }

    #[tokio::test]
    async fn bare_roles_are_expanded_to_arns() {
        let fx = setup().await;
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        let handle = fx
            .binder
            .bind_selection(sel("sel-1"), &plan("daily"), "backup-reader", tagged("daily"))
            .await
            .unwrap();
        assert_eq!(handle.role_arn, "arn:aws:iam::123456789012:role/backup-reader");
    }

    #[tokio::test]
    async fn unknown_role_is_reported() {
        let fx = setup().await;
        fx.service
            .restrict_roles(["arn:aws:iam::123456789012:role/known"]);
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        let err = fx
            .binder
            .bind_selection(sel("sel-1"), &plan("daily"), "unknown", tagged("daily"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RoleNotFound { .. }));
    }

    #[tokio::test]
    async fn overlapping_selections_protect_under_every_plan() {
        let fx = setup().await;
        let rules = [RuleSpec::new("0 3 * * ?", "vault-a", 14)];
        fx.catalog.define_plan(&plan("daily"), &rules).await.unwrap();
        fx.catalog.define_plan(&plan("weekly"), &rules).await.unwrap();
        fx.binder
            .bind_selection(sel("sel-daily"), &plan("daily"), "r1", tagged("gold"))
            .await
            .unwrap();
        fx.binder
            .bind_selection(
                sel("sel-weekly"),
                &plan("weekly"),
                "r1",
                vec![TagCondition::string_equals("env", "prod")],
            )
            .await
            .unwrap();

        let tags: BTreeMap<String, String> = [
            ("backup_policy".to_string(), "gold".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]
        .into();
        assert_eq!(
            fx.binder.plans_covering(&tags),
            vec![plan("daily"), plan("weekly")]
        );
    }

    #[tokio::test]
    async fn changed_selection_is_rebound() {
        let fx = setup().await;
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        let rule = SelectionRule::new(sel("sel-1"), plan("daily"), "r1", tagged("a")).unwrap();
        let (_, change) = fx.binder.ensure_selection(rule.clone()).await.unwrap();
        assert_eq!(change, Change::Created);
        let (_, change) = fx.binder.ensure_selection(rule).await.unwrap();
        assert_eq!(change, Change::Unchanged);

        let changed = SelectionRule::new(sel("sel-1"), plan("daily"), "r1", tagged("b")).unwrap();
        let (handle, change) = fx.binder.ensure_selection(changed).await.unwrap();
        assert_eq!(change, Change::Updated);
        assert_eq!(handle.rule.conditions[0].value, "b");
        assert_eq!(fx.service.selection_count(), 1);
        assert_eq!(fx.service.calls(Operation::DeleteSelection), 1);
    }

    #[tokio::test]
    async fn bind_adopts_selection_whose_reply_was_lost() {
        let fx = setup().await;
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        fx.service.lose_reply_next(Operation::CreateSelection, 1);

        let rule = SelectionRule::new(sel("sel-1"), plan("daily"), "r1", tagged("a")).unwrap();
        let (handle, change) = fx.binder.ensure_selection(rule.clone()).await.unwrap();
        assert_eq!(change, Change::Created);
        assert_eq!(fx.binder.get(&sel("sel-1")), Some(handle));
        assert_eq!(fx.service.selection_count(), 1);
        assert_eq!(fx.service.calls(Operation::CreateSelection), 2);

        let (_, change) = fx.binder.ensure_selection(rule).await.unwrap();
        assert_eq!(change, Change::Unchanged);
    }

    #[tokio::test]
    async fn foreign_selection_with_the_same_name_is_rebound() {
        let fx = setup().await;
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        let ctx = DeploymentContext::new("123456789012", "eu-west-1").unwrap();
        let other = SelectionBinder::new(
            fx.service.clone(),
            fx.catalog.clone(),
            ctx,
            RetryPolicy::immediate(3),
        );
        other
            .bind_selection(sel("sel-1"), &plan("daily"), "r1", tagged("old"))
            .await
            .unwrap();

        let rule = SelectionRule::new(sel("sel-1"), plan("daily"), "r1", tagged("new")).unwrap();
        let (handle, change) = fx.binder.ensure_selection(rule).await.unwrap();
        assert_eq!(change, Change::Updated);
        assert_eq!(handle.rule.conditions[0].value, "new");
        assert_eq!(fx.service.selection_count(), 1);
    }

    #[tokio::test]
    async fn retiring_a_plan_cascades() {
        let fx = setup().await;
        fx.catalog.define_plan(&plan("daily"), &[]).await.unwrap();
        fx.binder
            .bind_selection(sel("sel-1"), &plan("daily"), "r1", tagged("a"))
            .await
            .unwrap();
        fx.binder
            .bind_selection(sel("sel-2"), &plan("daily"), "r1", tagged("b"))
            .await
            .unwrap();

        let removed = fx.binder.retire_plan(&plan("daily")).await.unwrap();
        assert_eq!(removed, vec![sel("sel-1"), sel("sel-2")]);
        assert!(fx.binder.list().is_empty());
        assert!(!fx.catalog.contains(&plan("daily")));
        assert_eq!(fx.service.selection_count(), 0);
    }
}
