//! One-shot reconciliation of a governance manifest.

use crate::binder::SelectionBinder;
use crate::catalog::PolicyCatalog;
use crate::enforcer::{ProtectionEnforcer, ProtectionStatus, ReconcileOutcome};
use crate::graph::Node;
use crate::manifest::{GovernanceManifest, PlanSpec, SelectionSpec};
use crate::registry::VaultRegistry;
use crate::report::{Change, PassError, PassReport, PlannedAction};
use greentic_backup_spec::{Error, PlanName, Result, SelectionName, VaultName};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Remove registered plans and selections the manifest no longer declares.
    pub prune: bool,
}

/// Drives the registry, enforcer, catalog and binder through a manifest in
/// dependency order.
pub struct Reconciler {
    registry: Arc<VaultRegistry>,
    enforcer: Arc<ProtectionEnforcer>,
    catalog: Arc<PolicyCatalog>,
    binder: Arc<SelectionBinder>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<VaultRegistry>,
        enforcer: Arc<ProtectionEnforcer>,
        catalog: Arc<PolicyCatalog>,
        binder: Arc<SelectionBinder>,
    ) -> Self {
        Self {
            registry,
            enforcer,
            catalog,
            binder,
        }
    }

    /// Load vaults, plans and selections already known to the service so a
    /// fresh process converges instead of recreating them.
    pub async fn hydrate(&self) -> Result<()> {
        let vaults = self.registry.hydrate().await?;
        let plans = self.catalog.hydrate().await?;
        let selections = self.binder.hydrate().await?;
        info!(vaults, plans, selections, "hydrated registered state");
        Ok(())
    }

    pub async fn run_pass(
        &self,
        manifest: &GovernanceManifest,
        options: ReconcileOptions,
    ) -> std::result::Result<PassReport, PassError> {
        let pass_id = Uuid::new_v4();
        let span = info_span!("reconcile_pass", %pass_id, prune = options.prune);
        self.run_pass_inner(pass_id, manifest, options)
            .instrument(span)
            .await
    }

    async fn run_pass_inner(
        &self,
        pass_id: Uuid,
        manifest: &GovernanceManifest,
        options: ReconcileOptions,
    ) -> std::result::Result<PassReport, PassError> {
        let mut report = PassReport::new(pass_id);
        let order = match self.plan_order(manifest) {
            Ok(order) => order,
            Err((entity, source)) => {
                return Err(PassError {
                    entity,
                    source,
                    partial: report,
                });
            }
        };

        for node in order {
            if let Err(source) = self.step(manifest, &node, &mut report).await {
                warn!(entity = %node, error = %source, "reconciliation pass aborted");
                return Err(PassError {
                    entity: Some(node),
                    source,
                    partial: report,
                });
            }
        }

        if options.prune
            && let Err((entity, source)) = self.prune(manifest, &mut report).await
        {
            return Err(PassError {
                entity: Some(entity),
                source,
                partial: report,
            });
        }

        info!(
            created = report.count(Change::Created),
            updated = report.count(Change::Updated),
            applied = report.count(Change::Applied),
            removed = report.count(Change::Removed),
            unchanged = report.count(Change::Unchanged),
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Actions the next pass would take, computed without external calls.
    pub fn preview(
        &self,
        manifest: &GovernanceManifest,
        options: ReconcileOptions,
    ) -> Result<Vec<PlannedAction>> {
        let order = self.plan_order(manifest).map_err(|(_, err)| err)?;
        let mut actions = Vec::new();
        for node in order {
            match node {
                Node::Vault(name) => {
                    if !self.registry.contains(&name) {
                        actions.push(PlannedAction::CreateVault { vault: name });
                    }
                }
                Node::Protection(name) => {
                    if !self.registry.contains(&name) {
                        actions.push(PlannedAction::ApplyProtection {
                            vault: name,
                            hash: None,
                        });
                    } else if let ProtectionStatus::Pending { desired, .. } =
                        self.enforcer.status(&name)?
                    {
                        actions.push(PlannedAction::ApplyProtection {
                            vault: name,
                            hash: Some(desired),
                        });
                    }
                }
                Node::Plan(name) => {
                    let declared = self.declared_plan(manifest, &name)?;
                    match self.catalog.get(&name) {
                        None => actions.push(PlannedAction::DefinePlan { plan: name }),
                        Some(existing) => {
                            if existing.plan != self.catalog.build_plan(&name, &declared.rules)? {
                                actions.push(PlannedAction::UpdatePlan { plan: name });
                            }
                        }
                    }
                }
                Node::Selection(name) => {
                    let rule = self.declared_selection(manifest, &name)?.to_rule()?;
                    match self.binder.needs_rebind(&rule) {
                        None => actions.push(PlannedAction::BindSelection { selection: name }),
                        Some(true) => {
                            actions.push(PlannedAction::RebindSelection { selection: name })
                        }
                        Some(false) => {}
                    }
                }
            }
        }

        if options.prune {
            let (selections, plans) = self.undeclared(manifest);
            actions.extend(
                selections
                    .into_iter()
                    .map(|selection| PlannedAction::RemoveSelection { selection }),
            );
            actions.extend(
                plans
                    .into_iter()
                    .map(|plan| PlannedAction::RemovePlan { plan }),
            );
        }
        Ok(actions)
    }

    /// Validate the manifest, check references that leave it, and order the
    /// nodes. Nothing here calls the service.
    fn plan_order(
        &self,
        manifest: &GovernanceManifest,
    ) -> std::result::Result<Vec<Node>, (Option<Node>, Error)> {
        manifest.validate().map_err(|err| (None, err))?;

        for plan in &manifest.plans {
            for rule in &plan.rules {
                let vault = VaultName::new(rule.vault.clone())
                    .map_err(|err| (Some(Node::Plan(plan.name.clone())), err))?;
                if !manifest.declares_vault(&vault) && !self.registry.contains(&vault) {
                    return Err((
                        Some(Node::Plan(plan.name.clone())),
                        Error::DependencyNotReady {
                            entity: format!("plan:{}", plan.name),
                            dependency: format!("vault:{vault}"),
                        },
                    ));
                }
            }
        }
        for selection in &manifest.selections {
            if manifest.plan(&selection.plan).is_none() && !self.catalog.contains(&selection.plan)
            {
                return Err((
                    Some(Node::Selection(selection.name.clone())),
                    Error::DependencyNotReady {
                        entity: format!("selection:{}", selection.name),
                        dependency: format!("plan:{}", selection.plan),
                    },
                ));
            }
        }

        manifest
            .graph()
            .topological_order()
            .map_err(|err| (None, err))
    }

    async fn step(
        &self,
        manifest: &GovernanceManifest,
        node: &Node,
        report: &mut PassReport,
    ) -> Result<()> {
        match node {
            Node::Vault(name) => {
                let (_, created) = self.registry.ensure_vault(name).await?;
                let change = if created {
                    Change::Created
                } else {
                    Change::Unchanged
                };
                report.record(node.clone(), change, None);
            }
            Node::Protection(name) => match self.enforcer.reconcile(name).await? {
                ReconcileOutcome::Applied { hash, attempts } => report.record(
                    node.clone(),
                    Change::Applied,
                    Some(format!("hash={hash} attempts={attempts}")),
                ),
                ReconcileOutcome::Unchanged { hash } => {
                    report.record(node.clone(), Change::Unchanged, Some(format!("hash={hash}")))
                }
            },
            Node::Plan(name) => {
                let declared = self.declared_plan(manifest, name)?;
                let (handle, change) = self.catalog.ensure_plan(name, &declared.rules).await?;
                report.record(node.clone(), change, Some(format!("id={}", handle.id)));
            }
            Node::Selection(name) => {
                let rule = self.declared_selection(manifest, name)?.to_rule()?;
                let (handle, change) = self.binder.ensure_selection(rule).await?;
                report.record(node.clone(), change, Some(format!("id={}", handle.id)));
            }
        }
        Ok(())
    }

    async fn prune(
        &self,
        manifest: &GovernanceManifest,
        report: &mut PassReport,
    ) -> std::result::Result<(), (Node, Error)> {
        let (selections, plans) = self.undeclared(manifest);
        for selection in selections {
            let node = Node::Selection(selection.clone());
            match self.binder.unbind(&selection).await {
                Ok(_) => report.record(node, Change::Removed, None),
                Err(err) => return Err((node, err)),
            }
        }
        for plan in plans {
            let node = Node::Plan(plan.clone());
            match self.binder.retire_plan(&plan).await {
                Ok(_) => report.record(node, Change::Removed, None),
                Err(err) => return Err((node, err)),
            }
        }
        Ok(())
    }

    /// Registered selections and plans the manifest does not declare.
    fn undeclared(
        &self,
        manifest: &GovernanceManifest,
    ) -> (Vec<SelectionName>, Vec<PlanName>) {
        let declared_selections: BTreeSet<_> =
            manifest.selections.iter().map(|s| &s.name).collect();
        let declared_plans: BTreeSet<_> = manifest.plans.iter().map(|p| &p.name).collect();
        let selections = self
            .binder
            .list()
            .into_iter()
            .map(|handle| handle.rule.name)
            .filter(|name| !declared_selections.contains(name))
            .collect();
        let plans = self
            .catalog
            .list()
            .into_iter()
            .map(|handle| handle.plan.name)
            .filter(|name| !declared_plans.contains(name))
            .collect();
        (selections, plans)
    }

    fn declared_plan<'m>(
        &self,
        manifest: &'m GovernanceManifest,
        name: &PlanName,
    ) -> Result<&'m PlanSpec> {
        manifest.plan(name).ok_or_else(|| Error::NotFound {
            entity: format!("plan:{name}"),
        })
    }

    fn declared_selection<'m>(
        &self,
        manifest: &'m GovernanceManifest,
        name: &SelectionName,
    ) -> Result<&'m SelectionSpec> {
        manifest.selection(name).ok_or_else(|| Error::NotFound {
            entity: format!("selection:{name}"),
        })
    }
}
