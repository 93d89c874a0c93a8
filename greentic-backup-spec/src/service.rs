use crate::document::ProtectionPolicyDocument;
use crate::error::ServiceResult;
use crate::names::VaultName;
use crate::plan::{BackupPlan, PlanHandle};
use crate::selection::{SelectionHandle, SelectionRule};
use crate::vault::VaultHandle;
use async_trait::async_trait;
use std::sync::Arc;

/// Contract of the external backup service.
///
/// Calls are not assumed to be idempotent at the transport level; callers are
/// responsible for deduplicating side effects.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Provision a vault. Fails with `AlreadyExists` when the name is taken.
    async fn create_vault(&self, name: &VaultName) -> ServiceResult<VaultHandle>;

    async fn describe_vault(&self, name: &VaultName) -> ServiceResult<Option<VaultHandle>>;

    async fn list_vaults(&self) -> ServiceResult<Vec<VaultHandle>>;

    /// Replace the vault's access policy. Returns whether the service confirmed
    /// the change.
    async fn put_vault_access_policy(
        &self,
        vault: &VaultHandle,
        document: &ProtectionPolicyDocument,
    ) -> ServiceResult<bool>;

    /// Register a plan and return its identifier.
    async fn create_plan(&self, plan: &BackupPlan) -> ServiceResult<String>;

    /// Replace the full rule set of an existing plan.
    async fn update_plan(&self, plan_id: &str, plan: &BackupPlan) -> ServiceResult<()>;

    async fn delete_plan(&self, plan_id: &str) -> ServiceResult<()>;

    async fn list_plans(&self) -> ServiceResult<Vec<PlanHandle>>;

    /// Register a selection against a plan and return its identifier.
    async fn create_selection(
        &self,
        plan_id: &str,
        rule: &SelectionRule,
        role_arn: &str,
    ) -> ServiceResult<String>;

    async fn delete_selection(&self, plan_id: &str, selection_id: &str) -> ServiceResult<()>;

    async fn list_selections(&self, plan_id: &str) -> ServiceResult<Vec<SelectionHandle>>;
}

/// Shared, type-erased service handle.
pub type DynBackupService = Arc<dyn BackupService>;

#[async_trait]
impl<T> BackupService for Box<T>
where
    T: BackupService + ?Sized,
{
    async fn create_vault(&self, name: &VaultName) -> ServiceResult<VaultHandle> {
        (**self).create_vault(name).await
    }

    async fn describe_vault(&self, name: &VaultName) -> ServiceResult<Option<VaultHandle>> {
        (**self).describe_vault(name).await
    }

    async fn list_vaults(&self) -> ServiceResult<Vec<VaultHandle>> {
        (**self).list_vaults().await
    }

    async fn put_vault_access_policy(
        &self,
        vault: &VaultHandle,
        document: &ProtectionPolicyDocument,
    ) -> ServiceResult<bool> {
        (**self).put_vault_access_policy(vault, document).await
    }

    async fn create_plan(&self, plan: &BackupPlan) -> ServiceResult<String> {
        (**self).create_plan(plan).await
    }

    async fn update_plan(&self, plan_id: &str, plan: &BackupPlan) -> ServiceResult<()> {
        (**self).update_plan(plan_id, plan).await
    }

    async fn delete_plan(&self, plan_id: &str) -> ServiceResult<()> {
        (**self).delete_plan(plan_id).await
    }

    async fn list_plans(&self) -> ServiceResult<Vec<PlanHandle>> {
        (**self).list_plans().await
    }

    async fn create_selection(
        &self,
        plan_id: &str,
        rule: &SelectionRule,
        role_arn: &str,
    ) -> ServiceResult<String> {
        (**self).create_selection(plan_id, rule, role_arn).await
    }

    async fn delete_selection(&self, plan_id: &str, selection_id: &str) -> ServiceResult<()> {
        (**self).delete_selection(plan_id, selection_id).await
    }

    async fn list_selections(&self, plan_id: &str) -> ServiceResult<Vec<SelectionHandle>> {
        (**self).list_selections(plan_id).await
    }
}

#[async_trait]
impl<T> BackupService for Arc<T>
where
    T: BackupService + ?Sized,
{
    async fn create_vault(&self, name: &VaultName) -> ServiceResult<VaultHandle> {
        (**self).create_vault(name).await
    }

    async fn describe_vault(&self, name: &VaultName) -> ServiceResult<Option<VaultHandle>> {
        (**self).describe_vault(name).await
    }

    async fn list_vaults(&self) -> ServiceResult<Vec<VaultHandle>> {
        (**self).list_vaults().await
    }

    async fn put_vault_access_policy(
        &self,
        vault: &VaultHandle,
        document: &ProtectionPolicyDocument,
    ) -> ServiceResult<bool> {
        (**self).put_vault_access_policy(vault, document).await
    }

    async fn create_plan(&self, plan: &BackupPlan) -> ServiceResult<String> {
        (**self).create_plan(plan).await
    }

    async fn update_plan(&self, plan_id: &str, plan: &BackupPlan) -> ServiceResult<()> {
        (**self).update_plan(plan_id, plan).await
    }

    async fn delete_plan(&self, plan_id: &str) -> ServiceResult<()> {
        (**self).delete_plan(plan_id).await
    }

    async fn list_plans(&self) -> ServiceResult<Vec<PlanHandle>> {
        (**self).list_plans().await
    }

    async fn create_selection(
        &self,
        plan_id: &str,
        rule: &SelectionRule,
        role_arn: &str,
    ) -> ServiceResult<String> {
        (**self).create_selection(plan_id, rule, role_arn).await
    }

    async fn delete_selection(&self, plan_id: &str, selection_id: &str) -> ServiceResult<()> {
        (**self).delete_selection(plan_id, selection_id).await
    }

    async fn list_selections(&self, plan_id: &str) -> ServiceResult<Vec<SelectionHandle>> {
        (**self).list_selections(plan_id).await
    }
}
