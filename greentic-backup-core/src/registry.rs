use crate::retry::{Created, RetryPolicy, call_with_timeout, create_with_retry, retry_async};
use greentic_backup_spec::{DynBackupService, Error, Result, VaultHandle, VaultName};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Identity and existence of the protected vaults.
///
/// A vault only enters the registry once the service has confirmed it exists.
pub struct VaultRegistry {
    service: DynBackupService,
    retry: RetryPolicy,
    vaults: RwLock<BTreeMap<VaultName, VaultHandle>>,
}

impl VaultRegistry {
    pub fn new(service: DynBackupService, retry: RetryPolicy) -> Self {
        Self {
            service,
            retry,
            vaults: RwLock::new(BTreeMap::new()),
        }
    }

    /// Provision a new vault; fails with [`Error::AlreadyExists`] if the name is taken.
    pub async fn create_vault(&self, name: &VaultName) -> Result<VaultHandle> {
        if self.vaults.read().contains_key(name) {
            return Err(Error::AlreadyExists {
                entity: format!("vault:{name}"),
            });
        }

        let handle = match self.provision(name).await? {
            Created::New(handle) => handle,
            // Our earlier attempt landed but its answer was lost.
            Created::Existing { after_retry: true } => self.describe(name).await?,
            Created::Existing { after_retry: false } => {
                return Err(Error::AlreadyExists {
                    entity: format!("vault:{name}"),
                });
            }
        };
        self.vaults.write().insert(name.clone(), handle.clone());
        info!(
            target = "audit",
            action = "vault.create",
            vault = %name,
            arn = %handle.arn,
            "vault created"
        );
        Ok(handle)
    }

    /// Idempotent variant of [`create_vault`](Self::create_vault): returns the
    /// existing vault when the name is already provisioned.
    pub async fn ensure_vault(&self, name: &VaultName) -> Result<(VaultHandle, bool)> {
        if let Some(existing) = self.vaults.read().get(name) {
            return Ok((existing.clone(), false));
        }

        let (handle, created) = match self.provision(name).await? {
            Created::New(handle) => (handle, true),
            Created::Existing { after_retry } => (self.describe(name).await?, after_retry),
        };
        self.vaults.write().insert(name.clone(), handle.clone());
        if created {
            info!(
                target = "audit",
                action = "vault.create",
                vault = %name,
                arn = %handle.arn,
                "vault created"
            );
        } else {
            debug!(vault = %name, "vault already provisioned");
        }
        Ok((handle, created))
    }

    pub fn resolve(&self, name: &VaultName) -> Result<VaultHandle> {
        self.vaults
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                entity: format!("vault:{name}"),
            })
    }

    pub fn contains(&self, name: &VaultName) -> bool {
        self.vaults.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<VaultHandle> {
        self.vaults.read().values().cloned().collect()
    }

    /// Load every vault the service already knows about.
    pub async fn hydrate(&self) -> Result<usize> {
        let vaults = retry_async(&self.retry, "vaults", || async {
            call_with_timeout(self.retry.call_timeout, self.service.list_vaults())
                .await
                .map_err(|err| Error::from_service(err, "list_vaults", "vaults"))
        })
        .await?;
        let mut map = self.vaults.write();
        for vault in &vaults {
            map.insert(vault.name.clone(), vault.clone());
        }
        Ok(vaults.len())
    }

    async fn provision(&self, name: &VaultName) -> Result<Created<VaultHandle>> {
        let entity = format!("vault:{name}");
        create_with_retry(&self.retry, "create_vault", &entity, || {
            self.service.create_vault(name)
        })
        .await
    }

    async fn describe(&self, name: &VaultName) -> Result<VaultHandle> {
        let entity = format!("vault:{name}");
        retry_async(&self.retry, &entity, || async {
            match call_with_timeout(self.retry.call_timeout, self.service.describe_vault(name))
                .await
            {
                Ok(Some(handle)) => Ok(handle),
                // Reported as existing but not visible yet; eventual consistency.
                Ok(None) => Err(Error::Transient {
                    operation: "describe_vault",
                    entity: entity.clone(),
                    reason: "vault exists but is not yet visible".into(),
                }),
                Err(err) => Err(Error::from_service(err, "describe_vault", &entity)),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackupService, Operation};
    use greentic_backup_spec::{DeploymentContext, ServiceError};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryBackupService>, VaultRegistry) {
        let ctx = DeploymentContext::new("123456789012", "eu-west-1").unwrap();
        let service = Arc::new(MemoryBackupService::new(ctx));
        let registry = VaultRegistry::new(service.clone(), RetryPolicy::immediate(3));
        (service, registry)
    }

    #[tokio::test]
    async fn create_then_resolve() {
        let (_service, registry) = setup();
        let name = VaultName::new("vault-a").unwrap();
        let handle = registry.create_vault(&name).await.unwrap();
        assert_eq!(registry.resolve(&name).unwrap(), handle);
        assert!(handle.arn.ends_with(":backup-vault:vault-a"));
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let (_service, registry) = setup();
        let name = VaultName::new("vault-a").unwrap();
        registry.create_vault(&name).await.unwrap();
        let err = registry.create_vault(&name).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn ensure_is_repeatable_and_adopts_remote_vaults() {
        let (service, registry) = setup();
        let name = VaultName::new("vault-a").unwrap();
        service.seed_vault(&name);

        let (first, created) = registry.ensure_vault(&name).await.unwrap();
        assert!(!created);
        let (second, created) = registry.ensure_vault(&name).await.unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(service.calls(Operation::CreateVault), 1);
    }

    #[tokio::test]
    async fn create_adopts_vault_whose_reply_was_lost() {
        let (service, registry) = setup();
        let name = VaultName::new("vault-a").unwrap();
        service.lose_reply_next(Operation::CreateVault, 1);

        let handle = registry.create_vault(&name).await.unwrap();
        assert_eq!(registry.resolve(&name).unwrap(), handle);
        assert_eq!(service.calls(Operation::CreateVault), 2);
        assert_eq!(service.calls(Operation::DescribeVault), 1);
    }

    #[tokio::test]
    async fn ensure_reports_created_when_reply_was_lost() {
        let (service, registry) = setup();
        let name = VaultName::new("vault-a").unwrap();
        service.lose_reply_next(Operation::CreateVault, 1);

        let (_, created) = registry.ensure_vault(&name).await.unwrap();
        assert!(created);
        let (_, created) = registry.ensure_vault(&name).await.unwrap();
        assert!(!created);
    }

    #[tokio::test]
    async fn resolve_unknown_is_not_found() {
        let (_service, registry) = setup();
        let err = registry
            .resolve(&VaultName::new("missing").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn quota_errors_are_fatal() {
        let (service, registry) = setup();
        service.fail_next(
            Operation::CreateVault,
            ServiceError::QuotaExceeded("100 vaults".into()),
            1,
        );
        let err = registry
            .create_vault(&VaultName::new("vault-a").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
        assert!(!registry.contains(&VaultName::new("vault-a").unwrap()));
    }
}
