//! Vault protection enforcement.
//!
//! The access-policy call is not idempotent at the transport level, so the
//! enforcer guards it with the content hash of the last confirmed document.
//! `reconcile` only calls the service when the desired document differs from
//! what the ledger says was applied, and the ledger is only written after the
//! service confirmed the change. An interrupted apply therefore leaves the
//! vault pending and the next pass applies it again.

use crate::ledger::{AppliedProtection, ProtectionLedger};
use crate::registry::VaultRegistry;
use crate::retry::{RetryPolicy, call_with_timeout, retry_async};
use chrono::{DateTime, Utc};
use greentic_backup_spec::{
    DocumentHash, DynBackupService, Error, ProtectionPolicyDocument, Result, ServiceError,
    VaultHandle, VaultName,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunables for the generated protection document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionSettings {
    /// Denied in addition to the mandatory actions.
    #[serde(default)]
    pub extra_denied_actions: Vec<String>,
}

/// Result of a successful [`ProtectionEnforcer::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The document was sent and confirmed.
    Applied { hash: DocumentHash, attempts: u32 },
    /// The ledger already holds this document; nothing was sent.
    Unchanged { hash: DocumentHash },
}

impl ReconcileOutcome {
    pub fn hash(&self) -> &DocumentHash {
        match self {
            ReconcileOutcome::Applied { hash, .. } | ReconcileOutcome::Unchanged { hash } => hash,
        }
    }
}

/// Protection state of a vault relative to the desired document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectionStatus {
    InSync {
        hash: DocumentHash,
        applied_at: DateTime<Utc>,
    },
    /// Never applied, or the desired document drifted from the applied one.
    Pending {
        desired: DocumentHash,
        applied: Option<DocumentHash>,
    },
}

impl ProtectionStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ProtectionStatus::Pending { .. })
    }
}

pub struct ProtectionEnforcer {
    registry: Arc<VaultRegistry>,
    service: DynBackupService,
    ledger: Arc<dyn ProtectionLedger>,
    settings: ProtectionSettings,
    retry: RetryPolicy,
    locks: Mutex<HashMap<VaultName, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProtectionEnforcer {
    pub fn new(
        registry: Arc<VaultRegistry>,
        service: DynBackupService,
        ledger: Arc<dyn ProtectionLedger>,
        settings: ProtectionSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            service,
            ledger,
            settings,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ProtectionSettings {
        &self.settings
    }

    /// Deterministic for a given vault and settings.
    pub fn build_document(&self, vault: &VaultHandle) -> ProtectionPolicyDocument {
        ProtectionPolicyDocument::deny_destructive(vault, &self.settings.extra_denied_actions)
    }

    /// Send `document` once. `applied: false` counts as an unconfirmed,
    /// retryable outcome.
    pub async fn apply(&self, vault: &VaultHandle, document: &ProtectionPolicyDocument) -> Result<()> {
        let entity = format!("protection:{}", vault.name);
        let confirmed = call_with_timeout(
            self.retry.call_timeout,
            self.service.put_vault_access_policy(vault, document),
        )
        .await
        .map_err(|err| Error::from_service(err, "put_vault_access_policy", &entity))?;
        if confirmed {
            Ok(())
        } else {
            Err(Error::from_service(
                ServiceError::NotConfirmed,
                "put_vault_access_policy",
                &entity,
            ))
        }
    }

    /// Converge the vault's access policy to the desired document.
    pub async fn reconcile(&self, name: &VaultName) -> Result<ReconcileOutcome> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let vault = self.vault(name)?;
        let document = self.build_document(&vault);
        let hash = document.content_hash()?;

        if let Some(applied) = self.ledger.applied(name)?
            && applied.document_hash == hash
            && applied.vault_arn == vault.arn
        {
            debug!(vault = %name, hash = %hash, "protection unchanged");
            return Ok(ReconcileOutcome::Unchanged { hash });
        }

        let entity = format!("protection:{name}");
        let mut attempts = 0u32;
        let result = retry_async(&self.retry, &entity, || {
            attempts += 1;
            self.apply(&vault, &document)
        })
        .await;
        if let Err(err) = result {
            warn!(vault = %name, attempts, error = %err, "protection left pending");
            return Err(err);
        }

        self.ledger.record(AppliedProtection {
            vault: name.clone(),
            vault_arn: vault.arn.clone(),
            document_hash: hash.clone(),
            applied_at: Utc::now(),
        })?;
        info!(
            target = "audit",
            action = "protection.apply",
            vault = %name,
            arn = %vault.arn,
            hash = %hash,
            attempts,
            "vault protection applied"
        );
        Ok(ReconcileOutcome::Applied { hash, attempts })
    }

    /// Reconcile every registered vault, returning per-vault results.
    pub async fn reconcile_all(&self) -> Vec<(VaultName, Result<ReconcileOutcome>)> {
        let mut results = Vec::new();
        for vault in self.registry.list() {
            let outcome = self.reconcile(&vault.name).await;
            results.push((vault.name, outcome));
        }
        results
    }

    /// Compare the desired document with the ledger without calling the service.
    pub fn status(&self, name: &VaultName) -> Result<ProtectionStatus> {
        let vault = self.vault(name)?;
        let desired = self.build_document(&vault).content_hash()?;
        match self.ledger.applied(name)? {
            Some(applied) if applied.document_hash == desired && applied.vault_arn == vault.arn => {
                Ok(ProtectionStatus::InSync {
                    hash: desired,
                    applied_at: applied.applied_at,
                })
            }
            other => Ok(ProtectionStatus::Pending {
                desired,
                applied: other.map(|entry| entry.document_hash),
            }),
        }
    }

    fn vault(&self, name: &VaultName) -> Result<VaultHandle> {
        self.registry
            .resolve(name)
            .map_err(|_| Error::DependencyNotReady {
                entity: format!("protection:{name}"),
                dependency: format!("vault:{name}"),
            })
    }

    fn lock_for(&self, name: &VaultName) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(name.clone()).or_default().clone()
    }
}
