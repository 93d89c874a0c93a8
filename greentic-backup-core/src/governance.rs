use crate::binder::SelectionBinder;
use crate::catalog::PolicyCatalog;
use crate::enforcer::{ProtectionEnforcer, ProtectionSettings};
use crate::ledger::{MemoryLedger, ProtectionLedger};
use crate::reconcile::Reconciler;
use crate::registry::VaultRegistry;
use crate::retry::RetryPolicy;
use crate::watch::spawn_protection_watch;
use greentic_backup_spec::{DeploymentContext, DynBackupService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder wiring the four components over one backup service.
pub struct GovernanceBuilder {
    service: DynBackupService,
    context: DeploymentContext,
    ledger: Option<Arc<dyn ProtectionLedger>>,
    retry: RetryPolicy,
    protection: ProtectionSettings,
}

impl GovernanceBuilder {
    pub fn new(service: DynBackupService, context: DeploymentContext) -> Self {
        Self {
            service,
            context,
            ledger: None,
            retry: RetryPolicy::default(),
            protection: ProtectionSettings::default(),
        }
    }

    pub fn ledger(mut self, ledger: Arc<dyn ProtectionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn protection(mut self, settings: ProtectionSettings) -> Self {
        self.protection = settings;
        self
    }

    pub fn build(self) -> Governance {
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryLedger::new()));
        let registry = Arc::new(VaultRegistry::new(self.service.clone(), self.retry.clone()));
        let enforcer = Arc::new(ProtectionEnforcer::new(
            registry.clone(),
            self.service.clone(),
            ledger,
            self.protection,
            self.retry.clone(),
        ));
        let catalog = Arc::new(PolicyCatalog::new(
            self.service.clone(),
            registry.clone(),
            self.retry.clone(),
        ));
        let binder = Arc::new(SelectionBinder::new(
            self.service,
            catalog.clone(),
            self.context.clone(),
            self.retry,
        ));
        let reconciler = Reconciler::new(
            registry.clone(),
            enforcer.clone(),
            catalog.clone(),
            binder.clone(),
        );
        Governance {
            context: self.context,
            registry,
            enforcer,
            catalog,
            binder,
            reconciler,
        }
    }
}

/// The assembled governance components.
pub struct Governance {
    context: DeploymentContext,
    registry: Arc<VaultRegistry>,
    enforcer: Arc<ProtectionEnforcer>,
    catalog: Arc<PolicyCatalog>,
    binder: Arc<SelectionBinder>,
    reconciler: Reconciler,
}

impl Governance {
    pub fn builder(service: DynBackupService, context: DeploymentContext) -> GovernanceBuilder {
        GovernanceBuilder::new(service, context)
    }

    pub fn context(&self) -> &DeploymentContext {
        &self.context
    }

    pub fn registry(&self) -> &Arc<VaultRegistry> {
        &self.registry
    }

    pub fn enforcer(&self) -> &Arc<ProtectionEnforcer> {
        &self.enforcer
    }

    pub fn catalog(&self) -> &Arc<PolicyCatalog> {
        &self.catalog
    }

    pub fn binder(&self) -> &Arc<SelectionBinder> {
        &self.binder
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Start the periodic protection drift watch.
    pub fn watch_protection(&self, every: Duration) -> CancellationToken {
        spawn_protection_watch(self.enforcer.clone(), every)
    }
}
