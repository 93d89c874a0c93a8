use greentic_backup_core::{Change, Governance, GovernanceManifest, ReconcileOptions, RetryPolicy};
use greentic_backup_provider_dev::DevBackupService;
use greentic_backup_spec::{BackupService, DeploymentContext, VaultName};
use std::sync::Arc;
use tempfile::tempdir;

const MANIFEST: &str = r#"
vaults: [vault-a, vault-b]
plans:
  - name: daily_two_weeks
    rules:
      - { schedule: "0 3 * * ?", vault: vault-a, retention_days: 14 }
      - { schedule: "0 4 * * ?", vault: vault-b, retention_days: 30 }
selections:
  - name: sel-1
    plan: daily_two_weeks
    role: backup-reader
    conditions:
      - { key: backup_policy, operator: EQUALS, value: daily_two_weeks }
"#;

fn context() -> DeploymentContext {
    DeploymentContext::new("123456789012", "eu-west-1").unwrap()
}

#[tokio::test]
async fn separate_processes_converge_on_the_same_store() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("service.json");
    let manifest = GovernanceManifest::from_yaml_str(MANIFEST).unwrap();

    let first = {
        let service = Arc::new(DevBackupService::with_persistence(context(), &store).unwrap());
        let gov = Governance::builder(service, context())
            .retry(RetryPolicy::immediate(3))
            .build();
        gov.reconciler().hydrate().await.unwrap();
        gov.reconciler()
            .run_pass(&manifest, ReconcileOptions::default())
            .await
            .unwrap()
    };
    assert_eq!(first.outcomes.len(), 6);
    assert!(!first.is_noop());

    let service = Arc::new(DevBackupService::with_persistence(context(), &store).unwrap());
    let gov = Governance::builder(service.clone(), context())
        .retry(RetryPolicy::immediate(3))
        .build();
    gov.reconciler().hydrate().await.unwrap();
    let report = gov
        .reconciler()
        .run_pass(&manifest, ReconcileOptions::default())
        .await
        .unwrap();

    // The in-memory ledger is fresh, so protection is reapplied once; every
    // other entity is recognised from the store.
    let changed: Vec<String> = report
        .outcomes
        .iter()
        .filter(|outcome| outcome.change != Change::Unchanged)
        .map(|outcome| outcome.entity.to_string())
        .collect();
    assert_eq!(changed, ["protection:vault-a", "protection:vault-b"]);
    assert_eq!(service.list_vaults().await.unwrap().len(), 2);
    assert_eq!(service.list_plans().await.unwrap().len(), 1);
    assert!(
        service
            .access_policy(&VaultName::new("vault-b").unwrap())
            .is_some()
    );
}
