use greentic_backup_spec::{
    BackupPlan, DeploymentContext, Error, ProtectionPolicyDocument, RuleSpec, SelectionRule,
    TagCondition, VaultHandle, VaultName,
};

#[test]
fn document_for_any_vault_carries_mandatory_denies() {
    let ctx = DeploymentContext::new("123456789012", "us-east-1").unwrap();
    for name in ["vault-a", "vault_b", "Prod.Vault-2024", "zz"] {
        let vault_name = VaultName::new(name).unwrap();
        let arn = ctx.vault_arn(&vault_name);
        let handle = VaultHandle::new(vault_name, format!("{name}-id"), arn.clone());
        let doc = ProtectionPolicyDocument::deny_destructive(&handle, &[]);
        doc.validate_for(&arn).unwrap();
        let denied = doc.denied_actions_on(&arn);
        for action in greentic_backup_spec::MANDATORY_DENIED_ACTIONS {
            assert!(denied.contains(&action), "{name} missing {action}");
        }
    }
}

#[test]
fn rule_spec_surfaces_the_first_validation_error() {
    let err = RuleSpec::new("0 3 * * ?", "vault-a", 0)
        .validate()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRetention { days: 0, .. }));

    let err = RuleSpec::new("every day", "vault-a", 14)
        .validate()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSchedule { .. }));
}

#[test]
fn selection_deserializes_from_yaml() {
    let yaml = r#"
name: sel-1
plan: daily_two_weeks
execution_role: r1
conditions:
  - key: backup_policy
    operator: EQUALS
    value: daily_two_weeks
"#;
    let rule: SelectionRule = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(
        rule.conditions,
        vec![TagCondition::string_equals("backup_policy", "daily_two_weeks")]
    );
}

#[test]
fn plan_json_keeps_original_schedule_text() {
    let rule = RuleSpec::new("cron(0 5 ? * 1 *)", "vault-a", 35)
        .validate()
        .unwrap();
    let plan = BackupPlan::new("weekly".try_into().unwrap(), vec![rule]);
    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json["rules"][0]["schedule"], "cron(0 5 ? * 1 *)");
    assert_eq!(json["rules"][0]["retention"], 35);
    let back: BackupPlan = serde_json::from_value(json).unwrap();
    assert_eq!(back, plan);
}
