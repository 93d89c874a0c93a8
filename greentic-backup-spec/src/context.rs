use crate::error::{Error, Result};
use crate::names::VaultName;
use serde::{Deserialize, Serialize};

/// Partition used when none is configured.
pub const DEFAULT_PARTITION: &str = "aws";

/// Account and region the governance model is applied to.
///
/// Passed explicitly to every component that needs it; there is no process-wide
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentContext {
    account_id: String,
    region: String,
    partition: String,
}

impl DeploymentContext {
    /// Construct a context for the default partition.
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Result<Self> {
        Self::with_partition(account_id, region, DEFAULT_PARTITION)
    }

    pub fn with_partition(
        account_id: impl Into<String>,
        region: impl Into<String>,
        partition: impl Into<String>,
    ) -> Result<Self> {
        let account_id = account_id.into();
        let region = region.into();
        let partition = partition.into();

        if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Invalid {
                field: "account id",
                reason: format!("expected 12 digits, got `{account_id}`"),
            });
        }
        for (field, value) in [("region", &region), ("partition", &partition)] {
            if value.trim().is_empty() {
                return Err(Error::EmptyComponent { field });
            }
            if !value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return Err(Error::InvalidCharacters {
                    field,
                    value: value.clone(),
                });
            }
        }

        Ok(Self {
            account_id,
            region,
            partition,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Resource reference of a vault in this account and region.
    pub fn vault_arn(&self, vault: &VaultName) -> String {
        format!(
            "arn:{}:backup:{}:{}:backup-vault:{}",
            self.partition, self.region, self.account_id, vault
        )
    }

    /// Resolve an execution role reference. Bare role names are expanded to a
    /// role ARN in this account; full ARNs are returned unchanged.
    pub fn role_arn(&self, role: &str) -> String {
        if role.starts_with("arn:") {
            role.to_string()
        } else {
            format!("arn:{}:iam::{}:role/{}", self.partition, self.account_id, role)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DeploymentContext {
        DeploymentContext::new("123456789012", "eu-west-1").unwrap()
    }

    #[test]
    fn builds_vault_arn() {
        let vault = VaultName::new("vault-a").unwrap();
        assert_eq!(
            ctx().vault_arn(&vault),
            "arn:aws:backup:eu-west-1:123456789012:backup-vault:vault-a"
        );
    }

    #[test]
    fn expands_bare_role_names_only() {
        assert_eq!(
            ctx().role_arn("r1"),
            "arn:aws:iam::123456789012:role/r1"
        );
        let full = "arn:aws:iam::210987654321:role/backup";
        assert_eq!(ctx().role_arn(full), full);
    }

    #[test]
    fn rejects_malformed_account() {
        assert!(DeploymentContext::new("1234", "eu-west-1").is_err());
        assert!(DeploymentContext::new("123456789012", "").is_err());
        assert!(DeploymentContext::new("123456789012", "EU_WEST").is_err());
    }
}
