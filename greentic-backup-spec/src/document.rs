//! Vault access-policy documents.
//!
//! The serialized form is the wire contract sent to the vault access-policy API.
//! Its compact JSON bytes are also what the content hash is computed over, so
//! field order and naming must stay stable across releases.

use crate::error::{Error, Result};
use crate::vault::VaultHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Policy schema identifier understood by the access-policy API.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Wildcard principal.
pub const ANY_PRINCIPAL: &str = "*";

/// Actions every protection document must deny. Dropping any of them lets a
/// principal remove recovery points or lift the protection itself.
pub const MANDATORY_DENIED_ACTIONS: [&str; 4] = [
    "backup:DeleteRecoveryPoint",
    "backup:DeleteBackupVault",
    "backup:PutBackupVaultAccessPolicy",
    "backup:DeleteBackupVaultAccessPolicy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS")]
    pub aws: String,
}

impl Principal {
    pub fn everyone() -> Self {
        Self {
            aws: ANY_PRINCIPAL.to_string(),
        }
    }

    pub fn is_everyone(&self) -> bool {
        self.aws == ANY_PRINCIPAL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Principal")]
    pub principal: Principal,
    #[serde(rename = "Action")]
    pub actions: Vec<String>,
    #[serde(rename = "Resource")]
    pub resource: String,
}

/// Access-control document bound to exactly one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionPolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statements: Vec<PolicyStatement>,
}

impl ProtectionPolicyDocument {
    /// Build the deny-everyone document for `vault`.
    ///
    /// The mandatory actions always come first, followed by `extra_actions` in
    /// the given order with duplicates dropped.
    pub fn deny_destructive(vault: &VaultHandle, extra_actions: &[String]) -> Self {
        let mut actions: Vec<String> = MANDATORY_DENIED_ACTIONS
            .iter()
            .map(|action| action.to_string())
            .collect();
        for action in extra_actions {
            let action = action.trim();
            if !action.is_empty() && !actions.iter().any(|existing| existing == action) {
                actions.push(action.to_string());
            }
        }

        Self {
            version: POLICY_VERSION.to_string(),
            statements: vec![PolicyStatement {
                effect: Effect::Deny,
                principal: Principal::everyone(),
                actions,
                resource: vault.arn.clone(),
            }],
        }
    }

    /// Every action denied to every principal on `resource`.
    pub fn denied_actions_on(&self, resource: &str) -> Vec<&str> {
        self.statements
            .iter()
            .filter(|stmt| {
                stmt.effect == Effect::Deny
                    && stmt.principal.is_everyone()
                    && stmt.resource == resource
            })
            .flat_map(|stmt| stmt.actions.iter().map(String::as_str))
            .collect()
    }

    /// Check the protection guarantee holds for `resource`.
    pub fn validate_for(&self, resource: &str) -> Result<()> {
        if self.version != POLICY_VERSION {
            return Err(Error::InvalidDocument(format!(
                "unsupported policy version {}",
                self.version
            )));
        }
        let denied = self.denied_actions_on(resource);
        let missing: Vec<&str> = MANDATORY_DENIED_ACTIONS
            .iter()
            .copied()
            .filter(|action| !denied.contains(action))
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidDocument(format!(
                "{resource} is missing denied actions: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Compact JSON bytes sent over the wire and hashed for change detection.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::InvalidDocument(err.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| Error::InvalidDocument(err.to_string()))
    }

    pub fn content_hash(&self) -> Result<DocumentHash> {
        let bytes = self.canonical_bytes()?;
        Ok(DocumentHash::of(&bytes))
    }
}

/// Hex-encoded SHA-256 of a document's canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentHash(String);

impl DocumentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
