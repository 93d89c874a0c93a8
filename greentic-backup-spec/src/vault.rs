use crate::names::VaultName;
use serde::{Deserialize, Serialize};

/// A vault known to exist in the backup service.
///
/// `id` and `arn` are assigned by the service and treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHandle {
    pub name: VaultName,
    pub id: String,
    pub arn: String,
}

impl VaultHandle {
    pub fn new(name: VaultName, id: impl Into<String>, arn: impl Into<String>) -> Self {
        Self {
            name,
            id: id.into(),
            arn: arn.into(),
        }
    }
}
