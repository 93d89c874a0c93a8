use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest identifier the backup service accepts for vaults, plans and selections.
pub const MAX_NAME_LEN: usize = 50;

/// Validate an identifier component: 1..=50 characters of `[A-Za-z0-9._-]`.
pub fn validate_name(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::EmptyComponent { field });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::InvalidCharacters {
            field,
            value: value.to_string(),
        });
    }

    if value.len() > MAX_NAME_LEN {
        return Err(Error::InvalidLength {
            field,
            value: value.to_string(),
            min: 1,
            max: MAX_NAME_LEN,
        });
    }

    Ok(())
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident, $field:literal, $min:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Construct a validated name.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                validate_name(&value, $field)?;
                if value.len() < $min {
                    return Err(Error::InvalidLength {
                        field: $field,
                        value,
                        min: $min,
                        max: MAX_NAME_LEN,
                    });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

name_type!(
    /// Unique, immutable name of a backup vault.
    VaultName,
    "vault name",
    2
);

name_type!(
    /// Unique name of a backup plan.
    PlanName,
    "plan name",
    1
);

name_type!(
    /// Unique name of a resource selection.
    SelectionName,
    "selection name",
    1
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_service_style_names() {
        assert!(VaultName::new("vault-a").is_ok());
        assert!(PlanName::new("daily_two_weeks").is_ok());
        assert!(SelectionName::new("sel.1").is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            VaultName::new(""),
            Err(Error::EmptyComponent { .. })
        ));
        assert!(matches!(
            VaultName::new("a"),
            Err(Error::InvalidLength { min: 2, .. })
        ));
        assert!(matches!(
            PlanName::new("daily plan"),
            Err(Error::InvalidCharacters { .. })
        ));
        assert!(matches!(
            SelectionName::new("x".repeat(51)),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn names_validate_on_deserialize() {
        let ok: VaultName = serde_json::from_str("\"vault-a\"").unwrap();
        assert_eq!(ok.as_str(), "vault-a");
        assert!(serde_json::from_str::<VaultName>("\"bad name\"").is_err());
    }
}
