use crate::error::{Error, Result};
use crate::names::{PlanName, SelectionName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Comparison applied to a resource tag. The backup service currently only
/// offers exact string equality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[default]
    #[serde(rename = "STRINGEQUALS", alias = "EQUALS", alias = "StringEquals")]
    StringEquals,
}

/// A single `{tag key, operator, tag value}` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagCondition {
    pub key: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    pub value: String,
}

impl TagCondition {
    pub fn string_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: ConditionOperator::StringEquals,
            value: value.into(),
        }
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self.operator {
            ConditionOperator::StringEquals => tags.get(&self.key) == Some(&self.value),
        }
    }
}

/// Binding of tagged resources to a plan, plus the role the service assumes to
/// read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRule {
    pub name: SelectionName,
    pub plan: PlanName,
    pub execution_role: String,
    pub conditions: Vec<TagCondition>,
}

impl SelectionRule {
    /// Construct a selection, failing fast on structural errors.
    pub fn new(
        name: SelectionName,
        plan: PlanName,
        execution_role: impl Into<String>,
        conditions: Vec<TagCondition>,
    ) -> Result<Self> {
        let execution_role = execution_role.into();
        if execution_role.trim().is_empty() {
            return Err(Error::EmptyComponent {
                field: "execution role",
            });
        }
        if conditions.is_empty() {
            return Err(Error::EmptyPredicate {
                selection: name.to_string(),
            });
        }
        for condition in &conditions {
            if condition.key.trim().is_empty() {
                return Err(Error::InvalidPredicate {
                    selection: name.to_string(),
                    reason: "tag key must not be empty".into(),
                });
            }
            if condition.key.len() > 128 || condition.value.len() > 256 {
                return Err(Error::InvalidPredicate {
                    selection: name.to_string(),
                    reason: format!("tag {} exceeds the tag size limits", condition.key),
                });
            }
        }

        Ok(Self {
            name,
            plan,
            execution_role,
            conditions,
        })
    }

    /// Conditions are ANDed together.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|cond| cond.matches(tags))
    }
}

/// A selection as registered with the backup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionHandle {
    pub id: String,
    pub plan_id: String,
    pub role_arn: String,
    pub rule: SelectionRule,
}

/// Every plan protecting a resource with `tags`.
///
/// A resource matched by several selections is protected by each of their
/// plans independently; the result is sorted and deduplicated.
pub fn plans_covering<'a, I>(rules: I, tags: &BTreeMap<String, String>) -> Vec<PlanName>
where
    I: IntoIterator<Item = &'a SelectionRule>,
{
    let mut plans: Vec<PlanName> = rules
        .into_iter()
        .filter(|rule| rule.matches(tags))
        .map(|rule| rule.plan.clone())
        .collect();
    plans.sort();
    plans.dedup();
    plans
}
