use crate::graph::Node;
use greentic_backup_spec::{DocumentHash, Error, PlanName, SelectionName, VaultName};
use serde::Serialize;
use std::fmt;
use thiserror::Error as ThisError;
use uuid::Uuid;

/// What a reconciliation step did to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Updated,
    Applied,
    Unchanged,
    Removed,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Change::Created => "created",
            Change::Updated => "updated",
            Change::Applied => "applied",
            Change::Unchanged => "unchanged",
            Change::Removed => "removed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub entity: Node,
    pub change: Change,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-entity outcomes of one reconciliation pass, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub outcomes: Vec<EntityOutcome>,
}

impl PassReport {
    pub fn new(pass_id: Uuid) -> Self {
        Self {
            pass_id,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, entity: Node, change: Change, detail: Option<String>) {
        self.outcomes.push(EntityOutcome {
            entity,
            change,
            detail,
        });
    }

    pub fn count(&self, change: Change) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.change == change)
            .count()
    }

    /// True when the pass left every entity as it found it.
    pub fn is_noop(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| outcome.change == Change::Unchanged)
    }

    pub fn outcome_for(&self, entity: &Node) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|outcome| &outcome.entity == entity)
    }
}

/// A pass aborted by a fatal error. Progress made before the failure is kept
/// in `partial` and is safe to resume from.
#[derive(Debug, ThisError)]
#[error(
    "reconciliation pass failed at {}: {source}",
    .entity.as_ref().map_or_else(|| "manifest".to_string(), ToString::to_string)
)]
pub struct PassError {
    pub entity: Option<Node>,
    pub source: Error,
    pub partial: PassReport,
}

/// A step `preview` expects the next pass to take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    CreateVault { vault: VaultName },
    ApplyProtection {
        vault: VaultName,
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<DocumentHash>,
    },
    DefinePlan { plan: PlanName },
    UpdatePlan { plan: PlanName },
    BindSelection { selection: SelectionName },
    RebindSelection { selection: SelectionName },
    RemoveSelection { selection: SelectionName },
    RemovePlan { plan: PlanName },
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedAction::CreateVault { vault } => write!(f, "create vault {vault}"),
            PlannedAction::ApplyProtection { vault, .. } => {
                write!(f, "apply protection to {vault}")
            }
            PlannedAction::DefinePlan { plan } => write!(f, "define plan {plan}"),
            PlannedAction::UpdatePlan { plan } => write!(f, "update plan {plan}"),
            PlannedAction::BindSelection { selection } => write!(f, "bind selection {selection}"),
            PlannedAction::RebindSelection { selection } => {
                write!(f, "rebind selection {selection}")
            }
            PlannedAction::RemoveSelection { selection } => {
                write!(f, "remove selection {selection}")
            }
            PlannedAction::RemovePlan { plan } => write!(f, "remove plan {plan}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_and_serializes() {
        let mut report = PassReport::new(Uuid::nil());
        let vault = VaultName::new("vault-a").unwrap();
        report.record(Node::Vault(vault.clone()), Change::Created, None);
        report.record(
            Node::Protection(vault),
            Change::Applied,
            Some("attempts=1".into()),
        );
        assert_eq!(report.count(Change::Created), 1);
        assert!(!report.is_noop());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["entity"], "vault:vault-a");
        assert_eq!(json["outcomes"][1]["change"], "applied");
        assert!(json["outcomes"][0].get("detail").is_none());
    }

    #[test]
    fn pass_error_names_the_entity() {
        let err = PassError {
            entity: Some(Node::Plan(PlanName::new("daily").unwrap())),
            source: Error::InvalidRetention {
                days: 0,
                max: 36_500,
            },
            partial: PassReport::new(Uuid::nil()),
        };
        assert!(err.to_string().starts_with("reconciliation pass failed at plan:daily"));
    }
}
