//! Declarative governance manifest.
//!
//! ```yaml
//! vaults: [vault-a]
//! plans:
//!   - name: daily_two_weeks
//!     rules:
//!       - { schedule: "0 3 * * ?", vault: vault-a, retention_days: 14 }
//! selections:
//!   - name: sel-1
//!     plan: daily_two_weeks
//!     role: backup-reader
//!     conditions:
//!       - { key: backup_policy, operator: STRINGEQUALS, value: daily_two_weeks }
//! ```

use crate::graph::{DependencyGraph, Node};
use greentic_backup_spec::{
    Error, PlanName, Result, RuleSpec, SelectionName, SelectionRule, TagCondition, VaultName,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GovernanceManifest {
    #[serde(default)]
    pub vaults: Vec<VaultName>,
    #[serde(default)]
    pub plans: Vec<PlanSpec>,
    #[serde(default)]
    pub selections: Vec<SelectionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanSpec {
    pub name: PlanName,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionSpec {
    pub name: SelectionName,
    pub plan: PlanName,
    pub role: String,
    #[serde(default)]
    pub conditions: Vec<TagCondition>,
}

impl SelectionSpec {
    pub fn to_rule(&self) -> Result<SelectionRule> {
        SelectionRule::new(
            self.name.clone(),
            self.plan.clone(),
            self.role.clone(),
            self.conditions.clone(),
        )
    }
}

impl GovernanceManifest {
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).map_err(|err| Error::Manifest(err.to_string()))
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|err| Error::Manifest(err.to_string()))
    }

    /// Load a manifest; `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Manifest(format!("{}: {err}", path.display())))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    /// Structural checks that need no service: duplicate names, rule and
    /// predicate syntax.
    pub fn validate(&self) -> Result<()> {
        let mut vaults = BTreeSet::new();
        for vault in &self.vaults {
            if !vaults.insert(vault) {
                return Err(Error::Duplicate {
                    entity: format!("vault:{vault}"),
                });
            }
        }
        let mut plans = BTreeSet::new();
        for plan in &self.plans {
            if !plans.insert(&plan.name) {
                return Err(Error::Duplicate {
                    entity: format!("plan:{}", plan.name),
                });
            }
            for rule in &plan.rules {
                rule.validate()?;
            }
        }
        let mut selections = BTreeSet::new();
        for selection in &self.selections {
            if !selections.insert(&selection.name) {
                return Err(Error::Duplicate {
                    entity: format!("selection:{}", selection.name),
                });
            }
            selection.to_rule()?;
        }
        Ok(())
    }

    pub fn declares_vault(&self, name: &VaultName) -> bool {
        self.vaults.contains(name)
    }

    pub fn plan(&self, name: &PlanName) -> Option<&PlanSpec> {
        self.plans.iter().find(|plan| &plan.name == name)
    }

    pub fn selection(&self, name: &SelectionName) -> Option<&SelectionSpec> {
        self.selections
            .iter()
            .find(|selection| &selection.name == name)
    }

    /// `Vault -> Protection`, `Vault -> Plan` and `Plan -> Selection` edges
    /// between declared entities. References to undeclared entities add no
    /// edge; the driver checks them against registered state.
    pub fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for vault in &self.vaults {
            graph.add_edge(Node::Vault(vault.clone()), Node::Protection(vault.clone()));
        }
        for plan in &self.plans {
            let node = Node::Plan(plan.name.clone());
            graph.add_node(node.clone());
            for rule in &plan.rules {
                if let Ok(vault) = VaultName::new(rule.vault.clone())
                    && self.declares_vault(&vault)
                {
                    graph.add_edge(Node::Vault(vault), node.clone());
                }
            }
        }
        for selection in &self.selections {
            let node = Node::Selection(selection.name.clone());
            graph.add_node(node.clone());
            if self.plan(&selection.plan).is_some() {
                graph.add_edge(Node::Plan(selection.plan.clone()), node);
            }
        }
        graph
    }
}
