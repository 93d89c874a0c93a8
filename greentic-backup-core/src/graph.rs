//! Dependency ordering between governance entities.

use greentic_backup_spec::{Error, PlanName, Result, SelectionName, VaultName};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// An entity the reconciliation driver acts on.
///
/// Variant order doubles as the tie-break between nodes that become ready at
/// the same time, so vaults are handled before their protection, plans and
/// selections.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Node {
    Vault(VaultName),
    Protection(VaultName),
    Plan(PlanName),
    Selection(SelectionName),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Vault(name) => write!(f, "vault:{name}"),
            Node::Protection(name) => write!(f, "protection:{name}"),
            Node::Plan(name) => write!(f, "plan:{name}"),
            Node::Selection(name) => write!(f, "selection:{name}"),
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Directed acyclic graph where an edge points from a dependency to the
/// entity that needs it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<Node>,
    dependents: BTreeMap<Node, BTreeSet<Node>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node);
    }

    /// Record that `dependent` must be processed after `dependency`.
    pub fn add_edge(&mut self, dependency: Node, dependent: Node) {
        self.nodes.insert(dependency.clone());
        self.nodes.insert(dependent.clone());
        self.dependents
            .entry(dependency)
            .or_default()
            .insert(dependent);
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of `node`.
    pub fn dependencies_of(&self, node: &Node) -> Vec<&Node> {
        self.dependents
            .iter()
            .filter(|(_, dependents)| dependents.contains(node))
            .map(|(dependency, _)| dependency)
            .collect()
    }

    /// Kahn's algorithm; the smallest ready node is always taken first, so the
    /// order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<Node>> {
        let mut in_degree: BTreeMap<&Node, usize> =
            self.nodes.iter().map(|node| (node, 0)).collect();
        for dependents in self.dependents.values() {
            for dependent in dependents {
                *in_degree.entry(dependent).or_default() += 1;
            }
        }

        let mut ready: BTreeSet<&Node> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(node.clone());
            if let Some(dependents) = self.dependents.get(node) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(node, _)| node.to_string())
                .collect();
            return Err(Error::Invalid {
                field: "dependency graph",
                reason: format!("cycle through {}", stuck.join(", ")),
            });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(name: &str) -> VaultName {
        VaultName::new(name).unwrap()
    }

    fn plan(name: &str) -> PlanName {
        PlanName::new(name).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        let sel = Node::Selection(SelectionName::new("sel-1").unwrap());
        graph.add_edge(Node::Plan(plan("daily")), sel.clone());
        graph.add_edge(Node::Vault(vault("vault-b")), Node::Plan(plan("daily")));
        graph.add_edge(
            Node::Vault(vault("vault-b")),
            Node::Protection(vault("vault-b")),
        );
        graph.add_node(Node::Vault(vault("vault-a")));

        let order = graph.topological_order().unwrap();
        let rendered: Vec<String> = order.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            [
                "vault:vault-a",
                "vault:vault-b",
                "protection:vault-b",
                "plan:daily",
                "selection:sel-1"
            ]
        );
        assert_eq!(graph.dependencies_of(&sel), vec![&Node::Plan(plan("daily"))]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(Node::Plan(plan("a")), Node::Plan(plan("b")));
        graph.add_edge(Node::Plan(plan("b")), Node::Plan(plan("a")));
        let err = graph.topological_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
