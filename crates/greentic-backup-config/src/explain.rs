use crate::{BackupConfig, ConfigSource, ProvenanceMap, StateLayout};
use serde::Serialize;
use std::fmt;

/// Resolved configuration together with where each value came from.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainReport {
    pub config: BackupConfig,
    pub provenance: ProvenanceMap,
    pub layout: StateLayout,
    pub warnings: Vec<String>,
}

impl ExplainReport {
    pub fn new(
        config: BackupConfig,
        provenance: ProvenanceMap,
        warnings: Vec<String>,
    ) -> Self {
        let layout = StateLayout::of(&config);
        Self {
            config,
            provenance,
            layout,
            warnings,
        }
    }

    /// Settings that did not keep their built-in default.
    pub fn overridden(&self) -> impl Iterator<Item = (&str, &ConfigSource)> {
        self.provenance
            .iter()
            .filter(|(_, source)| **source != ConfigSource::Default)
            .map(|(path, source)| (path.as_str(), source))
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "config": &self.config,
            "provenance": &self.provenance,
            "layout": &self.layout,
            "warnings": &self.warnings,
        })
    }
}

impl fmt::Display for ExplainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = &self.config.context;
        writeln!(f, "Greentic backup configuration")?;
        writeln!(
            f,
            "Account {} in {} ({})",
            ctx.account_id, ctx.region, ctx.partition
        )?;
        match &self.layout.store {
            Some(store) => writeln!(
                f,
                "Service: {} (store {})",
                self.config.service.kind,
                store.display()
            )?,
            None => writeln!(f, "Service: {}", self.config.service.kind)?,
        }
        writeln!(f, "Protection ledger: {}", self.layout.ledger.display())?;

        let overridden: Vec<_> = self.overridden().collect();
        let defaults = self.provenance.len() - overridden.len();
        if overridden.is_empty() {
            writeln!(f, "All {defaults} settings use defaults")?;
        } else {
            writeln!(f, "Overridden ({defaults} settings use defaults):")?;
            for (path, source) in overridden {
                writeln!(f, " - {path}: {source}")?;
            }
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warn in &self.warnings {
                writeln!(f, " ! {warn}")?;
            }
        }
        Ok(())
    }
}
