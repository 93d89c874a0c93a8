use crate::types::{
    BackupConfig, ConfigSource, ContextConfig, PathsConfig, ProtectionConfig, RuntimeConfig,
    ServiceConfig, ServiceKind,
};
use crate::{
    BackupConfigLayer, ContextLayer, PathsLayer, ProtectionLayer, ProvenanceMap, RuntimeLayer,
    ServiceLayer,
};
use anyhow::{Result, anyhow};

/// Apply `layer` on top of `config`. Either the whole layer applies or, on
/// error, neither the config nor the provenance changes.
pub fn apply_layer(
    config: &mut BackupConfig,
    layer: BackupConfigLayer,
    source: ConfigSource,
    provenance: &mut ProvenanceMap,
) -> Result<()> {
    let mut next = config.clone();
    let mut touched = ProvenanceMap::new();

    if let Some(version) = layer.schema_version {
        next.schema_version = version;
        touched.insert("schema_version".into(), source.clone());
    }
    if let Some(context) = layer.context {
        apply_context(&mut next.context, context, &source, &mut touched);
    }
    if let Some(paths) = layer.paths {
        apply_paths(&mut next.paths, paths, &source, &mut touched);
    }
    if let Some(runtime) = layer.runtime {
        apply_runtime(&mut next.runtime, runtime, &source, &mut touched);
    }
    if let Some(protection) = layer.protection {
        apply_protection(&mut next.protection, protection, &source, &mut touched);
    }
    if let Some(service) = layer.service {
        apply_service(&mut next.service, service, &source, &mut touched)?;
    }

    *config = next;
    provenance.extend(touched);
    Ok(())
}

fn apply_context(
    target: &mut ContextConfig,
    layer: ContextLayer,
    source: &ConfigSource,
    provenance: &mut ProvenanceMap,
) {
    if let Some(value) = layer.account_id {
        target.account_id = value;
        provenance.insert("context.account_id".into(), source.clone());
    }
    if let Some(value) = layer.region {
        target.region = value;
        provenance.insert("context.region".into(), source.clone());
    }
    if let Some(value) = layer.partition {
        target.partition = value;
        provenance.insert("context.partition".into(), source.clone());
    }
}

fn apply_paths(
    target: &mut PathsConfig,
    layer: PathsLayer,
    source: &ConfigSource,
    provenance: &mut ProvenanceMap,
) {
    if let Some(value) = layer.root {
        target.root = value;
        provenance.insert("paths.root".into(), source.clone());
    }
    if let Some(value) = layer.state_dir {
        target.state_dir = value;
        provenance.insert("paths.state_dir".into(), source.clone());
    }
}

fn apply_runtime(
    target: &mut RuntimeConfig,
    layer: RuntimeLayer,
    source: &ConfigSource,
    provenance: &mut ProvenanceMap,
) {
    if let Some(value) = layer.call_timeout_ms {
        target.call_timeout_ms = value;
        provenance.insert("runtime.call_timeout_ms".into(), source.clone());
    }
    if let Some(value) = layer.max_attempts {
        target.max_attempts = value;
        provenance.insert("runtime.max_attempts".into(), source.clone());
    }
    if let Some(value) = layer.base_delay_ms {
        target.base_delay_ms = value;
        provenance.insert("runtime.base_delay_ms".into(), source.clone());
    }
    if let Some(value) = layer.max_delay_ms {
        target.max_delay_ms = value;
        provenance.insert("runtime.max_delay_ms".into(), source.clone());
    }
    if let Some(value) = layer.watch_interval_secs {
        target.watch_interval_secs = value;
        provenance.insert("runtime.watch_interval_secs".into(), source.clone());
    }
}

fn apply_protection(
    target: &mut ProtectionConfig,
    layer: ProtectionLayer,
    source: &ConfigSource,
    provenance: &mut ProvenanceMap,
) {
    if let Some(value) = layer.extra_denied_actions {
        target.extra_denied_actions = value;
        provenance.insert("protection.extra_denied_actions".into(), source.clone());
    }
}

fn apply_service(
    target: &mut ServiceConfig,
    layer: ServiceLayer,
    source: &ConfigSource,
    provenance: &mut ProvenanceMap,
) -> Result<()> {
    if let Some(value) = layer.kind {
        let kind: ServiceKind = value.parse().map_err(|err: String| anyhow!(err))?;
        target.kind = kind;
        provenance.insert("service.kind".into(), source.clone());
    }
    if let Some(value) = layer.store_path {
        target.store_path = Some(value);
        provenance.insert("service.store_path".into(), source.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_layer_sets_values_and_provenance() {
        let mut cfg = BackupConfig::default();
        let mut prov = ProvenanceMap::new();
        let layer = BackupConfigLayer {
            context: Some(ContextLayer {
                account_id: Some("123456789012".into()),
                region: Some("eu-west-1".into()),
                partition: None,
            }),
            runtime: Some(RuntimeLayer {
                max_attempts: Some(8),
                ..Default::default()
            }),
            protection: Some(ProtectionLayer {
                extra_denied_actions: Some(vec!["backup:UpdateRecoveryPointLifecycle".into()]),
            }),
            service: Some(ServiceLayer {
                kind: Some("memory".into()),
                store_path: None,
            }),
            ..Default::default()
        };

        apply_layer(&mut cfg, layer, ConfigSource::Cli, &mut prov).expect("apply");

        assert_eq!(cfg.context.account_id, "123456789012");
        assert_eq!(cfg.context.partition, "aws");
        assert_eq!(cfg.runtime.max_attempts, 8);
        assert_eq!(cfg.service.kind, ServiceKind::Memory);
        assert_eq!(cfg.protection.extra_denied_actions.len(), 1);
        for path in [
            "context.account_id",
            "context.region",
            "runtime.max_attempts",
            "protection.extra_denied_actions",
            "service.kind",
        ] {
            assert_eq!(
                prov.get(path),
                Some(&ConfigSource::Cli),
                "missing provenance for {path}"
            );
        }
        assert!(!prov.contains_key("context.partition"));
    }

    #[test]
    fn unknown_service_kind_leaves_config_untouched() {
        let mut cfg = BackupConfig::default();
        let mut prov = ProvenanceMap::new();
        let layer = BackupConfigLayer {
            runtime: Some(RuntimeLayer {
                max_attempts: Some(2),
                ..Default::default()
            }),
            service: Some(ServiceLayer {
                kind: Some("aws-live".into()),
                store_path: None,
            }),
            ..Default::default()
        };

        let err = apply_layer(&mut cfg, layer, ConfigSource::Env, &mut prov).unwrap_err();
        assert!(err.to_string().contains("unknown service kind"));
        assert_eq!(cfg, BackupConfig::default());
        assert!(prov.is_empty());
    }
}
