mod explain;
mod loaders;
mod merge;
mod paths;
mod types;
mod validate;

use anyhow::{Context, Result};
use greentic_backup_spec::DeploymentContext;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub use explain::ExplainReport;
pub use paths::StateLayout;
pub use types::{
    BackupConfig, ConfigSource, ConfigVersion, ContextConfig, LOCAL_ACCOUNT_ID, PathsConfig,
    ProtectionConfig, ProvenancePath, RuntimeConfig, ServiceConfig, ServiceKind,
};

pub type ProvenanceMap = BTreeMap<ProvenancePath, ConfigSource>;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfigLayer {
    pub schema_version: Option<ConfigVersion>,
    pub context: Option<ContextLayer>,
    pub paths: Option<PathsLayer>,
    pub runtime: Option<RuntimeLayer>,
    pub protection: Option<ProtectionLayer>,
    pub service: Option<ServiceLayer>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ContextLayer {
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub partition: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct PathsLayer {
    pub root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLayer {
    pub call_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub watch_interval_secs: Option<u64>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionLayer {
    pub extra_denied_actions: Option<Vec<String>>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLayer {
    pub kind: Option<String>,
    pub store_path: Option<PathBuf>,
}

#[derive(Default, Debug, Clone)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub service_kind: Option<String>,
    pub store_path: Option<PathBuf>,
}

pub struct ConfigResolver {
    project_root: PathBuf,
    cli_overrides: CliOverrides,
    env: Option<BTreeMap<String, String>>,
    user_config: bool,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self {
            project_root: paths::current_dir(),
            cli_overrides: CliOverrides::default(),
            env: None,
            user_config: true,
        }
    }

    pub fn with_project_root(mut self, root: PathBuf) -> Self {
        self.project_root = root;
        self
    }

    pub fn with_cli_overrides(mut self, overrides: CliOverrides) -> Self {
        self.cli_overrides = overrides;
        self
    }

    /// Read `GREENTIC_BACKUP_*` values from `vars` instead of the process
    /// environment.
    pub fn with_env(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    /// Skip `~/.config/greentic/backup.toml`.
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    pub fn load(&self) -> Result<ResolvedConfig> {
        let mut config = BackupConfig::default();
        let mut provenance = default_provenance();

        if self.user_config
            && let Some(user_layer) = loaders::load_user_layer()?
        {
            merge::apply_layer(
                &mut config,
                user_layer,
                ConfigSource::UserConfig,
                &mut provenance,
            )?;
        }

        let override_path = self.cli_overrides.config_path.clone();
        if let Some(project_layer) =
            loaders::load_project_layer(&self.project_root, override_path.as_ref())?
        {
            merge::apply_layer(
                &mut config,
                project_layer,
                if override_path.is_some() {
                    ConfigSource::OverrideConfig
                } else {
                    ConfigSource::ProjectConfig
                },
                &mut provenance,
            )?;
        }

        let env_layer = match &self.env {
            Some(vars) => loaders::env_layer_from(|key| vars.get(key).cloned()),
            None => loaders::env_layer(),
        }
        .context("invalid GREENTIC_BACKUP_* environment")?;
        merge::apply_layer(&mut config, env_layer, ConfigSource::Env, &mut provenance)?;

        if let Some(cli_layer) = cli_layer(&self.cli_overrides) {
            merge::apply_layer(&mut config, cli_layer, ConfigSource::Cli, &mut provenance)?;
        }

        paths::anchor(&mut config, &self.project_root);
        let warnings = validate::validate(&config)?;

        Ok(ResolvedConfig {
            config,
            provenance,
            warnings,
        })
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn cli_layer(overrides: &CliOverrides) -> Option<BackupConfigLayer> {
    let mut layer = BackupConfigLayer::default();
    if let Some(account_id) = overrides.account_id.as_ref() {
        layer
            .context
            .get_or_insert_with(Default::default)
            .account_id = Some(account_id.clone());
    }
    if let Some(region) = overrides.region.as_ref() {
        layer.context.get_or_insert_with(Default::default).region = Some(region.clone());
    }
    if let Some(root) = overrides.root.as_ref() {
        layer.paths.get_or_insert_with(Default::default).root = Some(root.clone());
    }
    if let Some(path) = overrides.state_dir.as_ref() {
        layer.paths.get_or_insert_with(Default::default).state_dir = Some(path.clone());
    }
    if let Some(kind) = overrides.service_kind.as_ref() {
        layer.service.get_or_insert_with(Default::default).kind = Some(kind.clone());
    }
    if let Some(path) = overrides.store_path.as_ref() {
        layer.service.get_or_insert_with(Default::default).store_path = Some(path.clone());
    }
    if layer.context.is_some() || layer.paths.is_some() || layer.service.is_some() {
        Some(layer)
    } else {
        None
    }
}

fn default_provenance() -> ProvenanceMap {
    static DEFAULT_PATHS: Lazy<&'static [&'static str]> = Lazy::new(|| {
        &[
            "schema_version",
            "context.account_id",
            "context.region",
            "context.partition",
            "paths.root",
            "paths.state_dir",
            "runtime.call_timeout_ms",
            "runtime.max_attempts",
            "runtime.base_delay_ms",
            "runtime.max_delay_ms",
            "runtime.watch_interval_secs",
            "protection.extra_denied_actions",
            "service.kind",
            "service.store_path",
        ]
    });
    let mut map = ProvenanceMap::new();
    for path in DEFAULT_PATHS.iter() {
        map.insert(path.to_string(), ConfigSource::Default);
    }
    map
}

pub struct ResolvedConfig {
    pub config: BackupConfig,
    pub provenance: ProvenanceMap,
    pub warnings: Vec<String>,
}

impl ResolvedConfig {
    pub fn explain(&self) -> ExplainReport {
        ExplainReport::new(
            self.config.clone(),
            self.provenance.clone(),
            self.warnings.clone(),
        )
    }

    pub fn deployment_context(&self) -> Result<DeploymentContext> {
        let ctx = &self.config.context;
        DeploymentContext::with_partition(
            ctx.account_id.clone(),
            ctx.region.clone(),
            ctx.partition.clone(),
        )
        .context("invalid deployment context")
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.runtime.call_timeout_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.config.runtime.watch_interval_secs)
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::of(&self.config)
    }
}
