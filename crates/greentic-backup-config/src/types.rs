use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub type ProvenancePath = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    UserConfig,
    ProjectConfig,
    OverrideConfig,
    Env,
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfigSource::Default => "default",
            ConfigSource::UserConfig => "user config",
            ConfigSource::ProjectConfig => "project config",
            ConfigSource::OverrideConfig => "override config",
            ConfigSource::Env => "env",
            ConfigSource::Cli => "cli",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigVersion(pub String);

impl Default for ConfigVersion {
    fn default() -> Self {
        Self("1".to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupConfig {
    #[serde(default)]
    pub schema_version: ConfigVersion,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Account, region and partition every component is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextConfig {
    pub account_id: String,
    pub region: String,
    pub partition: String,
}

/// Placeholder account used by the local service kinds.
pub const LOCAL_ACCOUNT_ID: &str = "000000000000";

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            account_id: LOCAL_ACCOUNT_ID.to_string(),
            region: "us-east-1".to_string(),
            partition: "aws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".greentic"),
            state_dir: PathBuf::from("state"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub call_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub watch_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            watch_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtectionConfig {
    #[serde(default)]
    pub extra_denied_actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// File-persisted local service.
    #[default]
    Dev,
    /// Process-local service; nothing survives the process.
    Memory,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Dev => f.write_str("dev"),
            ServiceKind::Memory => f.write_str("memory"),
        }
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(ServiceKind::Dev),
            "memory" => Ok(ServiceKind::Memory),
            other => Err(format!("unknown service kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub kind: ServiceKind,
    /// Store of the dev service; defaults to `<state_dir>/backup-service.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}
