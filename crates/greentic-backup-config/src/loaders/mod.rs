use crate::BackupConfigLayer;
use crate::paths::{project_config_path, user_config_path};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn load_user_layer() -> Result<Option<BackupConfigLayer>> {
    match user_config_path() {
        Some(path) if path.exists() => load_from_file(&path).map(Some),
        _ => Ok(None),
    }
}

pub fn load_project_layer(
    root: &Path,
    override_path: Option<&PathBuf>,
) -> Result<Option<BackupConfigLayer>> {
    if let Some(path) = override_path {
        return load_from_file(path).map(Some);
    }
    let path = project_config_path(root);
    if path.exists() {
        load_from_file(&path).map(Some)
    } else {
        Ok(None)
    }
}

pub fn load_from_file(path: &Path) -> Result<BackupConfigLayer> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&data, path)
}

fn parse_config(data: &str, path: &Path) -> Result<BackupConfigLayer> {
    if path.extension().map(|ext| ext == "json").unwrap_or(false) {
        let layer: BackupConfigLayer = serde_json::from_str(data)
            .with_context(|| format!("invalid json config {}", path.display()))?;
        Ok(layer)
    } else {
        let layer: BackupConfigLayer = toml::from_str(data)
            .with_context(|| format!("invalid toml config {}", path.display()))?;
        Ok(layer)
    }
}

pub fn env_layer() -> Result<BackupConfigLayer> {
    env_layer_from(|key| std::env::var(key).ok())
}

/// Build the env layer from `lookup`. Malformed numbers are errors rather
/// than silently ignored, so a typo in a deployment does not fall back to a
/// default.
pub fn env_layer_from<F>(lookup: F) -> Result<BackupConfigLayer>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layer = BackupConfigLayer::default();

    if let Some(value) = lookup("GREENTIC_BACKUP_ACCOUNT_ID") {
        layer
            .context
            .get_or_insert_with(Default::default)
            .account_id = Some(value);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_REGION") {
        layer.context.get_or_insert_with(Default::default).region = Some(value);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_PARTITION") {
        layer
            .context
            .get_or_insert_with(Default::default)
            .partition = Some(value);
    }

    if let Some(value) = lookup("GREENTIC_BACKUP_ROOT") {
        layer.paths.get_or_insert_with(Default::default).root = Some(PathBuf::from(value));
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_STATE_DIR") {
        layer.paths.get_or_insert_with(Default::default).state_dir = Some(PathBuf::from(value));
    }

    if let Some(value) = lookup("GREENTIC_BACKUP_CALL_TIMEOUT_MS") {
        layer
            .runtime
            .get_or_insert_with(Default::default)
            .call_timeout_ms = Some(parse_number(&value, "GREENTIC_BACKUP_CALL_TIMEOUT_MS")?);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_MAX_ATTEMPTS") {
        layer
            .runtime
            .get_or_insert_with(Default::default)
            .max_attempts = Some(parse_number(&value, "GREENTIC_BACKUP_MAX_ATTEMPTS")?);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_BASE_DELAY_MS") {
        layer
            .runtime
            .get_or_insert_with(Default::default)
            .base_delay_ms = Some(parse_number(&value, "GREENTIC_BACKUP_BASE_DELAY_MS")?);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_MAX_DELAY_MS") {
        layer
            .runtime
            .get_or_insert_with(Default::default)
            .max_delay_ms = Some(parse_number(&value, "GREENTIC_BACKUP_MAX_DELAY_MS")?);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_WATCH_INTERVAL_SECS") {
        layer
            .runtime
            .get_or_insert_with(Default::default)
            .watch_interval_secs =
            Some(parse_number(&value, "GREENTIC_BACKUP_WATCH_INTERVAL_SECS")?);
    }

    if let Some(value) = lookup("GREENTIC_BACKUP_EXTRA_DENIED_ACTIONS") {
        let actions = value
            .split(',')
            .map(str::trim)
            .filter(|action| !action.is_empty())
            .map(str::to_string)
            .collect();
        layer
            .protection
            .get_or_insert_with(Default::default)
            .extra_denied_actions = Some(actions);
    }

    if let Some(value) = lookup("GREENTIC_BACKUP_SERVICE") {
        layer.service.get_or_insert_with(Default::default).kind = Some(value);
    }
    if let Some(value) = lookup("GREENTIC_BACKUP_STORE_PATH") {
        layer.service.get_or_insert_with(Default::default).store_path = Some(PathBuf::from(value));
    }

    Ok(layer)
}

fn parse_number<T>(value: &str, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("{key} must be a number, got `{value}`"))
}
