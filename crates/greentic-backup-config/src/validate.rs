use crate::types::{BackupConfig, LOCAL_ACCOUNT_ID, ServiceKind};
use anyhow::{Result, bail};
use greentic_backup_spec::DeploymentContext;
use std::env;

/// Hard errors fail resolution; everything else comes back as warnings.
pub fn validate(cfg: &BackupConfig) -> Result<Vec<String>> {
    if cfg.context.account_id.trim().is_empty() {
        bail!("context.account_id must not be empty");
    }
    if let Err(err) = DeploymentContext::with_partition(
        cfg.context.account_id.clone(),
        cfg.context.region.clone(),
        cfg.context.partition.clone(),
    ) {
        bail!("invalid deployment context: {err}");
    }
    if cfg.runtime.max_attempts == 0 {
        bail!("runtime.max_attempts must be at least 1");
    }
    if cfg.runtime.call_timeout_ms == 0 {
        bail!("runtime.call_timeout_ms must be greater than zero");
    }

    let mut warnings = Vec::new();
    if cfg.runtime.call_timeout_ms < 100 {
        warnings.push(format!(
            "runtime.call_timeout_ms={}ms is very low",
            cfg.runtime.call_timeout_ms
        ));
    }
    if cfg.runtime.base_delay_ms > cfg.runtime.max_delay_ms {
        warnings.push(format!(
            "runtime.base_delay_ms={} exceeds max_delay_ms={}; every retry waits max_delay_ms",
            cfg.runtime.base_delay_ms, cfg.runtime.max_delay_ms
        ));
    }
    if cfg.runtime.watch_interval_secs == 0 {
        warnings.push("runtime.watch_interval_secs=0; the protection watch is disabled".into());
    }
    if cfg.context.account_id == LOCAL_ACCOUNT_ID {
        warnings.push(format!(
            "context.account_id is the local placeholder {LOCAL_ACCOUNT_ID}"
        ));
    }
    if cfg.service.kind == ServiceKind::Memory {
        warnings.push("service.kind=memory; nothing is persisted between runs".into());
    }
    if cfg.service.kind == ServiceKind::Dev && cfg.paths.state_dir.starts_with(env::temp_dir()) {
        warnings.push("state directory resolved under the temp dir; dev state may vanish".into());
    }

    Ok(warnings)
}
