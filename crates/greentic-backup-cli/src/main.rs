mod telemetry;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use greentic_backup_config::{CliOverrides, ConfigResolver, ResolvedConfig};
use greentic_backup_core::{
    FileLedger, Governance, GovernanceManifest, MemoryBackupService, PassReport, ProtectionSettings,
    ProtectionStatus, ReconcileOptions, RetryPolicy,
};
use greentic_backup_provider_dev::DevBackupService;
use greentic_backup_spec::{DynBackupService, VaultName, plans_covering};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry::LogFormat;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "greentic-backup",
    version,
    about = "Greentic backup governance CLI"
)]
struct Cli {
    /// Explicit configuration file (`.json` or TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    account_id: Option<String>,
    #[arg(long, global = true)]
    region: Option<String>,
    /// Backup service backend (`dev` or `memory`)
    #[arg(long, global = true)]
    service: Option<String>,
    /// Store file used by the dev service
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the service against a governance manifest
    Apply(ApplyCmd),
    /// Print the canonical protection document of a vault
    Document(DocumentCmd),
    /// Show protection state of every known vault
    Status(StatusCmd),
    /// List the plans protecting a resource with the given tags
    Coverage(CoverageCmd),
    /// Apply a manifest, then keep vault protection from drifting
    Watch(WatchCmd),
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(Args)]
struct ApplyCmd {
    #[arg(short = 'f', long)]
    file: PathBuf,
    /// Remove plans and selections missing from the manifest
    #[arg(long)]
    prune: bool,
    /// Print the planned actions without calling the service
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct DocumentCmd {
    #[arg(long)]
    vault: String,
}

#[derive(Args)]
struct StatusCmd {
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CoverageCmd {
    #[arg(short = 'f', long)]
    file: PathBuf,
    /// Resource tag as `key=value`; repeatable
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

#[derive(Args)]
struct WatchCmd {
    #[arg(short = 'f', long)]
    file: PathBuf,
    /// Seconds between protection checks; defaults to the configured interval
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Show the resolved configuration and where each value came from
    Explain {
        #[arg(long)]
        json: bool,
    },
}

fn parse_tag(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    let resolved = ConfigResolver::new()
        .with_cli_overrides(CliOverrides {
            config_path: cli.config.clone(),
            account_id: cli.account_id.clone(),
            region: cli.region.clone(),
            root: cli.root.clone(),
            state_dir: cli.state_dir.clone(),
            service_kind: cli.service.clone(),
            store_path: cli.store_path.clone(),
        })
        .load()
        .context("failed to resolve configuration")?;
    for warning in &resolved.warnings {
        warn!(%warning, "configuration warning");
    }

    match cli.command {
        Command::Apply(cmd) => handle_apply(&resolved, cmd).await,
        Command::Document(cmd) => handle_document(&resolved, cmd).await,
        Command::Status(cmd) => handle_status(&resolved, cmd).await,
        Command::Coverage(cmd) => handle_coverage(cmd),
        Command::Watch(cmd) => handle_watch(&resolved, cmd).await,
        Command::Config(ConfigCmd::Explain { json }) => {
            let report = resolved.explain();
            if json {
                println!("{}", serde_json::to_string_pretty(&report.as_json())?);
            } else {
                print!("{report}");
            }
            Ok(())
        }
    }
}

fn build_service(resolved: &ResolvedConfig) -> Result<DynBackupService> {
    let context = resolved.deployment_context()?;
    let service: DynBackupService = match resolved.layout().store {
        Some(path) => Arc::new(
            DevBackupService::with_persistence(context, &path)
                .with_context(|| format!("failed to open dev store {}", path.display()))?,
        ),
        None => Arc::new(MemoryBackupService::new(context)),
    };
    Ok(service)
}

/// Wire the governance components from configuration and load what the
/// service already knows.
async fn governance(resolved: &ResolvedConfig) -> Result<Governance> {
    let runtime = &resolved.config.runtime;
    let ledger_path = resolved.layout().ledger;
    let ledger = FileLedger::open(&ledger_path)
        .with_context(|| format!("failed to open ledger {}", ledger_path.display()))?;

    let governance = Governance::builder(build_service(resolved)?, resolved.deployment_context()?)
        .ledger(Arc::new(ledger))
        .retry(RetryPolicy {
            max_attempts: runtime.max_attempts,
            base_delay: Duration::from_millis(runtime.base_delay_ms),
            max_delay: Duration::from_millis(runtime.max_delay_ms),
            call_timeout: resolved.call_timeout(),
        })
        .protection(ProtectionSettings {
            extra_denied_actions: resolved.config.protection.extra_denied_actions.clone(),
        })
        .build();
    governance
        .reconciler()
        .hydrate()
        .await
        .context("failed to load existing service state")?;
    Ok(governance)
}

async fn handle_apply(resolved: &ResolvedConfig, cmd: ApplyCmd) -> Result<()> {
    let manifest = GovernanceManifest::load(&cmd.file)
        .with_context(|| format!("failed to load manifest {}", cmd.file.display()))?;
    let governance = governance(resolved).await?;
    let options = ReconcileOptions { prune: cmd.prune };

    if cmd.dry_run {
        let planned = governance.reconciler().preview(&manifest, options)?;
        if cmd.json {
            println!("{}", serde_json::to_string_pretty(&planned)?);
        } else if planned.is_empty() {
            println!("Nothing to do");
        } else {
            for action in &planned {
                println!("{action}");
            }
        }
        return Ok(());
    }

    match governance.reconciler().run_pass(&manifest, options).await {
        Ok(report) => print_report(&report, cmd.json),
        Err(err) => {
            print_report(&err.partial, cmd.json)?;
            Err(anyhow!(err))
        }
    }
}

fn print_report(report: &PassReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for outcome in &report.outcomes {
        match &outcome.detail {
            Some(detail) => println!("{} {} ({detail})", outcome.entity, outcome.change),
            None => println!("{} {}", outcome.entity, outcome.change),
        }
    }
    if report.is_noop() {
        println!("Already converged");
    }
    Ok(())
}

async fn handle_document(resolved: &ResolvedConfig, cmd: DocumentCmd) -> Result<()> {
    let name = VaultName::new(cmd.vault)?;
    let governance = governance(resolved).await?;
    let vault = governance
        .registry()
        .resolve(&name)
        .with_context(|| format!("vault {name} is not registered; run apply first"))?;
    let document = governance.enforcer().build_document(&vault);
    println!("{}", document.to_json_pretty()?);
    Ok(())
}

async fn handle_status(resolved: &ResolvedConfig, cmd: StatusCmd) -> Result<()> {
    let governance = governance(resolved).await?;
    let mut rows = Vec::new();
    for vault in governance.registry().list() {
        let status = governance.enforcer().status(&vault.name)?;
        rows.push((vault.name, status));
    }

    if cmd.json {
        let value: Vec<serde_json::Value> = rows
            .iter()
            .map(|(name, status)| match status {
                ProtectionStatus::InSync { hash, applied_at } => serde_json::json!({
                    "vault": name,
                    "state": "in_sync",
                    "hash": hash.as_str(),
                    "applied_at": applied_at.to_rfc3339(),
                }),
                ProtectionStatus::Pending { desired, applied } => serde_json::json!({
                    "vault": name,
                    "state": "pending",
                    "desired": desired.as_str(),
                    "applied": applied.as_ref().map(|hash| hash.as_str()),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No vaults registered");
    }
    for (name, status) in rows {
        match status {
            ProtectionStatus::InSync { applied_at, .. } => {
                println!("{name} in sync (applied {})", applied_at.to_rfc3339())
            }
            ProtectionStatus::Pending { applied: None, .. } => {
                println!("{name} pending (never applied)")
            }
            ProtectionStatus::Pending { .. } => println!("{name} pending (drifted)"),
        }
    }
    Ok(())
}

fn handle_coverage(cmd: CoverageCmd) -> Result<()> {
    if cmd.tags.is_empty() {
        bail!("at least one --tag key=value is required");
    }
    let manifest = GovernanceManifest::load(&cmd.file)
        .with_context(|| format!("failed to load manifest {}", cmd.file.display()))?;
    manifest.validate()?;
    let rules = manifest
        .selections
        .iter()
        .map(|selection| selection.to_rule())
        .collect::<greentic_backup_spec::Result<Vec<_>>>()?;
    let tags: BTreeMap<String, String> = cmd.tags.into_iter().collect();

    let plans = plans_covering(&rules, &tags);
    if plans.is_empty() {
        println!("No plan covers this resource");
    }
    for plan in plans {
        println!("{plan}");
    }
    Ok(())
}

async fn handle_watch(resolved: &ResolvedConfig, cmd: WatchCmd) -> Result<()> {
    let manifest = GovernanceManifest::load(&cmd.file)
        .with_context(|| format!("failed to load manifest {}", cmd.file.display()))?;
    let governance = governance(resolved).await?;
    let report = governance
        .reconciler()
        .run_pass(&manifest, ReconcileOptions::default())
        .await?;
    print_report(&report, false)?;

    let every = cmd
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| resolved.watch_interval());
    if every.is_zero() {
        bail!("watch interval must be greater than zero");
    }
    let token = governance.watch_protection(every);
    info!(interval_secs = every.as_secs(), "watching vault protection");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    token.cancel();
    info!("protection watch stopped");
    Ok(())
}
