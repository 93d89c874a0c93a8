//! Where configuration and governance state live on disk.

use crate::{BackupConfig, ServiceKind};
use serde::Serialize;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "backup.toml";
const STORE_FILE: &str = "backup-service.json";
const LEDGER_FILE: &str = "protection-ledger.json";

/// Files a resolved configuration points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateLayout {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    /// Ledger of applied protection documents.
    pub ledger: PathBuf,
    /// Store of the dev service; the memory service keeps nothing on disk.
    pub store: Option<PathBuf>,
}

impl StateLayout {
    pub fn of(config: &BackupConfig) -> Self {
        let state_dir = config.paths.state_dir.clone();
        let store = match config.service.kind {
            ServiceKind::Dev => Some(
                config
                    .service
                    .store_path
                    .clone()
                    .unwrap_or_else(|| state_dir.join(STORE_FILE)),
            ),
            ServiceKind::Memory => None,
        };
        Self {
            root: config.paths.root.clone(),
            ledger: state_dir.join(LEDGER_FILE),
            state_dir,
            store,
        }
    }
}

pub(crate) fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("greentic").join(CONFIG_FILE))
}

pub(crate) fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".greentic").join(CONFIG_FILE)
}

pub(crate) fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Anchor relative paths: `root` at the project, `state_dir` under `root`,
/// and an explicit store under `state_dir`.
pub(crate) fn anchor(config: &mut BackupConfig, project_root: &Path) {
    let root = under(&config.paths.root, project_root);
    config.paths.state_dir = under(&config.paths.state_dir, &root);
    config.paths.root = root;
    if let Some(store) = config.service.store_path.take() {
        config.service.store_path = Some(under(&store, &config.paths.state_dir));
    }
}

fn under(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchored(project: &Path) -> BackupConfig {
        let mut config = BackupConfig::default();
        anchor(&mut config, project);
        config
    }

    #[test]
    fn state_nests_under_root_under_project() {
        let config = anchored(Path::new("/srv/app"));
        let layout = StateLayout::of(&config);
        assert_eq!(layout.root, Path::new("/srv/app/.greentic"));
        assert_eq!(layout.state_dir, Path::new("/srv/app/.greentic/state"));
        assert_eq!(
            layout.ledger,
            Path::new("/srv/app/.greentic/state/protection-ledger.json")
        );
        assert_eq!(
            layout.store.as_deref(),
            Some(Path::new("/srv/app/.greentic/state/backup-service.json"))
        );
    }

    #[test]
    fn explicit_store_is_relative_to_state_dir() {
        let mut config = BackupConfig::default();
        config.paths.state_dir = PathBuf::from("/var/lib/greentic");
        config.service.store_path = Some(PathBuf::from("dev/store.json"));
        anchor(&mut config, Path::new("/srv/app"));
        assert_eq!(
            StateLayout::of(&config).store.as_deref(),
            Some(Path::new("/var/lib/greentic/dev/store.json"))
        );
    }

    #[test]
    fn memory_service_has_no_store() {
        let mut config = anchored(Path::new("/srv/app"));
        config.service.kind = ServiceKind::Memory;
        assert_eq!(StateLayout::of(&config).store, None);
    }
}
