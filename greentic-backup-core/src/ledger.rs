//! Last-applied protection state, persisted per vault.
//!
//! An entry is only written after the service confirmed the document, so a
//! cancelled or failed apply always leaves the previous entry in place.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use greentic_backup_spec::{DocumentHash, Error, Result, VaultName};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Record of a protection document the service confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedProtection {
    pub vault: VaultName,
    pub vault_arn: String,
    pub document_hash: DocumentHash,
    pub applied_at: DateTime<Utc>,
}

/// Storage for [`AppliedProtection`] entries.
pub trait ProtectionLedger: Send + Sync {
    fn applied(&self, vault: &VaultName) -> Result<Option<AppliedProtection>>;
    fn record(&self, entry: AppliedProtection) -> Result<()>;
    fn entries(&self) -> Result<Vec<AppliedProtection>>;
}

impl<T> ProtectionLedger for Box<T>
where
    T: ProtectionLedger + ?Sized,
{
    fn applied(&self, vault: &VaultName) -> Result<Option<AppliedProtection>> {
        (**self).applied(vault)
    }
    fn record(&self, entry: AppliedProtection) -> Result<()> {
        (**self).record(entry)
    }
    fn entries(&self) -> Result<Vec<AppliedProtection>> {
        (**self).entries()
    }
}

impl<T> ProtectionLedger for Arc<T>
where
    T: ProtectionLedger + ?Sized,
{
    fn applied(&self, vault: &VaultName) -> Result<Option<AppliedProtection>> {
        (**self).applied(vault)
    }
    fn record(&self, entry: AppliedProtection) -> Result<()> {
        (**self).record(entry)
    }
    fn entries(&self) -> Result<Vec<AppliedProtection>> {
        (**self).entries()
    }
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<BTreeMap<VaultName, AppliedProtection>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProtectionLedger for MemoryLedger {
    fn applied(&self, vault: &VaultName) -> Result<Option<AppliedProtection>> {
        Ok(self.entries.read().get(vault).cloned())
    }

    fn record(&self, entry: AppliedProtection) -> Result<()> {
        self.entries.write().insert(entry.vault.clone(), entry);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AppliedProtection>> {
        Ok(self.entries.read().values().cloned().collect())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedLedger {
    #[serde(default)]
    vaults: Vec<AppliedProtection>,
}

/// JSON-file ledger. Writes go through a temp file and an atomic rename while
/// holding an exclusive lock on a sidecar `.lock` file.
pub struct FileLedger {
    path: PathBuf,
    lock_path: PathBuf,
    entries: RwLock<BTreeMap<VaultName, AppliedProtection>>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(storage)?;
        }
        let lock_path = path.with_extension("lock");
        let ledger = Self {
            path,
            lock_path,
            entries: RwLock::new(BTreeMap::new()),
        };
        let loaded = ledger.with_lock(|| read_entries(&ledger.path))?;
        *ledger.entries.write() = loaded;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(storage)?;
        lock.lock_exclusive().map_err(storage)?;
        let result = f();
        let _ = FileExt::unlock(&lock);
        result
    }
}

fn storage(err: impl std::fmt::Display) -> Error {
    Error::Storage(err.to_string())
}

fn read_entries(path: &Path) -> Result<BTreeMap<VaultName, AppliedProtection>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let file = File::open(path).map_err(storage)?;
    let persisted: PersistedLedger =
        serde_json::from_reader(BufReader::new(file)).map_err(storage)?;
    Ok(persisted
        .vaults
        .into_iter()
        .map(|entry| (entry.vault.clone(), entry))
        .collect())
}

fn write_entries(path: &Path, entries: &BTreeMap<VaultName, AppliedProtection>) -> Result<()> {
    let persisted = PersistedLedger {
        vaults: entries.values().cloned().collect(),
    };
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).map_err(storage)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &persisted).map_err(storage)?;
        writer.flush().map_err(storage)?;
        writer.get_ref().sync_all().map_err(storage)?;
    }
    fs::rename(&tmp, path).map_err(storage)
}

impl ProtectionLedger for FileLedger {
    fn applied(&self, vault: &VaultName) -> Result<Option<AppliedProtection>> {
        Ok(self.entries.read().get(vault).cloned())
    }

    fn record(&self, entry: AppliedProtection) -> Result<()> {
        self.with_lock(|| {
            // Merge with whatever other processes recorded since we loaded.
            let mut on_disk = read_entries(&self.path)?;
            on_disk.insert(entry.vault.clone(), entry);
            write_entries(&self.path, &on_disk)?;
            *self.entries.write() = on_disk;
            Ok(())
        })
    }

    fn entries(&self) -> Result<Vec<AppliedProtection>> {
        Ok(self.entries.read().values().cloned().collect())
    }
}
