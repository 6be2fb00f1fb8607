//! Timestamped backup copies of tracked files, kept in a `backups/` folder
//! next to each file and pruned to the newest N per file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, NaiveDateTime};
use glob::Pattern;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{KeeperError, Result};
use crate::models::BackupInfo;

pub const BACKUP_DIR: &str = "backups";
pub const DEFAULT_RETENTION: usize = 20;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const STAMP_LEN: usize = 15;

// -----------------------------------------------------------------------------
// Clock
// -----------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

// -----------------------------------------------------------------------------
// Naming
// -----------------------------------------------------------------------------

/// Splits `docker-compose.yml` into `("docker-compose", ".yml")`.
/// A leading dot is part of the base, so `.env` has no extension.
pub fn split_name(file: &Path) -> Result<(String, String)> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| KeeperError::PathInvalid(file.to_string_lossy().into_owned()))?;
    match name.rfind('.') {
        Some(pos) if pos > 0 => Ok((name[..pos].to_string(), name[pos..].to_string())),
        _ => Ok((name, String::new())),
    }
}

pub fn backup_dir_for(file: &Path) -> PathBuf {
    file.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(BACKUP_DIR)
}

fn identifier_for(base: &str, stamp: &str, counter: u32, ext: &str) -> String {
    if counter == 0 {
        format!("{base}_{stamp}{ext}")
    } else {
        format!("{base}_{stamp}_{counter:02}{ext}")
    }
}

/// Returns the creation time encoded in `name` if it is a backup of
/// `(base, ext)`: `{base}_{YYYYMMDD_HHMMSS}{ext}` or the same with `_NN`
/// appended to the stamp.
pub fn parse_identifier(name: &str, base: &str, ext: &str) -> Option<NaiveDateTime> {
    let middle = name
        .strip_prefix(base)?
        .strip_prefix('_')?
        .strip_suffix(ext)?;
    if middle.len() < STAMP_LEN || !middle.is_char_boundary(STAMP_LEN) {
        return None;
    }
    let (stamp, rest) = middle.split_at(STAMP_LEN);
    if !rest.is_empty() {
        let counter = rest.strip_prefix('_')?;
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

fn hash_file(path: &Path) -> String {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return String::new(),
    };
    let mut hasher = Sha256::new();
    if io::copy(&mut file, &mut hasher).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

// -----------------------------------------------------------------------------
// Store
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredBackup {
    identifier: String,
    created_at: NaiveDateTime,
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

impl StoredBackup {
    fn info(&self) -> BackupInfo {
        BackupInfo {
            identifier: self.identifier.clone(),
            timestamp: self.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            size: self.size,
            modified: unix_secs(self.modified),
            sha256: hash_file(&self.path),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: usize,
    pub removed: Vec<String>,
    /// Deletions that failed; pruning carries on past them.
    pub failed: Vec<String>,
}

pub struct BackupStore {
    retention: usize,
    clock: Arc<dyn Clock>,
}

impl BackupStore {
    pub fn new(retention: usize) -> Self {
        Self::with_clock(retention, Arc::new(LocalClock))
    }

    pub fn with_clock(retention: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            retention: retention.max(1),
            clock,
        }
    }

    /// Copies the current contents of `file` into its backup set, then prunes
    /// that set. Nothing is created if the file cannot be read.
    pub fn create_backup(&self, file: &Path) -> Result<BackupInfo> {
        let data = fs::read(file).map_err(|e| KeeperError::read(file, e))?;
        let (base, ext) = split_name(file)?;
        let dir = backup_dir_for(file);
        fs::create_dir_all(&dir).map_err(|e| KeeperError::write(&dir, e))?;

        let stamp = self.clock.now().format(STAMP_FORMAT).to_string();
        let (identifier, path) = write_new_backup(&dir, &base, &stamp, &ext, &data)?;
        info!(file = %file.display(), backup = %identifier, bytes = data.len(), "backup created");

        let meta = fs::metadata(&path).map_err(|e| KeeperError::read(&path, e))?;
        let stored = StoredBackup {
            created_at: parse_identifier(&identifier, &base, &ext)
                .unwrap_or_else(|| self.clock.now()),
            identifier,
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            size: meta.len(),
            path,
        };
        let info = stored.info();

        match self.prune_with(&dir, &base, &ext, self.retention, Some(&info.identifier), |p| {
            fs::remove_file(p)
        }) {
            Ok(report) if !report.removed.is_empty() => {
                debug!(removed = report.removed.len(), kept = report.kept, "backups pruned");
            }
            Ok(_) => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "prune after backup failed"),
        }

        Ok(info)
    }

    /// Deletes all but the newest `max` backups of `(base, ext)` in `dir`,
    /// newest by modification time. Running it on a pruned set is a no-op.
    pub fn prune_backups(&self, dir: &Path, base: &str, ext: &str, max: usize) -> Result<PruneReport> {
        self.prune_with(dir, base, ext, max, None, |p| fs::remove_file(p))
    }

    /// `keep` names a backup that survives regardless of its mtime and
    /// counts toward `max`.
    fn prune_with<F>(
        &self,
        dir: &Path,
        base: &str,
        ext: &str,
        max: usize,
        keep: Option<&str>,
        remove: F,
    ) -> Result<PruneReport>
    where
        F: Fn(&Path) -> io::Result<()>,
    {
        let mut backups = scan(dir, base, ext)?;
        let mut kept = 0;
        if let Some(id) = keep {
            let before = backups.len();
            backups.retain(|b| b.identifier != id);
            kept = before - backups.len();
        }
        let excess = backups.len().saturating_sub(max.saturating_sub(kept));
        let mut report = PruneReport {
            kept: kept + backups.len() - excess,
            ..PruneReport::default()
        };

        for old in &backups[..excess] {
            match remove(&old.path) {
                Ok(()) => {
                    debug!(backup = %old.identifier, "backup pruned");
                    report.removed.push(old.identifier.clone());
                }
                Err(e) => {
                    warn!(backup = %old.identifier, error = %e, "failed to prune backup");
                    report.failed.push(old.identifier.clone());
                }
            }
        }
        Ok(report)
    }

    /// Backups of `file`, oldest first (the order pruning removes them in).
    pub fn list_backups(&self, file: &Path) -> Result<Vec<BackupInfo>> {
        let (base, ext) = split_name(file)?;
        let backups = scan(&backup_dir_for(file), &base, &ext)?;
        Ok(backups.iter().map(StoredBackup::info).collect())
    }

    pub fn read_backup(&self, file: &Path, identifier: &str) -> Result<Vec<u8>> {
        let path = self.locate(file, identifier)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(KeeperError::BackupNotFound(identifier.to_string()))
            }
            Err(e) => Err(KeeperError::read(path, e)),
        }
    }

    /// Only identifiers that name a backup of `file` resolve; anything else
    /// (other files' backups, separators, `..`) is not found.
    fn locate(&self, file: &Path, identifier: &str) -> Result<PathBuf> {
        let (base, ext) = split_name(file)?;
        let plain = !identifier.contains(['/', '\\']) && identifier != "." && identifier != "..";
        if !plain || parse_identifier(identifier, &base, &ext).is_none() {
            return Err(KeeperError::BackupNotFound(identifier.to_string()));
        }
        Ok(backup_dir_for(file).join(identifier))
    }
}

/// Claims a fresh identifier with `create_new` so a same-second backup gets
/// a counter suffix instead of replacing an existing one.
fn write_new_backup(
    dir: &Path,
    base: &str,
    stamp: &str,
    ext: &str,
    data: &[u8],
) -> Result<(String, PathBuf)> {
    let mut counter = 0u32;
    loop {
        let identifier = identifier_for(base, stamp, counter, ext);
        let path = dir.join(&identifier);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                counter += 1;
                continue;
            }
            Err(e) => return Err(KeeperError::write(path, e)),
        };

        if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(KeeperError::write(path, e));
        }
        return Ok((identifier, path));
    }
}

/// Backups of `(base, ext)` in `dir`, ordered by modification time and then
/// identifier. A missing directory is an empty set.
fn scan(dir: &Path, base: &str, ext: &str) -> Result<Vec<StoredBackup>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = format!(
        "{}/{}_*{}",
        Pattern::escape(&dir.to_string_lossy()),
        Pattern::escape(base),
        Pattern::escape(ext)
    );
    let paths = glob::glob(&pattern).map_err(|e| {
        KeeperError::read(dir, io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    })?;

    let mut found = Vec::new();
    for path in paths.filter_map(|p| p.ok()) {
        let identifier = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        let created_at = match parse_identifier(&identifier, base, ext) {
            Some(t) => t,
            None => continue,
        };
        let meta = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        found.push(StoredBackup {
            identifier,
            created_at,
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            size: meta.len(),
            path,
        });
    }

    found.sort_by(|a, b| {
        a.modified
            .cmp(&b.modified)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    Ok(found)
}
