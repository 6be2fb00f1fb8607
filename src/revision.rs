//! Save, rollback and restart workflows over one tracked file.
//!
//! Every overwrite is preceded by a backup of the bytes being replaced, and
//! all workflows on the same path run one at a time.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tempfile::NamedTempFile;
use tracing::info;

use crate::backup::BackupStore;
use crate::error::{KeeperError, Result};
use crate::models::{BackupInfo, RestartOutcome, RollbackResult, SaveResult};
use crate::restart::Restarter;

pub struct RevisionController {
    store: BackupStore,
    restarter: Arc<dyn Restarter>,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl RevisionController {
    pub fn new(store: BackupStore, restarter: Arc<dyn Restarter>) -> Self {
        Self {
            store,
            restarter,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, file: &Path) -> Arc<Mutex<()>> {
        let key = fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());
        self.locks.entry(key).or_default().clone()
    }

    pub fn save(&self, file: &Path, content: &[u8], restart: bool) -> Result<SaveResult> {
        let lock = self.lock_for(file);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let backup = self
            .store
            .create_backup(file)
            .map_err(|e| KeeperError::BackupFailed(Box::new(e)))?;
        replace_contents(file, content).map_err(|e| KeeperError::WriteFailed {
            backup: backup.identifier.clone(),
            source: Box::new(e),
        })?;
        info!(file = %file.display(), backup = %backup.identifier, bytes = content.len(), "file saved");

        let mut message = String::from("saved");
        let restart = restart.then(|| {
            let outcome = self.restarter.restart(file);
            message.push_str("; ");
            message.push_str(&outcome.summary());
            outcome
        });

        Ok(SaveResult {
            backup: backup.identifier,
            message,
            restart,
        })
    }

    /// Restores `identifier` into `file` and restarts. The replaced state is
    /// backed up first, so a rollback can itself be rolled back.
    pub fn rollback(&self, file: &Path, identifier: &str) -> Result<RollbackResult> {
        let lock = self.lock_for(file);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // Read before backing up: the new backup may prune the requested one.
        let restored = self.store.read_backup(file, identifier)?;
        let safety = self
            .store
            .create_backup(file)
            .map_err(|e| KeeperError::BackupFailed(Box::new(e)))?;
        replace_contents(file, &restored).map_err(|e| KeeperError::WriteFailed {
            backup: safety.identifier.clone(),
            source: Box::new(e),
        })?;
        info!(
            file = %file.display(),
            from = identifier,
            safety = %safety.identifier,
            "rollback written"
        );

        let restart = self.restarter.restart(file);
        Ok(RollbackResult {
            message: format!("rolled back to {identifier}; {}", restart.summary()),
            pre_rollback_backup: safety.identifier,
            restored_from: identifier.to_string(),
            restart,
        })
    }

    pub fn restart(&self, file: &Path) -> RestartOutcome {
        let lock = self.lock_for(file);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.restarter.restart(file)
    }

    pub fn list_revisions(&self, file: &Path) -> Result<Vec<BackupInfo>> {
        self.store.list_backups(file)
    }

    pub fn read_revision(&self, file: &Path, identifier: &str) -> Result<Vec<u8>> {
        self.store.read_backup(file, identifier)
    }
}

/// Writes through a sibling temp file and renames it over `path`, keeping
/// the existing permissions. A symlink is followed, so its target is
/// replaced and the link stays a link.
pub(crate) fn replace_contents(path: &Path, data: &[u8]) -> Result<()> {
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let path = resolved.as_path();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| KeeperError::write(path, e))?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| KeeperError::write(path, e))?;
    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(tmp.path(), meta.permissions());
    }
    tmp.persist(path)
        .map_err(|e| KeeperError::write(path, e.error))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::tests::StepClock;
    use crate::backup::DEFAULT_RETENTION;
    use crate::models::{PhaseFailure, RestartPhase};
    use std::collections::BTreeMap;
    use std::thread;
    use tempfile::TempDir;

    #[derive(Default)]
    pub(crate) struct FakeRestarter {
        pub(crate) calls: Mutex<Vec<PathBuf>>,
        pub(crate) fail_start: bool,
    }

    impl FakeRestarter {
        pub(crate) fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Restarter for FakeRestarter {
        fn restart(&self, file: &Path) -> RestartOutcome {
            self.calls.lock().unwrap().push(file.to_path_buf());
            RestartOutcome {
                output: "[stop] ok\n[start] ok\n".into(),
                failure: self.fail_start.then(|| PhaseFailure {
                    phase: RestartPhase::Start,
                    reason: "exit status: 1".into(),
                }),
            }
        }
    }

    fn setup(fail_start: bool) -> (TempDir, PathBuf, Arc<FakeRestarter>, RevisionController) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("app");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("docker-compose.yml");
        fs::write(&file, "v1").unwrap();

        let restarter = Arc::new(FakeRestarter {
            fail_start,
            ..FakeRestarter::default()
        });
        let store = BackupStore::with_clock(DEFAULT_RETENTION, Arc::new(StepClock::new()));
        let controller = RevisionController::new(store, restarter.clone());
        (tmp, file, restarter, controller)
    }

    #[test]
    fn save_backs_up_prior_content_then_writes() {
        let (_tmp, file, restarter, controller) = setup(false);

        let result = controller.save(&file, b"v2", false).unwrap();
        assert!(result.backup.starts_with("docker-compose_"));
        assert!(result.backup.ends_with(".yml"));
        assert!(result.restart.is_none());
        assert_eq!(restarter.count(), 0);

        assert_eq!(fs::read(&file).unwrap(), b"v2");
        assert_eq!(controller.read_revision(&file, &result.backup).unwrap(), b"v1");
    }

    #[test]
    fn save_without_backup_leaves_file_untouched() {
        let (_tmp, file, _restarter, controller) = setup(false);
        fs::write(file.parent().unwrap().join("backups"), "not a dir").unwrap();

        let err = controller.save(&file, b"v2", true).unwrap_err();
        assert!(matches!(err, KeeperError::BackupFailed(_)));
        assert_eq!(fs::read(&file).unwrap(), b"v1");
    }

    #[test]
    fn save_of_missing_file_is_backup_failure() {
        let (tmp, _file, _restarter, controller) = setup(false);
        let ghost = tmp.path().join("app/ghost.yml");

        assert!(matches!(
            controller.save(&ghost, b"x", false),
            Err(KeeperError::BackupFailed(_))
        ));
        assert!(!ghost.exists());
    }

    #[test]
    fn restart_failure_does_not_undo_save() {
        let (_tmp, file, restarter, controller) = setup(true);

        let result = controller.save(&file, b"v2", true).unwrap();
        let outcome = result.restart.unwrap();
        assert_eq!(outcome.failed_at(), Some(RestartPhase::Start));
        assert!(result.message.contains("restart failed"));
        assert_eq!(restarter.count(), 1);
        assert_eq!(fs::read(&file).unwrap(), b"v2");
    }

    #[cfg(unix)]
    #[test]
    fn save_keeps_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (_tmp, file, _restarter, controller) = setup(false);
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();

        controller.save(&file, b"v2", false).unwrap();
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[cfg(unix)]
    #[test]
    fn save_through_symlink_updates_target() {
        let (_tmp, file, _restarter, controller) = setup(false);
        let link = file.parent().unwrap().join("current.yml");
        std::os::unix::fs::symlink(&file, &link).unwrap();

        controller.save(&link, b"v2", false).unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&file).unwrap(), b"v2");
    }

    #[test]
    fn rollback_restores_bytes_and_is_reversible() {
        let (_tmp, file, restarter, controller) = setup(false);
        let first = controller.save(&file, b"v2", false).unwrap();
        controller.save(&file, b"v3", false).unwrap();

        let rolled = controller.rollback(&file, &first.backup).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"v1");
        assert_eq!(rolled.restored_from, first.backup);
        assert_eq!(restarter.count(), 1);
        assert_eq!(
            controller
                .read_revision(&file, &rolled.pre_rollback_backup)
                .unwrap(),
            b"v3"
        );

        controller.rollback(&file, &rolled.pre_rollback_backup).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"v3");
        assert_eq!(restarter.count(), 2);
    }

    #[test]
    fn rollback_to_unknown_backup_changes_nothing() {
        let (_tmp, file, restarter, controller) = setup(false);
        controller.save(&file, b"v2", false).unwrap();
        let before = controller.list_revisions(&file).unwrap().len();

        let err = controller
            .rollback(&file, "docker-compose_19990101_000000.yml")
            .unwrap_err();
        assert!(matches!(err, KeeperError::BackupNotFound(_)));
        assert_eq!(fs::read(&file).unwrap(), b"v2");
        assert_eq!(controller.list_revisions(&file).unwrap().len(), before);
        assert_eq!(restarter.count(), 0);
    }

    #[test]
    fn rollback_reports_restart_failure_after_restoring() {
        let (_tmp, file, _restarter, controller) = setup(true);
        let saved = controller.save(&file, b"v2", false).unwrap();

        let rolled = controller.rollback(&file, &saved.backup).unwrap();
        assert!(!rolled.restart.is_ok());
        assert_eq!(fs::read(&file).unwrap(), b"v1");
    }

    #[test]
    fn rollback_to_oldest_survives_pruning() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("stack.yml");
        fs::write(&file, "s0").unwrap();
        let store = BackupStore::with_clock(2, Arc::new(StepClock::new()));
        let controller = RevisionController::new(store, Arc::new(FakeRestarter::default()));

        let oldest = controller.save(&file, b"s1", false).unwrap();
        controller.save(&file, b"s2", false).unwrap();

        controller.rollback(&file, &oldest.backup).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"s0");
        assert_eq!(controller.list_revisions(&file).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_saves_each_back_up_a_distinct_state() {
        let (_tmp, file, _restarter, controller) = setup(false);
        let controller = Arc::new(controller);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let controller = Arc::clone(&controller);
                let file = file.clone();
                thread::spawn(move || {
                    controller
                        .save(&file, format!("w{i}").as_bytes(), false)
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Every state appears exactly once: in a backup or as the live file.
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for b in controller.list_revisions(&file).unwrap() {
            let bytes = controller.read_revision(&file, &b.identifier).unwrap();
            *seen.entry(String::from_utf8(bytes).unwrap()).or_default() += 1;
        }
        *seen
            .entry(fs::read_to_string(&file).unwrap())
            .or_default() += 1;

        let mut expected: BTreeMap<String, usize> = BTreeMap::new();
        expected.insert("v1".into(), 1);
        for i in 0..8 {
            expected.insert(format!("w{i}"), 1);
        }
        assert_eq!(seen, expected);
    }
}
