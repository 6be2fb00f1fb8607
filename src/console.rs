//! Operator-facing operations on the compose root: browsing, editing,
//! backups and restarts. Every call passes the admin gate and every path is
//! resolved inside the root.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::access::{require_admin, PrincipalResolver};
use crate::backup::{BackupStore, BACKUP_DIR};
use crate::config::KeeperConfig;
use crate::error::{KeeperError, Result};
use crate::models::{BackupInfo, RestartOutcome, RollbackResult, SaveResult};
use crate::restart::Restarter;
use crate::revision::RevisionController;

pub struct Console {
    root: PathBuf,
    revisions: RevisionController,
    principals: Box<dyn PrincipalResolver>,
}

impl Console {
    /// `root` must exist; it is canonicalized once here.
    pub fn new(
        root: &Path,
        revisions: RevisionController,
        principals: Box<dyn PrincipalResolver>,
    ) -> Result<Self> {
        let root = fs::canonicalize(root).map_err(|e| KeeperError::read(root, e))?;
        Ok(Self {
            root,
            revisions,
            principals,
        })
    }

    pub fn open(
        config: &KeeperConfig,
        restarter: Arc<dyn Restarter>,
        principals: Box<dyn PrincipalResolver>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.root_dir).map_err(|e| KeeperError::write(&config.root_dir, e))?;
        let revisions = RevisionController::new(BackupStore::new(config.retention), restarter);
        Self::new(&config.root_dir, revisions, principals)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn authorize(&self, op: &str) -> Result<()> {
        let p = require_admin(self.principals.as_ref())?;
        debug!(operator = %p.name, op, "authorized");
        Ok(())
    }

    /// Maps a root-relative path to an absolute one. Absolute paths, `..`,
    /// backup folders and symlinks leading out of the root are rejected.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let invalid = || KeeperError::PathInvalid(rel.to_string());
        let rel_path = Path::new(rel);
        if rel.trim().is_empty() || rel.trim() != rel {
            return Err(invalid());
        }
        for comp in rel_path.components() {
            match comp {
                Component::Normal(c) if c == BACKUP_DIR => return Err(invalid()),
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(invalid()),
            }
        }

        let full = self.root.join(rel_path);
        let existing = full
            .ancestors()
            .find(|a| a.exists())
            .unwrap_or(self.root.as_path());
        let real = fs::canonicalize(existing).map_err(|e| KeeperError::read(existing, e))?;
        if !real.starts_with(&self.root) {
            return Err(invalid());
        }
        Ok(full)
    }

    fn resolve_file(&self, rel: &str) -> Result<PathBuf> {
        let path = self.resolve(rel)?;
        if !path.is_file() {
            return Err(KeeperError::read(
                &path,
                io::Error::new(io::ErrorKind::NotFound, "not a file"),
            ));
        }
        Ok(path)
    }

    // ---------------------------- revisions ---------------------------------

    pub fn save_file(&self, rel: &str, content: &[u8], restart: bool) -> Result<SaveResult> {
        self.authorize("save")?;
        let path = self.resolve(rel)?;
        self.revisions.save(&path, content, restart)
    }

    /// Failed phases come back as `StopPhaseFailed` / `StartPhaseFailed`.
    pub fn restart_file(&self, rel: &str) -> Result<RestartOutcome> {
        self.authorize("restart")?;
        let path = self.resolve_file(rel)?;
        self.revisions.restart(&path).into_result()
    }

    pub fn list_backups(&self, rel: &str) -> Result<Vec<BackupInfo>> {
        self.authorize("list-backups")?;
        let path = self.resolve(rel)?;
        self.revisions.list_revisions(&path)
    }

    pub fn download_backup(&self, rel: &str, identifier: &str) -> Result<Vec<u8>> {
        self.authorize("download")?;
        let path = self.resolve(rel)?;
        self.revisions.read_revision(&path, identifier)
    }

    pub fn rollback_file(&self, identifier: &str, rel: &str) -> Result<RollbackResult> {
        self.authorize("rollback")?;
        let path = self.resolve_file(rel)?;
        self.revisions.rollback(&path, identifier)
    }

    // ---------------------------- browsing ----------------------------------

    /// Every tracked file under the root, `/`-separated, sorted.
    pub fn list_files(&self) -> Result<Vec<String>> {
        self.authorize("list-files")?;
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == BACKUP_DIR));
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                KeeperError::read(path, io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(files)
    }

    pub fn list_directories(&self) -> Result<Vec<String>> {
        self.authorize("list-dirs")?;
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| KeeperError::read(&self.root, e))? {
            let entry = entry.map_err(|e| KeeperError::read(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && name != BACKUP_DIR {
                dirs.push(name);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    pub fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        self.authorize("read")?;
        let path = self.resolve(rel)?;
        fs::read(&path).map_err(|e| KeeperError::read(path, e))
    }

    pub fn create_directory(&self, rel: &str) -> Result<()> {
        self.authorize("mkdir")?;
        let path = self.resolve(rel)?;
        if path.exists() {
            return Err(KeeperError::AlreadyExists(rel.to_string()));
        }
        fs::create_dir_all(&path).map_err(|e| KeeperError::write(&path, e))?;
        info!(dir = %path.display(), "directory created");
        Ok(())
    }

    /// New files have no prior state, so no backup is taken.
    pub fn create_file(&self, rel: &str, content: &[u8]) -> Result<()> {
        self.authorize("create")?;
        let path = self.resolve(rel)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(KeeperError::AlreadyExists(rel.to_string()))
            }
            Err(e) => return Err(KeeperError::write(&path, e)),
        };
        file.write_all(content)
            .map_err(|e| KeeperError::write(&path, e))?;
        info!(file = %path.display(), bytes = content.len(), "file created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{OperatorTable, Role};
    use crate::backup::tests::StepClock;
    use crate::revision::tests::FakeRestarter;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn console_as(name: &str) -> (TempDir, Arc<FakeRestarter>, Console) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/docker-compose.yml"), "v1").unwrap();

        let mut ops = BTreeMap::new();
        ops.insert("admin".to_string(), Role::Admin);
        ops.insert("viewer".to_string(), Role::None);
        let principals = Box::new(OperatorTable::new(ops, Some(name.to_string())));

        let restarter = Arc::new(FakeRestarter::default());
        let store = BackupStore::with_clock(20, Arc::new(StepClock::new()));
        let revisions = RevisionController::new(store, restarter.clone());
        let console = Console::new(&root, revisions, principals).unwrap();
        (tmp, restarter, console)
    }

    #[test]
    fn save_example_keeps_v1_in_backup() {
        let (_tmp, _r, console) = console_as("admin");

        let result = console
            .save_file("app/docker-compose.yml", b"v2", false)
            .unwrap();
        assert!(result.backup.starts_with("docker-compose_"));
        assert_eq!(console.read_file("app/docker-compose.yml").unwrap(), b"v2");
        assert_eq!(
            console
                .download_backup("app/docker-compose.yml", &result.backup)
                .unwrap(),
            b"v1"
        );

        let listed = console.list_backups("app/docker-compose.yml").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identifier, result.backup);
    }

    #[test]
    fn rollback_through_console_restarts() {
        let (_tmp, restarter, console) = console_as("admin");
        let saved = console
            .save_file("app/docker-compose.yml", b"v2", false)
            .unwrap();

        let rolled = console
            .rollback_file(&saved.backup, "app/docker-compose.yml")
            .unwrap();
        assert!(rolled.restart.is_ok());
        assert_eq!(restarter.count(), 1);
        assert_eq!(console.read_file("app/docker-compose.yml").unwrap(), b"v1");
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let (_tmp, _r, console) = console_as("admin");
        for bad in [
            "../outside.yml",
            "app/../../outside.yml",
            "/etc/passwd",
            "",
            " app/docker-compose.yml",
            "app/docker-compose.yml ",
            "app/backups/docker-compose_20240101_000000.yml",
        ] {
            assert!(
                matches!(console.read_file(bad), Err(KeeperError::PathInvalid(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (tmp, _r, console) = console_as("admin");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.yml"), "s").unwrap();
        std::os::unix::fs::symlink(&outside, console.root().join("link")).unwrap();

        assert!(matches!(
            console.read_file("link/secret.yml"),
            Err(KeeperError::PathInvalid(_))
        ));
        assert!(matches!(
            console.save_file("link/secret.yml", b"x", false),
            Err(KeeperError::PathInvalid(_))
        ));
        assert_eq!(fs::read(outside.join("secret.yml")).unwrap(), b"s");
    }

    #[test]
    fn non_admin_cannot_touch_anything() {
        let (_tmp, restarter, console) = console_as("viewer");
        assert!(matches!(
            console.save_file("app/docker-compose.yml", b"x", true),
            Err(KeeperError::Forbidden(_))
        ));
        assert!(matches!(
            console.restart_file("app/docker-compose.yml"),
            Err(KeeperError::Forbidden(_))
        ));
        assert!(matches!(console.list_files(), Err(KeeperError::Forbidden(_))));
        assert_eq!(restarter.count(), 0);
    }

    #[test]
    fn unknown_operator_is_unauthenticated() {
        let (_tmp, _r, console) = console_as("stranger");
        assert!(matches!(
            console.list_backups("app/docker-compose.yml"),
            Err(KeeperError::Unauthenticated)
        ));
    }

    #[test]
    fn listing_skips_backup_folders() {
        let (_tmp, _r, console) = console_as("admin");
        console.create_directory("db").unwrap();
        console.create_file("db/compose.yaml", b"services: {}").unwrap();
        console
            .save_file("app/docker-compose.yml", b"v2", false)
            .unwrap();

        assert_eq!(
            console.list_files().unwrap(),
            vec!["app/docker-compose.yml".to_string(), "db/compose.yaml".to_string()]
        );
        assert_eq!(
            console.list_directories().unwrap(),
            vec!["app".to_string(), "db".to_string()]
        );
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let (_tmp, _r, console) = console_as("admin");
        assert!(matches!(
            console.create_file("app/docker-compose.yml", b"new"),
            Err(KeeperError::AlreadyExists(_))
        ));
        assert!(matches!(
            console.create_directory("app"),
            Err(KeeperError::AlreadyExists(_))
        ));
        assert_eq!(console.read_file("app/docker-compose.yml").unwrap(), b"v1");
    }

    #[test]
    fn restart_of_missing_file_is_read_error() {
        let (_tmp, restarter, console) = console_as("admin");
        assert!(matches!(
            console.restart_file("app/nope.yml"),
            Err(KeeperError::Read { .. })
        ));
        assert_eq!(restarter.count(), 0);
    }

    #[test]
    fn restart_failure_surfaces_as_phase_error() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("stack.yml"), "a").unwrap();
        let mut ops = BTreeMap::new();
        ops.insert("admin".to_string(), Role::Admin);
        let restarter = Arc::new(FakeRestarter {
            fail_start: true,
            ..FakeRestarter::default()
        });
        let revisions = RevisionController::new(BackupStore::new(20), restarter);
        let console = Console::new(
            &root,
            revisions,
            Box::new(OperatorTable::new(ops, Some("admin".into()))),
        )
        .unwrap();

        assert!(matches!(
            console.restart_file("stack.yml"),
            Err(KeeperError::StartPhaseFailed { .. })
        ));
    }
}
