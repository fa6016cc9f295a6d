use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CaskError, Result};
use crate::manifest::{BackupLog, CURRENT, RUNNING};
use crate::platform::fs as pfs;
use crate::store::{ObjectKey, Store, STORE_DIR};

pub const CONFIG_FILE: &str = "config.json";
pub const BACKUPS_DIR: &str = "backups";

/// The only filesystem layout this engine speaks.
pub const FSTYPE_V5: &str = "hash-v5";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub version: u32,
    pub fstype: String,
    pub saved: DateTime<Utc>,
}

/// One finalised (or in-progress) manifest log in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRef {
    pub userid: Option<String>,
    pub set: String,
    pub when: String,
}

/// A backup destination directory: `config.json`, the object store under
/// `files.db/`, and manifest logs under `backups/`.
#[derive(Debug)]
pub struct Target {
    root: PathBuf,
    config: TargetConfig,
    store: Store,
}

impl Target {
    /// Create a fresh target at `root`.
    pub fn init(root: &Path) -> Result<Target> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(CaskError::Config(format!(
                "target already initialised at '{}'",
                root.display()
            )));
        }
        pfs::recursive_mkdir(root, 0o755)?;
        pfs::recursive_mkdir(&root.join(STORE_DIR), 0o700)?;
        pfs::recursive_mkdir(&root.join(BACKUPS_DIR), 0o755)?;

        let config = TargetConfig {
            version: 1,
            fstype: FSTYPE_V5.to_string(),
            saved: Utc::now(),
        };
        std::fs::write(&config_path, serde_json::to_string(&config)?)?;

        Ok(Target {
            store: Store::new(root.join(STORE_DIR)),
            root: root.to_path_buf(),
            config,
        })
    }

    /// Mount an existing target, verifying its filesystem type.
    pub fn connect(root: &Path) -> Result<Target> {
        if !root.is_dir() {
            return Err(CaskError::LocationUnset(
                root.to_string_lossy().into_owned(),
            ));
        }
        let config_path = root.join(CONFIG_FILE);
        let raw = match std::fs::read_to_string(&config_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaskError::NotFound(
                    config_path.to_string_lossy().into_owned(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let config: TargetConfig = serde_json::from_str(&raw)?;
        if config.fstype != FSTYPE_V5 {
            return Err(CaskError::UnknownFilesystem(config.fstype));
        }
        Ok(Target {
            store: Store::new(root.join(STORE_DIR)),
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn log(&self, userid: Option<&str>, set: &str) -> BackupLog {
        BackupLog::new(&self.backups_dir(), userid, set)
    }

    /// Every finalised log in the target, across userids and sets.
    pub fn logs(&self) -> Result<Vec<LogRef>> {
        let mut refs = Vec::new();
        let backups = self.backups_dir();
        for entry in read_dir_or_empty(&backups)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if entry.file_type()?.is_dir() {
                let userid = name.to_string();
                for sub in read_dir_or_empty(&entry.path())? {
                    let sub = sub?;
                    if !sub.file_type()?.is_file() {
                        continue;
                    }
                    if let Some(name) = sub.file_name().to_str() {
                        push_log_ref(&mut refs, Some(&userid), name);
                    }
                }
            } else if entry.file_type()?.is_file() {
                push_log_ref(&mut refs, None, name);
            }
        }
        refs.sort_by(|a, b| (&a.userid, &a.set, &a.when).cmp(&(&b.userid, &b.set, &b.when)));
        Ok(refs)
    }

    /// The first `.running` log found, if any run is in progress.
    pub fn running_run(&self) -> Result<Option<PathBuf>> {
        let suffix = format!(".{RUNNING}");
        let backups = self.backups_dir();
        for entry in read_dir_or_empty(&backups)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for sub in read_dir_or_empty(&entry.path())? {
                    let sub = sub?;
                    if sub.file_type()?.is_file()
                        && sub.file_name().to_string_lossy().ends_with(&suffix)
                    {
                        return Ok(Some(sub.path()));
                    }
                }
            } else if entry.file_type()?.is_file()
                && entry.file_name().to_string_lossy().ends_with(&suffix)
            {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Error out when a `.running` log exists; fsck and clean call this
    /// before touching the object store.
    pub fn ensure_quiescent(&self) -> Result<()> {
        match self.running_run()? {
            Some(path) => Err(CaskError::RunningRunConflict(
                path.to_string_lossy().into_owned(),
            )),
            None => Ok(()),
        }
    }

    /// The live set: every `(hash, size)` referenced by any finalised
    /// manifest, with reference counts. Refuses to compute while a run is
    /// in progress.
    pub fn live_set(&self) -> Result<HashMap<ObjectKey, u64>> {
        self.ensure_quiescent()?;
        let mut live = HashMap::new();
        for log_ref in self.logs()? {
            let log = self.log(log_ref.userid.as_deref(), &log_ref.set);
            log.hashes(&log_ref.when, &mut live)?;
        }
        Ok(live)
    }
}

fn read_dir_or_empty(path: &Path) -> Result<std::vec::IntoIter<std::io::Result<std::fs::DirEntry>>> {
    match std::fs::read_dir(path) {
        Ok(entries) => Ok(entries.collect::<Vec<_>>().into_iter()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new().into_iter()),
        Err(e) => Err(e.into()),
    }
}

fn push_log_ref(refs: &mut Vec<LogRef>, userid: Option<&str>, name: &str) {
    let Some((set, when)) = name.rsplit_once('.') else {
        warn!(name, "ignoring log with no '.<when>' suffix");
        return;
    };
    if when == RUNNING || when == CURRENT {
        return;
    }
    refs.push(LogRef {
        userid: userid.map(str::to_string),
        set: set.to_string(),
        when: when.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::format::RunStats;

    #[test]
    fn init_lays_out_target_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("t");
        let target = Target::init(&root).unwrap();
        assert!(root.join(CONFIG_FILE).is_file());
        assert!(root.join(STORE_DIR).is_dir());
        assert!(root.join(BACKUPS_DIR).is_dir());
        assert_eq!(target.config().fstype, FSTYPE_V5);
    }

    #[test]
    fn init_refuses_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("t");
        Target::init(&root).unwrap();
        assert!(matches!(
            Target::init(&root).unwrap_err(),
            CaskError::Config(_)
        ));
    }

    #[test]
    fn connect_verifies_fstype() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("t");
        Target::init(&root).unwrap();
        Target::connect(&root).unwrap();

        let bogus = TargetConfig {
            version: 1,
            fstype: "hash-v9".into(),
            saved: Utc::now(),
        };
        std::fs::write(
            root.join(CONFIG_FILE),
            serde_json::to_string(&bogus).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            Target::connect(&root).unwrap_err(),
            CaskError::UnknownFilesystem(_)
        ));
    }

    #[test]
    fn connect_missing_root_is_location_unset() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Target::connect(&tmp.path().join("nowhere")).unwrap_err();
        assert!(matches!(err, CaskError::LocationUnset(_)));
    }

    #[test]
    fn connect_plain_directory_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Target::connect(tmp.path()).unwrap_err();
        assert!(matches!(err, CaskError::NotFound(_)));
    }

    fn finalise_empty_run(target: &Target, userid: Option<&str>, set: &str, ts: &str) {
        let log = target.log(userid, set);
        let writer = log.create(RUNNING).unwrap();
        writer.finish("OK", &RunStats::default()).unwrap();
        log.complete(crate::manifest::format::parse_time(ts).unwrap())
            .unwrap();
    }

    #[test]
    fn logs_enumerates_across_userids_excluding_aliases() {
        let tmp = tempfile::tempdir().unwrap();
        let target = Target::init(&tmp.path().join("t")).unwrap();
        finalise_empty_run(&target, None, "set1", "2024-01-15T13:45:12.345Z");
        finalise_empty_run(&target, Some("u1"), "set2", "2024-02-01T00:00:00.000Z");

        let refs = target.logs().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].userid, None);
        assert_eq!(refs[0].set, "set1");
        assert_eq!(refs[1].userid.as_deref(), Some("u1"));
        assert_eq!(refs[1].when, "20240201T000000000Z");
    }

    #[test]
    fn quiescence_gate_trips_on_running_log() {
        let tmp = tempfile::tempdir().unwrap();
        let target = Target::init(&tmp.path().join("t")).unwrap();
        target.ensure_quiescent().unwrap();

        let _writer = target.log(None, "set1").create(RUNNING).unwrap();
        assert!(matches!(
            target.ensure_quiescent().unwrap_err(),
            CaskError::RunningRunConflict(_)
        ));
        assert!(matches!(
            target.live_set().unwrap_err(),
            CaskError::RunningRunConflict(_)
        ));
    }
}
