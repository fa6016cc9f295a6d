use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{CaskError, Result};
use crate::hash::{hash_file, HashOptions};
use crate::manifest::format::{EntryKind, FileEntry, Record};
use crate::platform::fs as pfs;
use crate::store::ObjectKey;
use crate::target::Target;

const RESTORED_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub userid: Option<String>,
    pub set: String,
    /// `current`, or a compact run timestamp.
    pub when: String,
    /// Restore under this directory; when absent, under each recorded
    /// SOURCE root.
    pub output: Option<PathBuf>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    /// Files left alone because size and hash already matched.
    pub skipped: u64,
    pub bytes: u64,
}

/// Rebuild a run's tree from the manifest: directories as their D records
/// arrive, file content streamed back out of the object store, and mode,
/// owner, and times replayed from the records.
pub fn run(target: &Target, opts: &RestoreOptions) -> Result<RestoreStats> {
    let log = target.log(opts.userid.as_deref(), &opts.set);
    let mut stats = RestoreStats::default();
    let mut base: Option<PathBuf> = None;

    for record in log.iter(&opts.when)? {
        match record? {
            Record::Source { root } => {
                base = Some(match &opts.output {
                    Some(output) => output.clone(),
                    None => PathBuf::from(root),
                });
            }
            Record::Entry(entry) => {
                let Some(base) = base.as_deref() else {
                    return Err(CaskError::Parse(
                        "manifest entry precedes any SOURCE record".into(),
                    ));
                };
                let dest = base.join(sanitize_rel(&entry.path)?);
                match entry.kind {
                    EntryKind::Dir => restore_dir(&dest, &entry, &mut stats)?,
                    EntryKind::File => restore_file(target, &dest, &entry, &mut stats)?,
                }
            }
            _ => {}
        }
    }

    info!(
        set = %opts.set,
        when = %opts.when,
        files = stats.files,
        dirs = stats.dirs,
        skipped = stats.skipped,
        "restore complete"
    );
    Ok(stats)
}

fn entry_summary(entry: &FileEntry) -> pfs::MetadataSummary {
    pfs::MetadataSummary {
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        mtime: entry.mtime,
        ctime: entry.ctime,
        // The manifest records no atime; mirror the mtime.
        atime: entry.mtime,
        size: entry.size,
    }
}

fn restore_dir(dest: &Path, entry: &FileEntry, stats: &mut RestoreStats) -> Result<()> {
    // Force owner-execute so the restore cannot lock itself out of the
    // directory before the files inside land.
    let mut info = entry_summary(entry);
    info.mode |= 0o100;
    pfs::recursive_mkdir(dest, info.mode)?;
    pfs::replay_metadata(dest, &info, None)?;
    stats.dirs += 1;
    Ok(())
}

fn restore_file(
    target: &Target,
    dest: &Path,
    entry: &FileEntry,
    stats: &mut RestoreStats,
) -> Result<()> {
    let Some(hash) = entry.hash.as_ref() else {
        warn!(path = %entry.path, "file record has no hash, skipping");
        return Ok(());
    };
    let info = entry_summary(entry);

    if let Ok(metadata) = std::fs::symlink_metadata(dest) {
        if metadata.is_file() && metadata.len() == entry.size {
            let (local_hash, _) = hash_file(dest, &HashOptions::default())?;
            if local_hash == *hash {
                debug!(path = %entry.path, "local file already matches, replaying metadata");
                let prev = pfs::summarize_metadata(&metadata);
                pfs::replay_metadata(dest, &info, Some(&prev))?;
                stats.skipped += 1;
                return Ok(());
            }
        }
    }

    if let Some(parent) = dest.parent() {
        pfs::recursive_mkdir(parent, RESTORED_DIR_MODE | 0o100)?;
    }
    let key = ObjectKey::new(hash.clone(), entry.size);
    target.store().restore(&key, dest, false)?;
    pfs::replay_metadata(dest, &info, None)?;
    stats.files += 1;
    stats.bytes += entry.size;
    Ok(())
}

/// Reject absolute paths and parent traversal in recorded entry paths.
fn sanitize_rel(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(CaskError::Parse(format!(
            "refusing to restore absolute path '{raw}'"
        )));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(CaskError::Parse(format!(
                    "refusing to restore unsafe path '{raw}'"
                )))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(CaskError::Parse(format!(
            "refusing to restore empty path '{raw}'"
        )));
    }
    Ok(out)
}
