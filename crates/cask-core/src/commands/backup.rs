use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{CaskError, Result};
use crate::filter::FilterSet;
use crate::hash::{hash_file, HashOptions};
use crate::manifest::format::{EntryKind, FileEntry, RunStats};
use crate::manifest::{join_source, LastBackup, LogWriter, RUNNING};
use crate::platform::fs as pfs;
use crate::store::{ObjectKey, Store};
use crate::target::Target;

/// One source tree to back up.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub root: PathBuf,
    /// When non-empty, only these subdirectories of `root` are walked.
    pub subdirs: Vec<PathBuf>,
    /// `+`/`-` filter patterns, last match wins.
    pub filters: Vec<String>,
}

impl SourceSpec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            subdirs: Vec::new(),
            filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub userid: Option<String>,
    pub set: String,
    pub sources: Vec<SourceSpec>,
    /// Rehash files even when size and mtime match the previous run.
    pub check_hash: bool,
    /// Keep descending into excluded subtrees so `+` filters deeper down
    /// can still re-include content.
    pub deepscan: bool,
}

impl BackupOptions {
    pub fn new(set: impl Into<String>) -> Self {
        Self {
            userid: None,
            set: set.into(),
            sources: Vec::new(),
            check_hash: false,
            deepscan: false,
        }
    }
}

/// Run a backup: walk every source, store new objects, and finalise the
/// manifest log. Returns the run's stats (also recorded in the STATUS line).
pub fn run(target: &Target, opts: &BackupOptions) -> Result<RunStats> {
    let log = target.log(opts.userid.as_deref(), &opts.set);
    let last = log.last_backup()?;
    let mut writer = log.create(RUNNING)?;
    let mut stats = RunStats::default();

    for source in &opts.sources {
        let root = std::fs::canonicalize(&source.root)?;
        let root_str = root.to_string_lossy().replace('\\', "/");
        writer.append_source(&root_str)?;

        let mut walker = SourceWalker {
            store: target.store(),
            writer: &mut writer,
            filter: FilterSet::parse(&source.filters)?,
            root: &root,
            root_str: &root_str,
            last: last.as_ref(),
            check_hash: opts.check_hash,
            deepscan: opts.deepscan,
            stats: &mut stats,
        };
        if source.subdirs.is_empty() {
            walker.walk_children(&root, false)?;
        } else {
            for sub in &source.subdirs {
                walker.walk_dir(&root.join(sub), false)?;
            }
        }
    }

    writer.finish("OK", &stats)?;
    let when = log.complete(Utc::now())?;
    info!(
        set = %opts.set,
        when = %when,
        files = stats.files,
        backed_up = stats.backed_up.files,
        skipped = stats.skipped,
        "backup complete"
    );
    Ok(stats)
}

/// Recursive walk over one source root.
///
/// Per-entry stat/read failures are logged and counted as skipped; only
/// manifest writes and object-store puts abort the run. Directory
/// enumeration failures are logged and the subtree is abandoned.
struct SourceWalker<'a> {
    store: &'a Store,
    writer: &'a mut LogWriter,
    filter: FilterSet,
    root: &'a Path,
    root_str: &'a str,
    last: Option<&'a LastBackup>,
    check_hash: bool,
    deepscan: bool,
    stats: &'a mut RunStats,
}

impl SourceWalker<'_> {
    fn rel_of(&self, path: &Path) -> String {
        path.strip_prefix(self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Visit a directory: record it (unless scanning-only) and descend.
    fn walk_dir(&mut self, dir: &Path, scan_only: bool) -> Result<()> {
        if !scan_only {
            let metadata = match std::fs::symlink_metadata(dir) {
                Ok(m) => m,
                Err(e) => {
                    warn!(dir = %dir.display(), "cannot stat directory: {e}");
                    self.stats.skipped += 1;
                    return Ok(());
                }
            };
            let summary = pfs::summarize_metadata(&metadata);
            let rel = self.rel_of(dir);
            let code = self.dir_code(&join_source(self.root_str, &rel), &summary);
            self.count_code(code);
            debug!(path = %rel, code = %code, "directory");
            self.writer.append_entry(&FileEntry {
                kind: EntryKind::Dir,
                uid: summary.uid,
                gid: summary.gid,
                mode: summary.mode,
                ctime: summary.ctime,
                mtime: summary.mtime,
                size: 0,
                hash: None,
                path: rel,
            })?;
            self.stats.dirs += 1;
        }
        self.walk_children(dir, scan_only)
    }

    fn walk_children(&mut self, dir: &Path, scan_only: bool) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), "cannot enumerate directory: {e}");
                return Ok(());
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %dir.display(), "bad directory entry: {e}");
                    self.stats.skipped += 1;
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), "cannot stat entry: {e}");
                    self.stats.skipped += 1;
                    continue;
                }
            };
            let rel = self.rel_of(&path);

            if file_type.is_symlink() {
                debug!(path = %rel, "skipping symlink");
                self.stats.skipped += 1;
            } else if file_type.is_dir() {
                if scan_only {
                    // Stay in scan-only mode unless a `+` filter explicitly
                    // re-includes this subtree.
                    let include = self.filter.includes(&rel);
                    self.walk_dir(&path, !include)?;
                } else if self.filter.ignores(&rel).is_some() {
                    if self.deepscan {
                        debug!(path = %rel, "excluded directory, scanning for re-includes");
                        self.walk_dir(&path, true)?;
                    } else {
                        debug!(path = %rel, "pruned excluded directory");
                    }
                } else {
                    self.walk_dir(&path, false)?;
                }
            } else if file_type.is_file() {
                let included = if scan_only {
                    self.filter.includes(&rel)
                } else {
                    self.filter.ignores(&rel).is_none()
                };
                if included {
                    self.backup_file(&path, rel)?;
                } else {
                    debug!(path = %rel, "excluded file");
                }
            } else {
                warn!(path = %rel, "skipping entry of unknown type");
            }
        }
        Ok(())
    }

    fn backup_file(&mut self, path: &Path, rel: String) -> Result<()> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %rel, "cannot stat file: {e}");
                self.stats.skipped += 1;
                return Ok(());
            }
        };
        let summary = pfs::summarize_metadata(&metadata);

        let joined = join_source(self.root_str, &rel);
        let prior = self.last.and_then(|l| l.files.get(&joined));
        // Reuse the recorded hash only when the file cannot have changed
        // since the last run: mtime at or before that run's completion, and
        // size and mtime exactly as recorded.
        let reusable_hash = match (self.last, prior) {
            (Some(last), Some(p))
                if summary.mtime <= last.time
                    && p.size == summary.size
                    && p.mtime == summary.mtime =>
            {
                p.hash.clone()
            }
            _ => None,
        };

        let (hash, code) = match reusable_hash {
            Some(hash) if !self.check_hash => (hash, '-'),
            reusable => {
                let computed = match hash_file(path, &HashOptions::default()) {
                    Ok((digest, _)) => digest,
                    Err(CaskError::Io(e)) => {
                        warn!(path = %rel, "cannot read file: {e}");
                        self.stats.skipped += 1;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let code = if reusable.is_some() {
                    'c'
                } else if prior.is_some() {
                    'u'
                } else {
                    'a'
                };
                (computed, code)
            }
        };
        self.count_code(code);
        debug!(path = %rel, code = %code, "file");

        // The object must be durable before its F record lands; put and
        // append failures both abort the run.
        let key = ObjectKey::new(hash.clone(), summary.size);
        let outcome = self.store.put(path, &key, false)?;

        self.stats.files += 1;
        self.stats.bytes += summary.size;
        if outcome.written {
            self.stats.backed_up.files += 1;
            self.stats.backed_up.bytes += summary.size;
        }

        self.writer.append_entry(&FileEntry {
            kind: EntryKind::File,
            uid: summary.uid,
            gid: summary.gid,
            mode: summary.mode,
            ctime: summary.ctime,
            mtime: summary.mtime,
            size: summary.size,
            hash: Some(hash),
            path: rel,
        })?;
        Ok(())
    }

    fn dir_code(&self, joined: &str, summary: &pfs::MetadataSummary) -> char {
        match self.last {
            None => 'a',
            Some(last) if last.dirs.contains_key(joined) && summary.mtime > last.time => 'u',
            Some(_) => '-',
        }
    }

    fn count_code(&mut self, code: char) {
        match code {
            'a' => self.stats.added += 1,
            'u' => self.stats.updated += 1,
            'c' => self.stats.checked += 1,
            _ => self.stats.unchanged += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::format::Record;
    use crate::manifest::CURRENT;
    use crate::testutil::{entries_of, temp_target, write_source_file};

    fn opts_for(root: &Path) -> BackupOptions {
        let mut opts = BackupOptions::new("set1");
        opts.sources.push(SourceSpec::new(root));
        opts
    }

    #[test]
    fn first_backup_records_source_files_and_status() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        write_source_file(&src, "sub/b.txt", b"world\n");

        let stats = run(&target, &opts_for(&src)).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 1);
        assert_eq!(stats.backed_up.files, 2);
        assert_eq!(stats.added, 3);

        let records: Vec<Record> = target
            .log(None, "set1")
            .iter(CURRENT)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert!(matches!(records[0], Record::Header { .. }));
        assert!(matches!(records[1], Record::Source { .. }));
        assert!(matches!(records.last().unwrap(), Record::Status { .. }));
    }

    #[test]
    fn object_store_holds_one_object_per_unique_content() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"same\n");
        write_source_file(&src, "b.txt", b"same\n");

        let stats = run(&target, &opts_for(&src)).unwrap();
        assert_eq!(stats.files, 2);
        // Deduplicated: only the first put wrote bytes.
        assert_eq!(stats.backed_up.files, 1);
    }

    #[test]
    fn unchanged_files_reuse_prior_hash_without_rehash() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        let file = write_source_file(&src, "a.txt", b"hello\n");
        // Pin the mtime well into the past so it is ≤ the first run's time.
        crate::platform::fs::set_file_times(
            &file,
            chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        )
        .unwrap();

        run(&target, &opts_for(&src)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let stats = run(&target, &opts_for(&src)).unwrap();

        assert_eq!(stats.files, 1);
        assert_eq!(stats.backed_up.files, 0);
        assert_eq!(stats.unchanged, 1);

        // The reused hash still points at the stored object.
        let entries = entries_of(&target, "set1", CURRENT);
        let entry = entries.iter().find(|e| e.path == "a.txt").unwrap();
        assert!(target
            .store()
            .exists(&ObjectKey::new(entry.hash.clone().unwrap(), entry.size)));
    }

    #[test]
    fn check_hash_rehashes_even_when_metadata_matches() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        let file = write_source_file(&src, "a.txt", b"hello\n");
        crate::platform::fs::set_file_times(
            &file,
            chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        )
        .unwrap();

        run(&target, &opts_for(&src)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut opts = opts_for(&src);
        opts.check_hash = true;
        let stats = run(&target, &opts).unwrap();
        assert_eq!(stats.checked, 1);
        assert_eq!(stats.unchanged, 0);
    }

    #[test]
    fn modified_file_is_rehashed_and_marked_updated() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        run(&target, &opts_for(&src)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        write_source_file(&src, "a.txt", b"changed\n");
        let stats = run(&target, &opts_for(&src)).unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.backed_up.files, 1);
    }

    #[test]
    fn excluded_subtree_is_pruned_without_deepscan() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "keep.txt", b"keep\n");
        write_source_file(&src, "skip/keep/x", b"x\n");

        let mut opts = opts_for(&src);
        opts.sources[0].filters = vec!["-**/skip".into(), "+**/skip/keep".into()];
        run(&target, &opts).unwrap();

        let entries = entries_of(&target, "set1", CURRENT);
        assert!(entries.iter().any(|e| e.path == "keep.txt"));
        assert!(!entries.iter().any(|e| e.path.starts_with("skip")));
    }

    #[test]
    fn deepscan_reincludes_through_excluded_subtree() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "skip/keep/x", b"x\n");
        write_source_file(&src, "skip/other/y", b"y\n");

        let mut opts = opts_for(&src);
        opts.deepscan = true;
        opts.sources[0].filters = vec!["-**/skip".into(), "+**/skip/keep".into()];
        run(&target, &opts).unwrap();

        let entries = entries_of(&target, "set1", CURRENT);
        assert!(entries.iter().any(|e| e.path == "skip/keep/x"));
        assert!(!entries.iter().any(|e| e.path.contains("other")));
        // The excluded parent itself produced no D record.
        assert!(!entries
            .iter()
            .any(|e| e.kind == EntryKind::Dir && e.path == "skip"));
    }

    #[test]
    fn subdirs_limit_the_walk() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "wanted/a.txt", b"a\n");
        write_source_file(&src, "ignored/b.txt", b"b\n");

        let mut opts = opts_for(&src);
        opts.sources[0].subdirs = vec![PathBuf::from("wanted")];
        run(&target, &opts).unwrap();

        let entries = entries_of(&target, "set1", CURRENT);
        assert!(entries.iter().any(|e| e.path == "wanted/a.txt"));
        assert!(entries
            .iter()
            .any(|e| e.kind == EntryKind::Dir && e.path == "wanted"));
        assert!(!entries.iter().any(|e| e.path.contains("ignored")));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped_and_counted() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        std::os::unix::fs::symlink(src.join("a.txt"), src.join("link")).unwrap();

        let stats = run(&target, &opts_for(&src)).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.skipped, 1);
    }
}
