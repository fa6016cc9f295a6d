pub mod format;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CaskError, Result};
use crate::platform::fs as pfs;
use crate::store::ObjectKey;

use format::{
    compact_when, expand_when, parse_line, record_to_line, EntryKind, FileEntry, Record, RunStats,
    HEADER_V2,
};

/// `<when>` of an in-progress run.
pub const RUNNING: &str = "running";
/// `<when>` of the alias to the newest finalised run.
pub const CURRENT: &str = "current";

const LOG_DIR_MODE: u32 = 0o755;

/// The manifest logs of one backup set: `backups/[<userid>/]<set>.<when>`.
pub struct BackupLog {
    dir: PathBuf,
    set: String,
}

impl BackupLog {
    pub fn new(backups_root: &Path, userid: Option<&str>, set: &str) -> Self {
        let dir = match userid {
            Some(u) if !u.is_empty() => backups_root.join(u),
            _ => backups_root.to_path_buf(),
        };
        Self {
            dir,
            set: set.to_string(),
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set
    }

    pub fn path_for(&self, when: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.set, when))
    }

    pub fn exists(&self, when: &str) -> bool {
        self.path_for(when).is_file()
    }

    /// Create the log for `when` and write the header line. The file is
    /// opened exclusively; a leftover log of the same name is an error.
    pub fn create(&self, when: &str) -> Result<LogWriter> {
        pfs::recursive_mkdir(&self.dir, LOG_DIR_MODE)?;
        let path = self.path_for(when);
        let file = open_log_file(&path)?;
        let mut writer = LogWriter { file };
        writer.append_line(HEADER_V2)?;
        Ok(writer)
    }

    /// Iterate parsed records of the log for `when`.
    pub fn iter(&self, when: &str) -> Result<RecordIter> {
        let path = self.path_for(when);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaskError::NotFound(path.to_string_lossy().into_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(RecordIter {
            lines: BufReader::new(file).lines(),
        })
    }

    /// Accumulate the `(hash, size)` reference counts of every F record.
    pub fn hashes(&self, when: &str, out: &mut HashMap<ObjectKey, u64>) -> Result<()> {
        for record in self.iter(when)? {
            if let Record::Entry(entry) = record? {
                if entry.kind == EntryKind::File {
                    if let Some(hash) = entry.hash {
                        *out.entry(ObjectKey::new(hash, entry.size)).or_insert(0) += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Finalised `<when>` suffixes for this set, lexicographically sorted
    /// (which is chronological, given the fixed timestamp format).
    pub fn instances(&self) -> Result<Vec<String>> {
        let mut whens = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(whens),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}.", self.set);
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(when) = name.strip_prefix(&prefix) {
                if when != RUNNING && when != CURRENT {
                    whens.push(when.to_string());
                }
            }
        }
        whens.sort();
        Ok(whens)
    }

    /// Materialise the most recent finalised run for skip decisions: entries
    /// keyed by the absolute path `join(source, entry.path)`.
    pub fn last_backup(&self) -> Result<Option<LastBackup>> {
        let Some(when) = self.instances()?.pop() else {
            return Ok(None);
        };
        let time = expand_when(&when)?;

        let mut last = LastBackup {
            when: when.clone(),
            time,
            files: HashMap::new(),
            dirs: HashMap::new(),
        };
        let mut source = String::new();
        for record in self.iter(&when)? {
            match record? {
                Record::Source { root } => source = root,
                Record::Entry(entry) => {
                    let joined = join_source(&source, &entry.path);
                    let value = LastEntry {
                        hash: entry.hash,
                        size: entry.size,
                        source: source.clone(),
                        ctime: entry.ctime,
                        mtime: entry.mtime,
                    };
                    match entry.kind {
                        EntryKind::File => last.files.insert(joined, value),
                        EntryKind::Dir => last.dirs.insert(joined, value),
                    };
                }
                _ => {}
            }
        }
        Ok(Some(last))
    }

    /// Finalise the `running` log: rename it to the compact timestamp, then
    /// repoint `current` via hard link, copying where links are unsupported.
    pub fn complete(&self, ts: DateTime<Utc>) -> Result<String> {
        let when = compact_when(ts);
        let running = self.path_for(RUNNING);
        let finalised = self.path_for(&when);
        pfs::rename(&running, &finalised)?;

        let current = self.path_for(CURRENT);
        match std::fs::remove_file(&current) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        pfs::hardlink_or_copy(&finalised, &current)?;
        debug!(set = %self.set, when = %when, "run finalised");
        Ok(when)
    }
}

/// Join a source root and a relative entry path into the lookup key used by
/// the walker.
pub fn join_source(source: &str, rel: &str) -> String {
    if rel.is_empty() {
        source.to_string()
    } else {
        format!("{}/{}", source.trim_end_matches('/'), rel)
    }
}

pub struct RecordIter {
    lines: std::io::Lines<BufReader<File>>,
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    return Some(parse_line(&line));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Append handle for an open log. Every write seeks to the end first, so
/// interleaved readers never see a torn record.
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    fn append_line(&mut self, line: &str) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    pub fn append_source(&mut self, root: &str) -> Result<()> {
        self.append_line(&record_to_line(&Record::Source {
            root: root.to_string(),
        }))
    }

    pub fn append_entry(&mut self, entry: &FileEntry) -> Result<()> {
        self.append_line(&format::entry_to_line(entry))
    }

    /// Write the STATUS terminator and close the log.
    pub fn finish(mut self, status: &str, stats: &RunStats) -> Result<()> {
        let stats_json = serde_json::to_string(stats)?;
        self.append_line(&record_to_line(&Record::Status {
            version: 2,
            status: status.to_string(),
            stats_json,
        }))
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}

/// One entry of the previous run, looked up by absolute path.
#[derive(Debug, Clone)]
pub struct LastEntry {
    pub hash: Option<String>,
    pub size: u64,
    pub source: String,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
}

/// The previous finalised run, materialised for the walker.
#[derive(Debug)]
pub struct LastBackup {
    pub when: String,
    pub time: DateTime<Utc>,
    pub files: HashMap<String, LastEntry>,
    pub dirs: HashMap<String, LastEntry>,
}
