use std::path::{Path, PathBuf};

use crate::manifest::format::{FileEntry, Record};
use crate::target::Target;

/// A fresh target inside a temp dir. Keep the guard alive for the test.
pub fn temp_target() -> (tempfile::TempDir, Target) {
    let tmp = tempfile::tempdir().unwrap();
    let target = Target::init(&tmp.path().join("target")).unwrap();
    (tmp, target)
}

/// Write a file under `root/rel`, creating parent directories.
pub fn write_source_file(root: &Path, rel: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    path
}

/// All D/F entries of a set's log, in record order.
pub fn entries_of(target: &Target, set: &str, when: &str) -> Vec<FileEntry> {
    target
        .log(None, set)
        .iter(when)
        .unwrap()
        .filter_map(|record| match record.unwrap() {
            Record::Entry(entry) => Some(entry),
            _ => None,
        })
        .collect()
}
