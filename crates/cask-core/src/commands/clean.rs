use tracing::{info, warn};

use crate::error::Result;
use crate::target::Target;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanStats {
    pub removed: u64,
    pub kept: u64,
    pub bytes_freed: u64,
}

/// Garbage-collect the object store: delete every object whose key is not
/// in the live set, pruning directories emptied along the way. Refuses to
/// run while a `.running` log exists.
pub fn run(target: &Target) -> Result<CleanStats> {
    let live = target.live_set()?;
    let mut stats = CleanStats::default();

    for (path, key) in target.store().scan()? {
        let is_live = key.as_ref().is_some_and(|k| live.contains_key(k));
        if is_live {
            stats.kept += 1;
            continue;
        }
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match target.store().remove_leaf(&path) {
            Ok(()) => {
                stats.removed += 1;
                stats.bytes_freed += size;
            }
            Err(e) => warn!(path = %path.display(), "cannot remove orphan: {e}"),
        }
    }

    info!(
        removed = stats.removed,
        kept = stats.kept,
        bytes_freed = stats.bytes_freed,
        "clean complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::backup::{self, BackupOptions, SourceSpec};
    use crate::error::CaskError;
    use crate::manifest::RUNNING;
    use crate::store::ObjectKey;
    use crate::testutil::{temp_target, write_source_file};

    fn backup_src(target: &Target, src: &std::path::Path) {
        let mut opts = BackupOptions::new("set1");
        opts.sources.push(SourceSpec::new(src));
        backup::run(target, &opts).unwrap();
    }

    #[test]
    fn orphan_is_removed_and_parents_pruned() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_src(&target, &src);

        let stray = ObjectKey::new(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            1,
        );
        let stray_path = target.store().object_path(&stray);
        std::fs::create_dir_all(stray_path.parent().unwrap()).unwrap();
        std::fs::write(&stray_path, b"x").unwrap();

        let stats = run(&target).unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.bytes_freed, 1);

        assert!(!stray_path.exists());
        // Emptied fan-out directories are pruned; the store root stays.
        assert!(!target.store().root().join("ff").exists());
        assert!(target.store().root().is_dir());
    }

    #[test]
    fn live_objects_survive_clean() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_src(&target, &src);

        let stats = run(&target).unwrap();
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.kept, 1);

        // The live set still resolves on disk afterwards.
        for key in target.live_set().unwrap().keys() {
            assert!(target.store().exists(key));
        }
    }

    #[test]
    fn stray_non_key_files_are_swept() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_src(&target, &src);

        let stray = target.store().root().join("58/91/leftover.tmp");
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, b"partial").unwrap();

        let stats = run(&target).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(!stray.exists());
    }

    #[test]
    fn refuses_while_a_run_is_in_progress() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_src(&target, &src);

        let _writer = target.log(None, "set2").create(RUNNING).unwrap();
        assert!(matches!(
            run(&target).unwrap_err(),
            CaskError::RunningRunConflict(_)
        ));
    }
}
