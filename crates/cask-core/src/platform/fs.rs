use std::fs::Metadata;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{CaskError, Result};

/// Stat fields the manifest records and restore replays.
///
/// Times are truncated to millisecond precision: manifest lines carry
/// milliseconds, and the walker's skip decision compares stat times against
/// recorded times for exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataSummary {
    /// Permission bits only (no file-type bits).
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    pub size: u64,
}

fn truncate_to_millis(secs: i64, nanos: u32) -> DateTime<Utc> {
    let millis = secs * 1000 + i64::from(nanos) / 1_000_000;
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub fn summarize_metadata(metadata: &Metadata) -> MetadataSummary {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        MetadataSummary {
            mode: metadata.mode() & 0o7777,
            uid: Some(metadata.uid()),
            gid: Some(metadata.gid()),
            mtime: truncate_to_millis(metadata.mtime(), metadata.mtime_nsec() as u32),
            ctime: truncate_to_millis(metadata.ctime(), metadata.ctime_nsec() as u32),
            atime: truncate_to_millis(metadata.atime(), metadata.atime_nsec() as u32),
            size: metadata.len(),
        }
    }

    #[cfg(not(unix))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};

        let to_dt = |t: std::io::Result<SystemTime>| -> DateTime<Utc> {
            let st = t.unwrap_or(UNIX_EPOCH);
            let dur = st.duration_since(UNIX_EPOCH).unwrap_or_default();
            truncate_to_millis(dur.as_secs() as i64, dur.subsec_nanos())
        };

        let readonly = metadata.permissions().readonly();
        let mode = if metadata.is_dir() {
            if readonly {
                0o555
            } else {
                0o755
            }
        } else if readonly {
            0o444
        } else {
            0o644
        };

        MetadataSummary {
            mode,
            uid: None,
            gid: None,
            mtime: to_dt(metadata.modified()),
            ctime: to_dt(metadata.created()),
            atime: to_dt(metadata.accessed()),
            size: metadata.len(),
        }
    }
}

/// Create `path` and any missing ancestors, each with `mode`.
///
/// Fails with `PartialPathIsFile` if an existing component is not a
/// directory, instead of the opaque error `create_dir_all` would give.
pub fn recursive_mkdir(path: &Path, mode: u32) -> Result<()> {
    let mut built = PathBuf::new();
    for component in path.components() {
        built.push(component);
        match std::fs::symlink_metadata(&built) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                return Err(CaskError::PartialPathIsFile(
                    built.to_string_lossy().into_owned(),
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                create_dir_with_mode(&built, mode)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn create_dir_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().mode(mode).create(path)
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        std::fs::create_dir(path)
    }
}

pub fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)?;
    Ok(())
}

/// Hard-link `from` to `to`. Surfaces `LinkUnsupported` when the filesystem
/// rejects links so the caller can fall back to a byte copy.
pub fn hardlink(from: &Path, to: &Path) -> Result<()> {
    match std::fs::hard_link(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::Unsupported => Err(CaskError::LinkUnsupported(
            from.to_string_lossy().into_owned(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Hard-link with the copy fallback: link, and on `LinkUnsupported` copy the
/// bytes and replay the source's stat times and mode onto the copy.
pub fn hardlink_or_copy(from: &Path, to: &Path) -> Result<()> {
    match hardlink(from, to) {
        Ok(()) => Ok(()),
        Err(CaskError::LinkUnsupported(_)) => {
            warn!(from = %from.display(), "hard links unsupported, copying instead");
            std::fs::copy(from, to)?;
            let info = summarize_metadata(&std::fs::metadata(from)?);
            replay_metadata(to, &info, None)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly((mode & 0o200) == 0);
        std::fs::set_permissions(path, perms)
    }
}

pub fn set_file_times(path: &Path, atime: DateTime<Utc>, mtime: DateTime<Utc>) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null")
        })?;
        let to_spec = |t: DateTime<Utc>| libc::timespec {
            tv_sec: t.timestamp() as _,
            tv_nsec: t.timestamp_subsec_nanos() as _,
        };
        let times = [to_spec(atime), to_spec(mtime)];
        if unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        use std::fs::FileTimes;
        use std::time::{Duration, SystemTime};

        let to_st = |t: DateTime<Utc>| {
            SystemTime::UNIX_EPOCH + Duration::from_millis(t.timestamp_millis().max(0) as u64)
        };
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_times(
            FileTimes::new()
                .set_accessed(to_st(atime))
                .set_modified(to_st(mtime)),
        )
    }
}

#[cfg(unix)]
fn apply_owner(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null"))?;
    if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Apply mode, owner, and times from `info`, skipping fields equal to `prev`
/// (spares the syscalls when restoring over an already-correct file).
///
/// `PermissionDenied` is logged and swallowed; anything else propagates.
pub fn replay_metadata(
    target: &Path,
    info: &MetadataSummary,
    prev: Option<&MetadataSummary>,
) -> Result<()> {
    let soften = |what: &str, r: std::io::Result<()>| -> Result<()> {
        match r {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(path = %target.display(), "cannot replay {what}: {e}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    };

    if prev.is_none_or(|p| p.mode != info.mode) {
        soften("mode", apply_mode(target, info.mode))?;
    }

    #[cfg(unix)]
    if let (Some(uid), Some(gid)) = (info.uid, info.gid) {
        if prev.is_none_or(|p| p.uid != info.uid || p.gid != info.gid) {
            soften("owner", apply_owner(target, uid, gid))?;
        }
    }

    if prev.is_none_or(|p| p.mtime != info.mtime || p.atime != info.atime) {
        soften("times", set_file_times(target, info.atime, info.mtime))?;
    }

    Ok(())
}
