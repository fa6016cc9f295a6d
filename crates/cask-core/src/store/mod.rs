use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::compress;
use crate::compress::pipe::{chunk_pipe, PIPE_CHUNK_SIZE};
use crate::error::{CaskError, Result};
use crate::hash::{hash_reader, HashOptions};
use crate::platform::fs as pfs;

/// Object store directory under the target root.
pub const STORE_DIR: &str = "files.db";

const OBJECT_DIR_MODE: u32 = 0o700;

/// Identity of a stored object: the SHA-256 hex digest of the uncompressed
/// content, paired with the uncompressed size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub hash: String,
    pub size: u64,
}

impl ObjectKey {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
        }
    }

    /// Leaf filename: `<hash>.<size>`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.hash, self.size)
    }

    /// Path relative to the store root: `<hh>/<hh>/<hash>.<size>`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.hash[0..2])
            .join(&self.hash[2..4])
            .join(self.file_name())
    }

    /// Reconstruct a key from a store leaf filename. Returns `None` for
    /// names that are not `<64-hex>.<decimal>` (stray temp files and the
    /// like), which GC then treats as sweepable.
    pub fn from_file_name(name: &str) -> Option<ObjectKey> {
        let (hash, size) = name.split_once('.')?;
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return None;
        }
        let size: u64 = size.parse().ok()?;
        Some(ObjectKey::new(hash, size))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.hash, self.size)
    }
}

/// Outcome of a `put`. `stored` means the object is present in the store
/// (true on a dedup hit too); `written` means this call wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub stored: bool,
    pub written: bool,
}

/// Content-addressed object store, version 5: one gzip file per
/// `(hash, size)` pair, fanned out by the first four hex digits.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    pub fn exists(&self, key: &ObjectKey) -> bool {
        self.object_path(key).is_file()
    }

    /// Store `src` under `key`. A no-op when the key already exists. The
    /// caller is trusted to have computed `key.hash` over the uncompressed
    /// content; no re-verification happens here.
    pub fn put(&self, src: &Path, key: &ObjectKey, src_is_compressed: bool) -> Result<PutOutcome> {
        if self.exists(key) {
            debug!(key = %key, "object already stored");
            return Ok(PutOutcome {
                stored: true,
                written: false,
            });
        }

        let dest = self.object_path(key);
        let parent = dest.parent().expect("object path has a parent");
        pfs::recursive_mkdir(parent, OBJECT_DIR_MODE)?;

        // Land under a temp name and rename so a crash mid-write never
        // leaves a plausible-looking object behind.
        let tmp = parent.join(format!("{}.tmp", key.file_name()));
        if src_is_compressed {
            std::fs::copy(src, &tmp)?;
        } else {
            self.compress_into(src, &tmp)?;
        }
        pfs::rename(&tmp, &dest)?;

        Ok(PutOutcome {
            stored: true,
            written: true,
        })
    }

    /// Stream-compress `src` into `tmp`, overlapping source reads with
    /// compression through the bounded chunk pipe.
    fn compress_into(&self, src: &Path, tmp: &Path) -> Result<()> {
        let out = create_object_file(tmp)?;
        let (mut writer, mut reader) = chunk_pipe();

        let (produced, compressed) = std::thread::scope(|s| {
            let producer = s.spawn(move || -> std::io::Result<()> {
                use std::io::Write;
                let mut file = std::fs::File::open(src)?;
                let mut buf = vec![0u8; PIPE_CHUNK_SIZE];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    writer.write_all(&buf[..n])?;
                }
                writer.finish()
            });

            let compressed = compress::compress(&mut reader, out);
            let produced = producer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("pipe producer panicked")));
            (produced, compressed)
        });

        // A failed compressor shows up on the producer side as a broken
        // pipe; report the root cause, not the symptom.
        match (produced, compressed) {
            (Ok(()), Ok(_)) => Ok(()),
            (Err(e), _) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
            (_, Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e.into()),
        }
    }

    /// Write the object's content to `dest`: raw object bytes when the
    /// destination expects compressed data, decompressed content otherwise.
    pub fn restore(&self, key: &ObjectKey, dest: &Path, dest_expects_compressed: bool) -> Result<()> {
        let path = self.object_path(key);
        if dest_expects_compressed {
            match std::fs::copy(&path, dest) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(CaskError::NotFound(key.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        } else {
            let object = open_object(&path, key)?;
            let mut out = std::fs::File::create(dest)?;
            compress::decompress(object, &mut out)?;
            Ok(())
        }
    }

    /// Compare the object's decompressed content against a plain file.
    pub fn compare(&self, key: &ObjectKey, plain: &Path) -> Result<bool> {
        let object = open_object(&self.object_path(key), key)?;
        let plain = std::fs::File::open(plain)?;
        compress::compare_compressed_with_plain(object, plain)
    }

    /// Like [`Store::compare`], but divergence surfaces as the typed
    /// `CompareMismatch` error.
    pub fn verify_compare(&self, key: &ObjectKey, plain: &Path) -> Result<()> {
        if self.compare(key, plain)? {
            Ok(())
        } else {
            Err(CaskError::CompareMismatch(
                plain.to_string_lossy().into_owned(),
            ))
        }
    }

    /// SHA-256 of the object's decompressed content.
    pub fn hash_of(&self, key: &ObjectKey) -> Result<String> {
        let object = open_object(&self.object_path(key), key)?;
        let (digest, _) = hash_reader(GzDecoder::new(object), &HashOptions::default())?;
        Ok(digest)
    }

    /// Check the object against its key: `NotFound` when absent,
    /// `EntryCorrupt` when the content does not hash to the key (including
    /// objects that no longer decode as gzip).
    pub fn verify(&self, key: &ObjectKey) -> Result<()> {
        let actual = match self.hash_of(key) {
            Ok(digest) => digest,
            Err(CaskError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::InvalidData
                        | std::io::ErrorKind::InvalidInput
                        | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(CaskError::EntryCorrupt {
                    key: key.to_string(),
                    actual: "<undecodable>".into(),
                })
            }
            Err(e) => return Err(e),
        };
        if actual == key.hash {
            Ok(())
        } else {
            Err(CaskError::EntryCorrupt {
                key: key.to_string(),
                actual,
            })
        }
    }

    /// Every regular file under the store root, with its parsed key when the
    /// filename is a valid `<hash>.<size>` leaf.
    pub fn scan(&self) -> Result<Vec<(PathBuf, Option<ObjectKey>)>> {
        let mut entries = Vec::new();
        if !self.root.is_dir() {
            return Ok(entries);
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                CaskError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other("walk error in object store")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let key = entry
                .file_name()
                .to_str()
                .and_then(ObjectKey::from_file_name);
            entries.push((entry.into_path(), key));
        }
        Ok(entries)
    }

    /// Remove a leaf file, then prune now-empty parent directories up to but
    /// not including the store root.
    pub fn remove_leaf(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        let mut cursor = path.parent();
        while let Some(dir) = cursor {
            if dir == self.root {
                break;
            }
            if std::fs::read_dir(dir)?.next().is_some() {
                break;
            }
            std::fs::remove_dir(dir)?;
            cursor = dir.parent();
        }
        Ok(())
    }

    pub fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.remove_leaf(&self.object_path(key))
    }
}

fn open_object(path: &Path, key: &ObjectKey) -> Result<std::fs::File> {
    match std::fs::File::open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CaskError::NotFound(key.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn create_object_file(path: &Path) -> Result<std::fs::File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        Ok(std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?)
    }

    #[cfg(not(unix))]
    {
        Ok(std::fs::File::create(path)?)
    }
}
