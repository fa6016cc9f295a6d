use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaskError>;

#[derive(Debug, Error)]
pub enum CaskError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("object corrupt: '{key}' decompresses to hash {actual}")]
    EntryCorrupt { key: String, actual: String },

    #[error("target location does not exist: '{0}'")]
    LocationUnset(String),

    #[error("unknown filesystem type '{0}' in target config")]
    UnknownFilesystem(String),

    #[error("an unfinished run is present: {0}")]
    RunningRunConflict(String),

    #[error("compare mismatch: '{0}' differs from the stored object")]
    CompareMismatch(String),

    #[error("path component is a file, expected a directory: '{0}'")]
    PartialPathIsFile(String),

    #[error("hard links unsupported on this filesystem: {0}")]
    LinkUnsupported(String),

    #[error("manifest parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
