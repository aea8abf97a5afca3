use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EdenError>;

/// Errors surfaced by the mount, the overlay, and the fsck tool.
///
/// Variants carry rendered context instead of source errors so the type stays
/// `Clone`: a single in-flight inode load hands its result to every caller that
/// joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EdenError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Overlay catalog corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("Overlay catalog error: {0}")]
    Catalog(String),

    #[error("Overlay catalog is closed")]
    CatalogClosed,

    #[error("Overlay directory is in use by another process: {0}")]
    OverlayLocked(PathBuf),

    #[error("Mount is shutting down")]
    MountShuttingDown,

    #[error("Journal truncated: cursor {cursor} is older than retained sequence {oldest}")]
    JournalTruncated { cursor: u64, oldest: u64 },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl EdenError {
    /// Error code reported to the kernel by the request dispatcher.
    pub fn errno(&self) -> i32 {
        match self {
            EdenError::NotFound(_) => libc::ENOENT,
            EdenError::NotADirectory(_) => libc::ENOTDIR,
            EdenError::IsADirectory(_) => libc::EISDIR,
            EdenError::AlreadyExists(_) => libc::EEXIST,
            EdenError::NotEmpty(_) => libc::ENOTEMPTY,
            EdenError::InvalidPath(_) | EdenError::InvalidArgument(_) => libc::EINVAL,
            EdenError::StoreUnavailable(_) => libc::EAGAIN,
            EdenError::MountShuttingDown => libc::ENODEV,
            EdenError::OverlayLocked(_) => libc::EBUSY,
            EdenError::CatalogCorrupt(_)
            | EdenError::Catalog(_)
            | EdenError::CatalogClosed
            | EdenError::JournalTruncated { .. }
            | EdenError::Config(_)
            | EdenError::Io(_)
            | EdenError::Json(_) => libc::EIO,
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EdenError::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for EdenError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => {
                EdenError::CatalogCorrupt(err.to_string())
            }
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) =>
            {
                EdenError::CatalogCorrupt(err.to_string())
            }
            _ => EdenError::Catalog(err.to_string()),
        }
    }
}

impl From<std::io::Error> for EdenError {
    fn from(err: std::io::Error) -> Self {
        EdenError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EdenError {
    fn from(err: serde_json::Error) -> Self {
        EdenError::Json(err.to_string())
    }
}

impl From<toml::de::Error> for EdenError {
    fn from(err: toml::de::Error) -> Self {
        EdenError::Config(format!("Failed to parse config: {}", err))
    }
}
