use std::fmt;

/// Named error kinds shared across the workspace (spec §7). A single flat
/// enum rather than one type per crate: the spec treats these as named
/// kinds, not a typed hierarchy, and propagating one shared type through
/// `From` conversions at crate boundaries matches the reference's existing
/// `StoreError` → `EngineError` → `DbError` chaining without adding another
/// layer of wrapping for each new crate this workspace introduces.
#[derive(Debug)]
pub enum Error {
    NotFound(String),
    DuplicateId(String),
    DuplicateKey(String),
    InvalidArgument(String),
    InvalidProjection(String),
    AggregationStageException { stage: usize, message: String },
    CursorNotFound(String),
    CursorExpired(String),
    InvalidToken,
    TokenExpired,
    InsufficientPermission(String),
    StorageIoError(String),
    AlreadyDisposed,
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(id) => write!(f, "not found: {id}"),
            Error::DuplicateId(id) => write!(f, "duplicate id: {id}"),
            Error::DuplicateKey(key) => write!(f, "duplicate key: {key}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::InvalidProjection(msg) => write!(f, "invalid projection: {msg}"),
            Error::AggregationStageException { stage, message } => {
                write!(f, "aggregation stage {stage} failed: {message}")
            }
            Error::CursorNotFound(id) => write!(f, "cursor not found: {id}"),
            Error::CursorExpired(id) => write!(f, "cursor expired: {id}"),
            Error::InvalidToken => write!(f, "invalid token"),
            Error::TokenExpired => write!(f, "token expired"),
            Error::InsufficientPermission(perm) => write!(f, "insufficient permission: {perm}"),
            Error::StorageIoError(msg) => write!(f, "storage I/O error: {msg}"),
            Error::AlreadyDisposed => write!(f, "component already disposed"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StorageIoError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::StorageIoError(e.to_string())
    }
}
