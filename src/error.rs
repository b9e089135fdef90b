//! Error taxonomy surfaced by the store.
//!
//! Internal storage-engine failures are wrapped with `snafu`'s `context()`,
//! wrapping `redb` error variants with
//! captured call-site locations.

use snafu::{Location, Snafu};

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Low-level storage engine errors: the KV Engine Facade's error surface.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DbError {
    #[snafu(transparent)]
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Transaction {
        source: redb::TransactionError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    Decode {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    /// Caller-supplied cursor could not be decoded.
    #[snafu(display("invalid pagination cursor"))]
    InvalidCursor {
        #[snafu(implicit)]
        location: Location,
    },
}

/// Public-facing error kinds. Each variant carries the
/// human-readable message and, where relevant, the underlying cause.
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("{entity} not found: {id}"))]
    NotFound { entity: &'static str, id: String },

    #[snafu(display("{entity} already exists: {detail}"))]
    AlreadyExists { entity: &'static str, detail: String },

    #[snafu(display("share already exists for this collection and user"))]
    ShareAlreadyExists,

    #[snafu(display("invalid input: {message}"))]
    InvalidInput { message: String },

    #[snafu(display("permission denied: {message}"))]
    PermissionDenied { message: String },

    #[snafu(display("conflict: {message}"))]
    Conflict { message: String },

    #[snafu(display("{entity} expired: {id}"))]
    Expired { entity: &'static str, id: String },

    #[snafu(display("operation canceled"))]
    Canceled,

    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn already_exists(entity: &'static str, detail: impl Into<String>) -> Self {
        StoreError::AlreadyExists {
            entity,
            detail: detail.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        StoreError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        StoreError::PermissionDenied {
            message: message.into(),
        }
    }

    /// `true` for errors that map to the `NotFound`/`Expired` HTTP-boundary
    /// bucket.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. } | StoreError::Expired { .. })
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            // Surfaced distinctly so callers (and the write-retry loop) can
            // tell a transient commit conflict apart from a hard failure.
            DbError::Commit { .. } => StoreError::Conflict {
                message: e.to_string(),
            },
            other => StoreError::Internal {
                message: other.to_string(),
            },
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Cooperative cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn check(&self) -> StoreResult<()> {
        if self.is_canceled() {
            Err(StoreError::Canceled)
        } else {
            Ok(())
        }
    }
}
