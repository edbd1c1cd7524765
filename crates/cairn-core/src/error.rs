//! Error types for cairn-core

use thiserror::Error;

use crate::models::{Id, Revision};

/// Result type alias using cairn-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cairn-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound operation attempted while connectivity is down
    #[error("Network offline")]
    Offline,

    /// Outbound operation attempted without a session
    #[error("Not authorized")]
    NotAuthorized,

    /// Primary store answered with a non-2xx status
    #[error("Server responded with HTTP {status}")]
    Http { status: u16 },

    /// HTTP client failure (connection refused, reset, ...)
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Malformed multipart body
    #[error("Multipart error: {0}")]
    Multipart(String),

    /// A multipart part exceeded its size limit
    #[error("Multipart part exceeds {limit} bytes")]
    PartTooLarge { limit: usize },

    /// A changeset was built against a revision the primary never issued
    #[error("Got request for the future rev {requested}, current rev is {current}")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },

    /// Some other party broke the replication contract
    #[error("Protocol invariant violated: {0}")]
    Invariant(String),

    /// New attachment declared without its blob
    #[error("File is missing for the new attachment {0}")]
    MissingBlob(Id),

    /// Blob supplied for an attachment that already exists
    #[error("Can't update file for the attachment {0}")]
    AttachmentImmutable(Id),

    /// Blob supplied for an attachment the changeset doesn't declare
    #[error("Unexpected file for the attachment {0}")]
    UnexpectedBlob(Id),

    /// Value delivered to an observer that already completed
    #[error("Observer is already complete")]
    StreamClosed,

    /// Conflict resolution attempted twice
    #[error("Conflict for document {0} is already resolved")]
    AlreadyResolved(Id),

    /// Replica mutation attempted while merge conflicts are unresolved
    #[error("There is a pending merge conflict")]
    MergePending,

    /// Lock table file watcher error
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    /// Recoverable transport failures: the sync round is simply retried later.
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Offline | Self::NotAuthorized | Self::Http { .. } | Self::Request(_)
        )
    }

    /// Contract violations that must never be absorbed silently.
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::FutureRevision { .. }
                | Self::Invariant(_)
                | Self::MissingBlob(_)
                | Self::AttachmentImmutable(_)
                | Self::UnexpectedBlob(_)
        )
    }
}
