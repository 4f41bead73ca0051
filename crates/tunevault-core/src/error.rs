//! Error types for Tunevault core operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tunevault core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Playlist not found.
    #[error("Playlist not found: {0}")]
    PlaylistNotFound(String),

    /// Playlist already exists.
    #[error("Playlist already exists: {0}")]
    PlaylistAlreadyExists(String),

    /// Invalid playlist name.
    #[error("Invalid playlist name '{name}': {reason}")]
    InvalidPlaylistName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Playlist file exists but could not be parsed.
    ///
    /// Never auto-repaired; the caller decides whether to treat the
    /// playlist as empty or surface the problem to the user.
    #[error("Playlist '{name}' is corrupt: {reason}")]
    PlaylistCorrupt {
        /// The playlist name.
        name: String,
        /// Parse failure detail.
        reason: String,
    },

    /// Entry with the given locator was not found in the playlist.
    #[error("Entry not found in playlist '{playlist}': {locator}")]
    EntryNotFound {
        /// The playlist searched.
        playlist: String,
        /// The locator looked up.
        locator: String,
    },

    /// A job submission was rejected.
    #[error("Invalid job submission: {0}")]
    InvalidSubmission(String),

    /// File system operation failed.
    #[error("File system error at {path}: {message}")]
    FileSystem {
        /// Path where the error occurred.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a file system error from a path and an IO error.
    pub(crate) fn fs(path: impl Into<PathBuf>, e: &std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            message: e.to_string(),
        }
    }
}

/// Result type for media source operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Failure classification for media source operations.
///
/// The worker maps these onto job outcomes: `Transient` is retried with
/// backoff, `AuthRequired` is surfaced and never auto-retried,
/// `Permanent` fails the job immediately, `Cancelled` is a distinct
/// terminal state that does not count as a failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Retryable failure: rate limit, timeout, transient network error.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The resource is gone, forbidden, or otherwise unfetchable.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The remote side demands (re)authentication.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The operation observed its cancellation token and aborted.
    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether this failure classification is eligible for retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
