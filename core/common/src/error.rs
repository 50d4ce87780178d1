//! Common error types for usersync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::SyncResource;

/// Top-level error type for usersync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Persisted storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request to the remote store failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A synchronization pass reported a classified failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl Error {
    /// Convert into the clonable form reported on event streams.
    ///
    /// Errors that carry no sync classification map to [`SyncErrorCode::Unknown`].
    pub fn to_sync_error(&self) -> SyncError {
        match self {
            Error::Sync(err) => err.clone(),
            other => SyncError::new(SyncErrorCode::Unknown, other.to_string()),
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncErrorCode {
    /// The remote session no longer matches the locally recorded one.
    SessionExpired,
    /// Sync was turned off in the cloud or from another machine.
    TurnedOff,
    /// The remote store rejected the request because of rate limiting.
    TooManyRequests,
    /// The client throttled itself before contacting the remote store.
    LocalTooManyRequests,
    /// The remote store requires a newer client.
    UpgradeRequired,
    /// The remote store endpoint is gone.
    Gone,
    /// Local content has a newer format than the remote store understands.
    IncompatibleLocalContent,
    /// Remote content has a newer format than this client understands.
    IncompatibleRemoteContent,
    /// Credentials were rejected.
    Unauthorized,
    /// Access to the remote store is forbidden.
    Forbidden,
    /// Unclassified failure.
    Unknown,
}

impl SyncErrorCode {
    /// All codes, in declaration order.
    pub const ALL: [SyncErrorCode; 11] = [
        SyncErrorCode::SessionExpired,
        SyncErrorCode::TurnedOff,
        SyncErrorCode::TooManyRequests,
        SyncErrorCode::LocalTooManyRequests,
        SyncErrorCode::UpgradeRequired,
        SyncErrorCode::Gone,
        SyncErrorCode::IncompatibleLocalContent,
        SyncErrorCode::IncompatibleRemoteContent,
        SyncErrorCode::Unauthorized,
        SyncErrorCode::Forbidden,
        SyncErrorCode::Unknown,
    ];

    /// Stable kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::SessionExpired => "session-expired",
            SyncErrorCode::TurnedOff => "turned-off",
            SyncErrorCode::TooManyRequests => "too-many-requests",
            SyncErrorCode::LocalTooManyRequests => "local-too-many-requests",
            SyncErrorCode::UpgradeRequired => "upgrade-required",
            SyncErrorCode::Gone => "gone",
            SyncErrorCode::IncompatibleLocalContent => "incompatible-local-content",
            SyncErrorCode::IncompatibleRemoteContent => "incompatible-remote-content",
            SyncErrorCode::Unauthorized => "unauthorized",
            SyncErrorCode::Forbidden => "forbidden",
            SyncErrorCode::Unknown => "unknown",
        }
    }

    /// Whether the error is a rate-limit rejection, local or remote.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            SyncErrorCode::TooManyRequests | SyncErrorCode::LocalTooManyRequests
        )
    }
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncErrorCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown sync error code: {}", s)))
    }
}

/// A classified synchronization failure.
///
/// Cheap to clone so it can be fanned out to every observer of the
/// coordinator's error stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct SyncError {
    /// Failure classification.
    pub code: SyncErrorCode,
    /// Human readable description.
    pub message: String,
    /// Resource the failure relates to, if any.
    pub resource: Option<SyncResource>,
}

impl SyncError {
    /// Create a new error without a resource.
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            resource: None,
        }
    }

    /// Attach the resource the failure relates to.
    pub fn with_resource(mut self, resource: SyncResource) -> Self {
        self.resource = Some(resource);
        self
    }
}
