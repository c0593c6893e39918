// src/core/errors.rs

//! Defines the primary error type for the entire agent.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Stable error kinds used by callers that only need to branch on the
/// category of a failure rather than its full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PathResolution,
    DiskSpace,
    DenylistFile,
    IsDirectory,
    UnknownArchive,
    NotExist,
    AlreadyExists,
    Suspended,
    IsRunning,
    PowerActionInProgress,
    Installing,
    Transferring,
    InternalResolution,
    InvalidIpAddress,
    DownloadFailed,
    Token,
    Other,
}

/// The main error enum, representing all possible failures within the agent.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum HelmsmanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("server is suspended")]
    Suspended,

    #[error("server is already running")]
    IsRunning,

    #[error("server is offline")]
    IsOffline,

    #[error("another power action is currently being processed for this server, please try again later")]
    PowerActionInProgress,

    #[error("server is currently being installed")]
    Installing,

    #[error("server is currently being transferred")]
    Transferring,

    #[error("no server found with uuid {0}")]
    ServerNotFound(Uuid),

    /// A supplied path escaped the server's data root after resolution.
    #[error("the requested resource was not found on the system")]
    PathResolution { path: PathBuf },

    #[error("not enough disk space is available to perform this operation")]
    DiskSpace,

    #[error("this file cannot be modified: present in the file denylist")]
    DenylistFile { path: String },

    #[error("cannot perform that action: file is a directory")]
    IsDirectory,

    #[error("unknown or unsupported archive format")]
    UnknownArchive,

    #[error("the requested resource does not exist")]
    NotExist,

    #[error("destination already exists")]
    AlreadyExists,

    /// The host of a remote download did not resolve to any address.
    #[error("failed to resolve host for download")]
    InternalResolution,

    /// The host of a remote download resolved to a non-public address.
    #[error("download destination resolves to an unsafe ip address")]
    InvalidIpAddress,

    #[error("failed to download file: {0}")]
    DownloadFailed(String),

    #[error("too many concurrent downloads for this server")]
    DownloadLimit,

    #[error("jwt: {0}")]
    Token(#[from] TokenError),

    #[error("remote api error: {0}")]
    Remote(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures produced while validating a signed websocket or download token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token was issued before the agent booted")]
    IssuedBeforeBoot,

    #[error("token has been revoked")]
    Denylisted,

    #[error("token has already been used")]
    NonceSeen,

    #[error("token is missing required field: {0}")]
    MissingField(&'static str),

    #[error("token is malformed")]
    Malformed,
}

impl HelmsmanError {
    /// Returns the stable kind for this error, used by the HTTP error
    /// mapping and by callers that branch on categories.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HelmsmanError::PathResolution { .. } => ErrorKind::PathResolution,
            HelmsmanError::DiskSpace => ErrorKind::DiskSpace,
            HelmsmanError::DenylistFile { .. } => ErrorKind::DenylistFile,
            HelmsmanError::IsDirectory => ErrorKind::IsDirectory,
            HelmsmanError::UnknownArchive => ErrorKind::UnknownArchive,
            HelmsmanError::NotExist => ErrorKind::NotExist,
            HelmsmanError::AlreadyExists => ErrorKind::AlreadyExists,
            HelmsmanError::Suspended => ErrorKind::Suspended,
            HelmsmanError::IsRunning | HelmsmanError::IsOffline => ErrorKind::IsRunning,
            HelmsmanError::PowerActionInProgress => ErrorKind::PowerActionInProgress,
            HelmsmanError::Installing => ErrorKind::Installing,
            HelmsmanError::Transferring => ErrorKind::Transferring,
            HelmsmanError::InternalResolution => ErrorKind::InternalResolution,
            HelmsmanError::InvalidIpAddress => ErrorKind::InvalidIpAddress,
            HelmsmanError::DownloadFailed(_) | HelmsmanError::DownloadLimit => {
                ErrorKind::DownloadFailed
            }
            HelmsmanError::Token(_) => ErrorKind::Token,
            HelmsmanError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotExist
            }
            _ => ErrorKind::Other,
        }
    }

    /// True when this error represents an expected user condition whose
    /// message may be shown to clients verbatim.
    pub fn is_user_error(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Other)
    }
}

/// Checks whether `err` carries the given stable kind.
pub fn is_error_code(err: &HelmsmanError, kind: ErrorKind) -> bool {
    err.kind() == kind
}

/// Tags an unexpected error with a fresh UUID and logs it once, with full
/// detail, at the point of first identification. The returned UUID is the
/// only piece shown to clients.
pub fn track_unexpected(err: &anyhow::Error) -> Uuid {
    let id = Uuid::new_v4();
    tracing::error!(error_id = %id, error = ?err, "unexpected error encountered");
    id
}

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, HelmsmanError>;
