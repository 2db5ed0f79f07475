use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Classification of a non-2xx response from the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFailure {
    NotFound,
    Forbidden,
    InternalServerError,
    Timeout,
    Other,
}

impl RequestFailure {
    /// Returns `None` for success statuses.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            403 => Some(RequestFailure::Forbidden),
            404 => Some(RequestFailure::NotFound),
            500 => Some(RequestFailure::InternalServerError),
            408 | 504 => Some(RequestFailure::Timeout),
            _ => Some(RequestFailure::Other),
        }
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestFailure::NotFound => write!(f, "not found"),
            RequestFailure::Forbidden => write!(f, "forbidden"),
            RequestFailure::InternalServerError => write!(f, "internal server error"),
            RequestFailure::Timeout => write!(f, "timeout"),
            RequestFailure::Other => write!(f, "request error"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("{kind} (status {status}): {body}")]
    Request {
        kind: RequestFailure,
        status: u16,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("{kind} {name} has not been fetched; fetch or create it before saving")]
    NotFetched { kind: &'static str, name: String },

    #[error("{kind} {name} has been deleted")]
    Deleted { kind: &'static str, name: String },

    #[error("loading would overwrite field \"{field}\": current {current}, new {new}")]
    OverwriteConflict {
        field: String,
        current: String,
        new: String,
    },

    #[error("server blob is missing required field \"{field}\"")]
    MissingField { field: String },

    #[error("{kind} {name} has no server identifier yet")]
    MissingIdentifier { kind: &'static str, name: String },

    #[error("JSON serialization modifies the value: {0}")]
    JsonRoundTrip(String),

    #[error("part {part} failed after {attempts} attempts: {message}")]
    PartUpload {
        part: u32,
        attempts: u32,
        message: String,
    },

    #[error("upload is incomplete: {0}")]
    IncompleteUpload(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("FTP transfer failed: {0}")]
    Ftp(String),

    #[error("cannot transfer a file for an inline blob result")]
    UnsupportedStorage,

    #[error("invalid stored data pointer: {0}")]
    InvalidStoragePointer(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("profile not found in config: {0}")]
    UnknownProfile(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl KiraError {
    pub fn from_status(status: u16, body: String) -> Option<Self> {
        RequestFailure::from_status(status).map(|kind| KiraError::Request { kind, status, body })
    }

    pub fn request_failure(&self) -> Option<RequestFailure> {
        match self {
            KiraError::Request { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.request_failure() == Some(RequestFailure::NotFound)
    }

    pub(crate) fn filesystem(err: impl fmt::Display) -> Self {
        KiraError::Filesystem(err.to_string())
    }
}
