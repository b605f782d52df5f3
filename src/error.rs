//! The domain error taxonomy surfaced to callers.
//!
//! Mirrors the teacher's habit of a single narrow error surface
//! (`utils::error`) rather than ad-hoc strings, generalized to a typed,
//! `std::error::Error`-implementing type fit for a library instead of a
//! CLI's `eprintln!`-and-`exit` pattern.

use std::fmt;
use std::io;

/// The closed set of error codes a caller may match on.
///
/// Formatter- and unpacker-specific failures get their own variants on
/// [`Error`] directly rather than folding into `InternalError`, since callers
/// (in particular `ArchiveUnpacker` and its tests) need to distinguish them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Exists,
    InvalidArgument,
    InvalidState,
    Unsupported,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not-found",
            Self::Exists => "exists",
            Self::InvalidArgument => "invalid-argument",
            Self::InvalidState => "invalid-state",
            Self::Unsupported => "unsupported",
            Self::InternalError => "internal-error",
        };
        f.write_str(s)
    }
}

/// The crate's single error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{code}: {message}")]
    Generic { code: ErrorCode, message: String },

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("path not found: {0}")]
    NotDirectory(String),
    #[error("not a file: {0}")]
    NotFile(String),
    #[error("file exceeds the 128 GiB formatter limit: {0}")]
    FileTooBig(String),
    #[error("hardlink graph contains a cycle reaching: {0}")]
    CircularLinks(String),
    #[error("directory {0} already has the maximum number of links (65000)")]
    MaximumLinksExceeded(String),
    #[error("not enough space to reserve {0} group descriptor blocks")]
    InsufficientSpaceForGroupDescriptorBlocks(u64),
    #[error("could not fit extended attributes for {0} in the inline area or an xattr block")]
    InsufficientSpace(String),
    #[error("cannot truncate image file {0}: {1}")]
    CannotTruncateFile(String, #[source] io::Error),
    #[error("cannot create sparse image file {0}: {1}")]
    CannotCreateSparseFile(String, #[source] io::Error),
    #[error("cannot resize image file to {0} bytes: {1}")]
    CannotResizeFS(u64, #[source] io::Error),
    #[error("directory block for {0} has no space left for a trailing dentry")]
    NoSpaceForTrailingDEntry(String),
    #[error("unsupported tar entry type for {0}")]
    UnsupportedFiletype(String),
    #[error("invalid path component: {0}")]
    InvalidName(String),
}

impl Error {
    /// Builds a [`Error::Generic`] with an explicit code, for callers
    /// mapping a closed set of remote/wire codes (e.g. the agent's RPC
    /// error codes) back onto the local taxonomy.
    pub fn generic(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Generic {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Generic {
            code: ErrorCode::NotFound,
            message: message.into(),
        }
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::Generic {
            code: ErrorCode::Exists,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::Generic {
            code: ErrorCode::InvalidArgument,
            message: message.into(),
        }
    }

    /// Builds the precise "must be in state X" error used by
    /// `ContainerStateMachine` transition guards.
    pub fn invalid_state(operation: &str, required: &str, actual: &str) -> Self {
        Self::Generic {
            code: ErrorCode::InvalidState,
            message: format!(
                "cannot perform `{operation}`: container must be in state `{required}`, is `{actual}`"
            ),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Generic {
            code: ErrorCode::Unsupported,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Generic {
            code: ErrorCode::InternalError,
            message: message.into(),
        }
    }

    /// The closed-set code this error maps to, for callers that only want to
    /// branch on the taxonomy rather than match every variant.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Generic { code, .. } => *code,
            Self::Io(_) => ErrorCode::InternalError,
            Self::NotDirectory(_) | Self::NotFile(_) => ErrorCode::InvalidArgument,
            Self::FileTooBig(_) => ErrorCode::InvalidArgument,
            Self::CircularLinks(_) => ErrorCode::InvalidArgument,
            Self::MaximumLinksExceeded(_) => ErrorCode::InvalidArgument,
            Self::InsufficientSpaceForGroupDescriptorBlocks(_) => ErrorCode::InternalError,
            Self::InsufficientSpace(_) => ErrorCode::InvalidArgument,
            Self::CannotTruncateFile(..)
            | Self::CannotCreateSparseFile(..)
            | Self::CannotResizeFS(..) => ErrorCode::InternalError,
            Self::NoSpaceForTrailingDEntry(_) => ErrorCode::InternalError,
            Self::UnsupportedFiletype(_) => ErrorCode::Unsupported,
            Self::InvalidName(_) => ErrorCode::InvalidArgument,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
