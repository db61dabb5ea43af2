//! Core error kinds and platform error-code passthrough.
//!
//! Platform I/O failures are never translated into a private taxonomy: the
//! kernel's symbolic errno name (`ENOENT`, `ECONNRESET`, …) rides along in
//! [`CoreError::Platform`] and ends up verbatim in the `err.code` field of
//! the result envelope.

use std::io;

use thiserror::Error;

/// Errors produced by the runtime core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Descriptor id missing or already closed.
    #[error("no file descriptor found with that id")]
    NotOpen(u64),

    /// Socket id missing.
    #[error("not connected")]
    NotConnected(u64),

    /// Kernel-level failure; `code` is the platform's symbolic constant.
    #[error("{message}")]
    Platform {
        code: &'static str,
        message: String,
    },

    /// Malformed URI, unknown handler, or invalid query value.
    #[error("parse error: {0}")]
    Parse(String),

    /// Platform-specific feature on a platform that lacks it.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Operation aborted by caller or timer.
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation. Logged; no recovery attempted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wraps a platform I/O error, resolving the symbolic errno name.
    pub fn platform(err: &io::Error) -> Self {
        CoreError::Platform {
            code: errno_name(err.raw_os_error().unwrap_or(0)),
            message: err.to_string(),
        }
    }

    /// The symbolic code for this error, as it appears in result envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotOpen(_) => "ENOTOPEN",
            CoreError::NotConnected(_) => "ENOTCONNECTED",
            CoreError::Platform { code, .. } => code,
            CoreError::Parse(_) => "EPARSE",
            CoreError::NotSupported(_) => "ENOTSUP",
            CoreError::Cancelled => "ECANCELED",
            CoreError::Internal(_) => "EINTERNAL",
        }
    }
}

/// Resolves a raw errno value to its symbolic name.
///
/// Only the errnos the core actually surfaces are named; anything else
/// collapses to `"EUNKNOWN"` with the numeric value preserved in the
/// accompanying message text.
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::ESRCH => "ESRCH",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::ENXIO => "ENXIO",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::EBUSY => "EBUSY",
        libc::EEXIST => "EEXIST",
        libc::EXDEV => "EXDEV",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::EFBIG => "EFBIG",
        libc::ENOSPC => "ENOSPC",
        libc::EROFS => "EROFS",
        libc::EPIPE => "EPIPE",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::ELOOP => "ELOOP",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNRESET => "ECONNRESET",
        libc::ENOBUFS => "ENOBUFS",
        libc::EISCONN => "EISCONN",
        libc::ENOTCONN => "ENOTCONN",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::EALREADY => "EALREADY",
        libc::EINPROGRESS => "EINPROGRESS",
        libc::ECANCELED => "ECANCELED",
        libc::ENOTSUP => "ENOTSUP",
        _ => "EUNKNOWN",
    }
}
