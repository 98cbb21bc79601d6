//! Error types and errno plumbing.
//!
//! Layer operations never panic on runtime conditions: they report failure
//! through sentinel return values (a negative count) and record the OS errno
//! on the layer instance, where it stays queryable until `clearerr`. The
//! public [`Handle`](crate::Handle) API converts those sentinels into
//! `Result`s at the crate boundary. Only structural bugs (refcount
//! underflow, a layer definition whose state size does not match the
//! compiled state) abort the process.

use std::io;

/// Error type for stream operations, surfaced by the public `Handle` API.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A layer name in a specification string is not registered.
    #[error("unknown layer \"{0}\"")]
    UnknownLayer(String),

    /// A `name(arg)` argument list was not closed before end of string.
    #[error("argument list not closed for layer \"{0}\"")]
    UnterminatedArg(String),

    /// A layer specification token did not start with an identifier char.
    #[error("invalid separator character '{0}' in layer specification")]
    BadSeparator(char),

    /// The mode string was not a valid r/w/a [+] [b|t] combination.
    #[error("invalid mode string \"{0}\"")]
    BadMode(String),

    /// No layer in the resolved chain knows how to open the target.
    #[error("no layer in \"{0}\" implements open")]
    NoOpener(String),

    /// The handle has been closed or its top layer cleared.
    #[error("invalid or closed handle")]
    InvalidHandle,

    /// A blocking call was interrupted and the async-check handler
    /// invalidated the handle before the call could be retried.
    #[error("operation aborted by async handler")]
    Aborted,

    /// An OS-level failure, carrying the saved errno.
    #[error("os error: {0}")]
    Os(#[from] io::Error),
}

impl StreamError {
    /// Build the error for a failed operation from the errno saved on the
    /// layer instance (falling back to the thread's current errno).
    pub(crate) fn from_errno(saved: i32) -> StreamError {
        if saved == libc::EINTR {
            return StreamError::Aborted;
        }
        let errno = if saved != 0 { saved } else { last_errno() };
        StreamError::Os(io::Error::from_raw_os_error(errno))
    }
}

/// Read the calling thread's errno.
pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Set the calling thread's errno. Layer ops return a sentinel and leave
/// the reason in errno (e.g. EBADF on an operation against a closed
/// handle).
pub(crate) fn set_errno(errno: i32) {
    // SAFETY: __errno_location returns a valid thread-local pointer.
    unsafe {
        *libc::__errno_location() = errno;
    }
}
