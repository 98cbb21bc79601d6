//! Iostack - Layered Stream I/O Runtime
//!
//! A stack of composable filter layers through which byte-stream I/O
//! passes. Each layer adds one capability and can be pushed onto or
//! popped off a per-handle stack at open time or on demand:
//!
//! - **unix**: raw OS file descriptor access with signal-safe retry
//! - **perlio**: block buffering with a fill/flush state machine
//! - **crlf**: CRLF-to-LF translation on read, LF-to-CRLF on write
//! - **pending**: transient staging for pushed-back (unread) bytes
//! - **raw / bytes / utf8 / pop**: pseudo layers that only adjust the stack
//!
//! Layer chains are described by specification strings such as
//! `"unix perlio crlf"` and resolved against a process-wide registry that
//! can be extended with out-of-core layers. Descriptors shared between
//! duplicated handles (and across `fork`) are reference counted so exactly
//! one close reaches the OS.
//!
//! # Example
//!
//! ```no_run
//! use std::io::SeekFrom;
//! use iostack::Handle;
//!
//! let mut h = Handle::open_with("unix perlio crlf", "notes.txt", "w+")?;
//! h.write(b"a\nb\n")?;
//! h.flush()?;
//! h.seek(SeekFrom::Start(0))?;
//! h.binmode()?; // drop the crlf layer: reads now see raw bytes
//! let mut buf = [0u8; 16];
//! let n = h.read(&mut buf)?;
//! assert_eq!(&buf[..n], b"a\r\nb\r\n");
//! # Ok::<(), iostack::StreamError>(())
//! ```
//!
//! # Concurrency model
//!
//! Operations on one handle are synchronous on the caller's thread. A
//! signal arriving during a blocking OS call runs the process-wide
//! async-check hook ([`hooks::set_async_check`]) re-entrantly; the hook
//! may request that the interrupted handle be torn down, and the retry
//! loop re-validates its own layer's liveness before touching it again.
//! The only cross-thread structure is the fd reference table, which is
//! mutex-guarded and fork-bracketed ([`fdtable::ForkBracket`]).

pub mod error;
pub mod fdtable;
pub mod handle;
pub mod hooks;
pub mod layer;
pub mod registry;

pub use error::StreamError;
pub use handle::Handle;
pub use layer::stack::HandleToken;
pub use layer::DUP_FD;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
