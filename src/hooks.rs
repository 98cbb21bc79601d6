//! Process-wide async-check hook.
//!
//! The embedding runtime installs one callback here; the core invokes it
//! after every `EINTR` from a blocking OS call, on the same thread,
//! re-entrantly. The callback receives a [`HandleToken`] for the handle
//! that was blocked and may use it to request that the handle be torn down
//! (the moral equivalent of a signal handler closing the filehandle it
//! interrupted). It gets no direct reference into the stack: any structural
//! change it asks for is applied by the interrupted operation itself once
//! the callback returns, after re-validating liveness.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::layer::stack::HandleToken;

type AsyncCheck = Arc<dyn Fn(&HandleToken) + Send + Sync>;

static ASYNC_CHECK: Lazy<RwLock<Option<AsyncCheck>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide async-check callback, replacing any previous
/// one. Returns whether a callback was already installed.
pub fn set_async_check<F>(hook: F) -> bool
where
    F: Fn(&HandleToken) + Send + Sync + 'static,
{
    ASYNC_CHECK.write().replace(Arc::new(hook)).is_some()
}

/// Remove the installed callback.
pub fn clear_async_check() {
    ASYNC_CHECK.write().take();
}

/// Run the installed callback, if any, for the handle identified by `token`.
///
/// The lock is released before the callback runs so a re-entrant
/// `set_async_check` cannot deadlock.
pub(crate) fn run_async_check(token: &HandleToken) {
    let hook = ASYNC_CHECK.read().clone();
    if let Some(hook) = hook {
        hook(token);
    }
}
