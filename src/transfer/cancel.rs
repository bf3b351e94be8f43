//! A handle which stops a running transfer.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Inner {
    called: AtomicBool,
    abort: AtomicBool,
    token: CancellationToken,
}

/// Cancels a transfer from another task. Clones share the same state, so the hook can be
/// handed to a signal handler or timer while the transfer runs.
#[derive(Debug, Clone, Default)]
pub struct CancelHook {
    inner: Arc<Inner>,
}

impl CancelHook {
    /// Create a hook that has not been called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the transfer. With `abort` set the multipart session is aborted and the
    /// checkpoint and temporary files are removed, otherwise they are kept so that the
    /// transfer can be resumed. Only the first call has an effect, and this returns whether
    /// it was that call.
    pub fn cancel(&self, abort: bool) -> bool {
        if self
            .inner
            .called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.inner.abort.store(abort, Ordering::SeqCst);
        self.inner.token.cancel();
        true
    }

    /// Whether the hook was called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether the hook was called with `abort`.
    pub fn is_abort(&self) -> bool {
        self.inner.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}
