use std::sync::Arc;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation latch shared between a request's owner (UI) and
/// the client executing it.
///
/// The flag is monotonic: once cancelled it never resets. `cancel()` is
/// idempotent and fires every registered callback exactly once, in
/// registration order. A callback registered after cancellation fires
/// immediately and synchronously. No operation panics.
///
/// Async consumers should prefer `cancelled_wait()` in a `select!` arm over
/// registering a callback — dropping the future is its own disarm.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    // None once cancel() has drained it; on_cancel then fires immediately.
    callbacks: Mutex<Option<Vec<Callback>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                callbacks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Set the flag and fire registered callbacks in registration order.
    /// Second and later calls are no-ops.
    pub fn cancel(&self) {
        let drained = {
            let mut guard = match self.inner.callbacks.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Flag is set inside the lock so a racing on_cancel either lands
            // in the drained list or observes cancelled and fires itself.
            self.inner.token.cancel();
            guard.take()
        };
        if let Some(callbacks) = drained {
            for cb in callbacks {
                cb();
            }
        }
    }

    /// Register a callback to run at cancellation. If the token is already
    /// cancelled the callback runs synchronously before this returns.
    pub fn on_cancel(&self, cb: impl FnOnce() + Send + 'static) {
        let immediate = {
            let mut guard = match self.inner.callbacks.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.as_mut() {
                Some(callbacks) => {
                    callbacks.push(Box::new(cb));
                    None
                }
                None => Some(cb),
            }
        };
        if let Some(cb) = immediate {
            cb();
        }
    }

    /// Resolves when the token is cancelled. Resolves immediately if it
    /// already is.
    pub async fn cancelled_wait(&self) {
        self.inner.token.cancelled().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
