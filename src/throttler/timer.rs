use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Owned handle for one scheduled callback. Cancelling (or dropping) the
/// token aborts the underlying task.
///
/// Cancellation alone is not airtight: a timer that has already passed its
/// sleep cannot be aborted mid-callback, so strategy state machines pair each
/// token with an epoch counter and the callback re-checks the epoch under the
/// state lock before acting.
pub(crate) struct TimerToken {
    handle: JoinHandle<()>,
}

impl TimerToken {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TimerToken {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run `callback` after `delay` on the ambient tokio runtime.
pub(crate) fn schedule<F>(delay: Duration, callback: F) -> TimerToken
where
    F: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        callback();
    });
    TimerToken { handle }
}

/// Monotonic "now" for strategy timing math. Uses the tokio clock so the
/// paused test clock drives it.
pub(crate) fn now() -> Instant {
    Instant::now()
}
