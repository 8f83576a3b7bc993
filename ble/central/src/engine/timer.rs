//! One-shot cancellable timeout.

use log::trace;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A deferred action that runs once after `duration` unless cancelled first.
///
/// Dropping the timer cancels it. Cancelling after the action started running is a
/// no-op; callers guard the action itself against stale firings.
#[derive(Debug)]
pub(crate) struct TimeoutTimer {
    handle: JoinHandle<()>,
}

impl TimeoutTimer {
    pub(crate) fn arm<F>(runtime: &Handle, duration: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("arming timeout timer for {:?}", duration);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            on_fire();
        });
        Self { handle }
    }

    pub(crate) fn cancel(self) {
        drop(self);
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
