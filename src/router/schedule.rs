//! One-shot scheduled task with an explicit cancel handle.
//!
//! Used for the persisted-atom debounce: the task sleeps, then runs a
//! closure (which posts an event back to the router). While one is pending,
//! further `schedule` calls coalesce into it.

use std::time::Duration;

use tokio::task::JoinHandle;

/// At most one pending delayed action.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// No pending action.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay` unless something is already pending.
    ///
    /// Returns false when coalesced into the pending action.
    pub fn schedule<F>(&mut self, delay: Duration, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_pending() {
            return false;
        }
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        }));
        true
    }

    /// True while the action has not run or been cancelled.
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Mark the action as delivered so the next `schedule` starts fresh.
    pub fn complete(&mut self) {
        self.handle = None;
    }

    /// Abort the pending action. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
