//! Owned background interval tasks.
//!
//! A [`ScheduledTask`] runs a tick function on a fixed period against state it only holds
//! weakly. It stops when [`stop`](ScheduledTask::stop) is called, when the handle is dropped,
//! or when the owning state is dropped, so it can never keep its owner alive.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a periodic background task. Aborts the task on drop.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `tick(&owner)` every `period`, starting one period from now.
    ///
    /// Returns `None` when called outside a tokio runtime; callers must not depend on the
    /// task for correctness.
    pub fn every<T, F>(name: &'static str, period: Duration, owner: &Arc<T>, tick: F) -> Option<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::debug!(task = name, "no tokio runtime; background task not started");
                return None;
            }
        };
        let weak: Weak<T> = Arc::downgrade(owner);
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(owner) => tick(&owner),
                    None => break,
                }
            }
            tracing::trace!(task = name, "owner dropped; background task exiting");
        });
        Some(Self { name, handle: Some(handle) })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Abort the task. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(task = self.name, "background task stopped");
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}
