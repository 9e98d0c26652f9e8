//! Long-running tasks that keep a session in sync with its room.
//!
//! Every task is spawned onto the ambient tokio runtime and owned by a [`TaskGuard`]. Dropping
//! the guard aborts the task, and with it whatever timers and sockets the task holds.

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod chat;
pub mod liveness;
pub mod playback;

pub use chat::{ChatHandle, spawn_chat_task};
pub use liveness::{LivenessFact, spawn_liveness_poller};
pub use playback::spawn_playback_task;

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard stops the task"]
pub struct TaskGuard {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TaskGuard {
    pub(crate) fn spawn<F>(name: &'static str, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: Some(tokio::spawn(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the task. Harmless if it has already stopped.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Stops the task and waits until it is actually gone, so that everything it owned has
    /// been dropped by the time this returns.
    pub async fn shutdown(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!(task = self.name, error = %e, "background task panicked"),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Replaces the value in `tx` unless it is already equal, notifying receivers only on change.
pub(crate) fn set_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) -> bool {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}
