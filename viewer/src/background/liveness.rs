use crate::background::TaskGuard;
use crate::error::TransportError;
use crate::live_api::{StatusSource, StreamStatus};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Whether the room is live, and under what title.
///
/// This is the only thing the chat channel and the playback controller learn about each
/// other's world. `None` in the watch channel means no poll has succeeded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessFact {
    pub is_live: bool,
    pub title: String,
}

impl From<&StreamStatus> for LivenessFact {
    fn from(status: &StreamStatus) -> Self {
        Self {
            is_live: status.is_live,
            title: status.title.clone(),
        }
    }
}

/// Publishes the fact derived from `status`, unless it equals the current one.
///
/// Returns whether subscribers were notified.
pub fn publish(tx: &watch::Sender<Option<LivenessFact>>, status: &StreamStatus) -> bool {
    let fact = LivenessFact::from(status);
    tx.send_if_modified(|current| {
        if current.as_ref() == Some(&fact) {
            return false;
        }
        tracing::info!(
            is_live = fact.is_live,
            title = %fact.title,
            viewers = status.viewers,
            "room liveness changed"
        );
        *current = Some(fact);
        true
    })
}

/// Spawn the liveness poller.
///
/// Polls once right away, then every `interval`. A failed poll is logged and leaves the
/// published fact alone; the next tick simply tries again. A poll that has not answered by
/// the next tick counts as failed, so one hung request never holds up the ones after it.
pub fn spawn_liveness_poller<S: StatusSource>(
    source: S,
    interval: Duration,
    tx: watch::Sender<Option<LivenessFact>>,
) -> TaskGuard {
    TaskGuard::spawn("liveness", async move {
        let mut ticks = tokio::time::interval(interval);
        // a slow origin should not cause a burst of catch-up polls
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            let poll = tokio::time::timeout(interval, source.fetch_status())
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Timeout {
                        target: String::from("room status endpoint"),
                        after: interval,
                    })
                });
            match poll {
                Ok(status) => {
                    if !publish(&tx, &status) {
                        tracing::trace!(is_live = status.is_live, "liveness unchanged");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll room status - keeping last known state");
                }
            }
        }
    })
}
