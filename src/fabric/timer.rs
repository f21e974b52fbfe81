//! Typed single-shot timer for deferred fabric eviction.
//!
//! The timer carries the victim's fabric index as a strongly-typed payload.
//! Arming always cancels any prior instance first, so at most one eviction
//! timer is in flight.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::FabricIndex;
use crate::app::AppEvent;

/// Scheduler seam for the capacity guard's deferred eviction.
pub trait EvictionScheduler: Send + Sync {
    /// Arm the timer for `victim`, replacing any pending instance.
    fn arm(&self, victim: FabricIndex, delay: Duration);

    /// Cancel the pending instance, if any.
    fn cancel(&self);
}

/// Production scheduler: a tokio sleep task delivering `EvictionDue` onto
/// the app event queue, cancelable by token.
///
/// Holds a runtime handle so arming works from any thread; the guard runs
/// on the Matter stack thread, outside any tokio context.
pub struct TokioEvictionScheduler {
    events: mpsc::Sender<AppEvent>,
    handle: Handle,
    pending: Mutex<Option<CancellationToken>>,
}

impl TokioEvictionScheduler {
    /// Must be called on the tokio runtime.
    pub fn new(events: mpsc::Sender<AppEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            handle: Handle::current(),
            pending: Mutex::new(None),
        })
    }
}

impl EvictionScheduler for TokioEvictionScheduler {
    fn arm(&self, victim: FabricIndex, delay: Duration) {
        let token = CancellationToken::new();
        if let Some(prior) = self.pending.lock().replace(token.clone()) {
            prior.cancel();
        }

        let events = self.events.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    crate::app::try_push(&events, AppEvent::EvictionDue(victim));
                }
            }
        });
    }

    fn cancel(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn arming_from_a_non_runtime_thread_delivers_the_event() {
        let (events, mut rx) = mpsc::channel(4);
        let scheduler = TokioEvictionScheduler::new(events);

        // The guard arms from the Matter stack thread, which has no
        // ambient tokio runtime.
        let armer = scheduler.clone();
        std::thread::spawn(move || {
            armer.arm(FabricIndex(3), Duration::from_millis(5));
        })
        .join()
        .unwrap();

        assert_eq!(rx.recv().await, Some(AppEvent::EvictionDue(FabricIndex(3))));
    }

    #[tokio::test]
    async fn cancel_suppresses_a_pending_timer() {
        let (events, mut rx) = mpsc::channel(4);
        let scheduler = TokioEvictionScheduler::new(events);

        scheduler.arm(FabricIndex(1), Duration::from_millis(20));
        scheduler.cancel();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }
}
