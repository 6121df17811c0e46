use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::session::{SessionManager, SessionState};

/// Default interval between expiry checks
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// Background task that re-evaluates the session on a fixed interval.
///
/// The local expiry is advisory; the server still rejects stale tokens with
/// 401 on the next request. Dropping the watcher stops the task.
pub struct ExpiryWatcher {
    handle: JoinHandle<()>,
    state_rx: watch::Receiver<SessionState>,
}

impl ExpiryWatcher {
    /// Start checking. Must be called from within a tokio runtime.
    pub fn spawn(manager: Arc<SessionManager>, interval: Duration) -> Self {
        let initial = manager.check();
        let (tx, state_rx) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the initial state is already published
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let state = manager.check();
                let previous = *tx.borrow();
                if state != previous {
                    info!(?previous, ?state, "Session state changed");
                } else {
                    debug!(?state, "Session check");
                }
                tx.send_replace(state);
            }
        });

        Self { handle, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn current(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn stop(self) {
        // Drop aborts the task
    }
}

impl Drop for ExpiryWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::store::MemoryStore;
    use chrono::{DateTime, Duration as ChronoDuration};

    #[tokio::test]
    async fn test_watcher_reports_expiry() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()));
        let manager = Arc::new(SessionManager::with_clock(store.clone(), clock.clone()));
        manager.set_token("t", "2h");

        let watcher = ExpiryWatcher::spawn(manager.clone(), Duration::from_millis(10));
        assert_eq!(watcher.current(), SessionState::Valid);

        let mut rx = watcher.subscribe();
        clock.advance(ChronoDuration::hours(3));

        let state = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                rx.changed().await.unwrap();
                let state = *rx.borrow_and_update();
                if state == SessionState::Unauthenticated {
                    return state;
                }
            }
        })
        .await
        .expect("watcher did not observe expiry");

        assert_eq!(state, SessionState::Unauthenticated);
        assert!(store.is_empty());
        watcher.stop();
    }
}
