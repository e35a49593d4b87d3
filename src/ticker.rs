//! Periodic work aligned to wall-clock second boundaries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Time to sleep so the next wake-up lands on a second boundary, shifted by
/// `offset_ms`. Always in `1..=1000` milliseconds.
pub fn delay_to_next_second(now_ms: i64, offset_ms: i64) -> Duration {
    let into_second = (now_ms + offset_ms).rem_euclid(1000);
    Duration::from_millis((1000 - into_second) as u64)
}

/// What a tick callback wants the ticker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    Stop,
}

/// A cancellable once-per-second task.
///
/// Each sleep is recomputed from the clock, so processing jitter and process
/// suspension do not accumulate into drift.
pub struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn<F, Fut>(clock: Arc<dyn Clock>, offset_ms: i64, cancel: CancellationToken, mut on_tick: F) -> Ticker
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickFlow> + Send + 'static,
    {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let wait = delay_to_next_second(clock.now_ms(), offset_ms);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if on_tick().await == TickFlow::Stop {
                    break;
                }
            }
            debug!("ticker stopped");
        });
        Ticker { cancel, handle }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the loop to end on its own.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("ticker task failed: {e}");
        }
    }

    pub async fn stop(self) {
        self.cancel();
        self.join().await;
    }
}
