use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Holds at most one pending poll timer.
///
/// The timer task only sleeps and then spawns the tick as its own task, so aborting the timer
/// never cancels a request that has already started. Such a request reads [`PollScheduler::epoch`]
/// before it starts and re-arms through [`PollScheduler::schedule_next_since`], which refuses
/// once a stop has happened in between.
#[derive(Debug)]
pub struct PollScheduler {
    interval: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    // Bumped by every stop.
    epoch: AtomicU64,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Replaces any pending timer with one that runs `tick` after `delay`, or after the
    /// configured interval when no override is given. Must be called inside a tokio runtime.
    pub fn schedule_next<F, Fut>(&self, delay: Option<Duration>, tick: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending();
        self.arm(&mut pending, delay, tick);
    }

    /// Like [`PollScheduler::schedule_next`], but only while no stop happened since `epoch`
    /// was read. Returns whether the tick was armed.
    pub fn schedule_next_since<F, Fut>(&self, epoch: u64, delay: Option<Duration>, tick: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending();
        if self.epoch() != epoch {
            return false;
        }
        self.arm(&mut pending, delay, tick);
        true
    }

    /// Cancels the pending timer and invalidates every epoch read so far. Returns whether a
    /// timer was still waiting.
    pub fn stop(&self) -> bool {
        let mut pending = self.pending();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        match pending.take() {
            Some(timer) => {
                let waiting = !timer.is_finished();
                timer.abort();
                waiting
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn arm<F, Fut>(&self, pending: &mut Option<JoinHandle<()>>, delay: Option<Duration>, tick: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = delay.unwrap_or(self.interval);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(tick());
        });

        if let Some(previous) = pending.replace(timer) {
            previous.abort();
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
