//! Periodic presence re-announcement.
//!
//! The scheduler does not know about connection state. A tick that was
//! already running when [`HeartbeatScheduler::cancel`] returned may still call
//! its callback, so the callback must re-check liveness under the session lock
//! before publishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

const MIN_INTERVAL: Duration = Duration::from_millis(100);

struct Heartbeat {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// At most one running heartbeat task.
#[derive(Default)]
pub struct HeartbeatScheduler {
    active: Option<Heartbeat>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `announce` now, before returning, and then every `interval`
    /// until cancelled. Replaces any heartbeat already running. Must be called
    /// inside a tokio runtime.
    pub fn start<F>(&mut self, interval: Duration, announce: F)
    where
        F: Fn() + Send + 'static,
    {
        self.cancel();
        announce();
        self.schedule(interval, announce);
    }

    /// Like [`start`](Self::start) without the immediate call: the first
    /// tick comes one `interval` from now. For callers that have already
    /// announced and cannot run `announce` from where they stand.
    pub fn schedule<F>(&mut self, interval: Duration, announce: F)
    where
        F: Fn() + Send + 'static,
    {
        self.cancel();

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let period = interval.max(MIN_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                announce();
            }
        });

        debug!(interval_secs = period.as_secs_f64(), "Heartbeat started");
        self.active = Some(Heartbeat { cancelled, handle });
    }

    /// Stop future ticks. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(heartbeat) = self.active.take() {
            heartbeat.cancelled.store(true, Ordering::Release);
            heartbeat.handle.abort();
            debug!("Heartbeat cancelled");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_immediately_then_periodically() {
        let mut scheduler = HeartbeatScheduler::new();
        let (count, announce) = counter();
        scheduler.start(Duration::from_secs(30), announce);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let mut scheduler = HeartbeatScheduler::new();
        let (count, announce) = counter();
        scheduler.start(Duration::from_secs(30), announce);
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.cancel();
        assert!(!scheduler.is_active());
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_waits_one_interval() {
        let mut scheduler = HeartbeatScheduler::new();
        let (count, announce) = counter();
        scheduler.schedule(Duration::from_secs(30), announce);
        assert!(scheduler.is_active());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_cancel_still_announced_once() {
        let mut scheduler = HeartbeatScheduler::new();
        let (count, announce) = counter();
        scheduler.start(Duration::from_secs(30), announce);
        scheduler.cancel();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut scheduler = HeartbeatScheduler::new();
        scheduler.cancel();
        scheduler.cancel();
        assert!(!scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous() {
        let mut scheduler = HeartbeatScheduler::new();
        let (first, announce_first) = counter();
        let (second, announce_second) = counter();

        scheduler.start(Duration::from_secs(30), announce_first);
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.start(Duration::from_secs(30), announce_second);
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }
}
