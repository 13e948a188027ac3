use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use super::error::TrackerError;

/// Background thread running a sweep every `period`, independent of event
/// traffic. Each sweep decides expiry from the tracker clock, so an event is
/// never forced before its deadline and at most one period after it.
pub(crate) struct TimeoutScheduler {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutScheduler {
    pub(crate) fn spawn<F>(period: Duration, sweep: F) -> Result<Self, TrackerError>
    where
        F: Fn() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name("latency-timeout".into())
            .spawn(move || {
                let mut next = Instant::now() + period;
                while flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        // Woken early by stop() or spuriously; re-check the flag.
                        thread::park_timeout(next - now);
                        continue;
                    }
                    sweep();
                    next += period;
                    if next < now {
                        // A sweep overran; don't fire a burst to catch up.
                        next = now + period;
                    }
                }
            })
            .map_err(TrackerError::Spawn)?;

        debug!("Timeout scheduler started (period={:?})", period);
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Timeout scheduler thread panicked in an event callback");
            } else {
                debug!("Timeout scheduler stopped");
            }
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
