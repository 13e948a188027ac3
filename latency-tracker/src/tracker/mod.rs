//! Latency tracking engine.
//!
//! A [`Tracker`] pairs `event_in` / `event_out` calls by key and measures the
//! time between them. When a closed event took at least its threshold, or an
//! open event outlives its timeout, the event's callback runs exactly once.
//!
//! ```text
//!  event_in ──► EventTable ──► event_out ──► NormalClose | ThresholdTrigger
//!                   │
//!                   ├──► TimeoutScheduler sweep ──► TimeoutTrigger
//!                   └──► destroy ──► GcDestroy
//! ```
//!
//! Whichever path unlinks a record first decides its outcome; the others
//! simply don't find it.

mod clock;
mod error;
mod event;
mod table;
mod timer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use latency_tracker_common::{CallbackFlag, DupPolicy, EventKey, EventOutcome};
use log::{debug, info};

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{AdmissionError, TrackerError};
pub use event::{EventCallback, EventRef, LatencyEvent, Trigger};

use table::EventTable;
use timer::TimeoutScheduler;

const DEFAULT_MAX_EVENTS: usize = 2000;
const DEFAULT_MAX_RESIZE: usize = 10000;
const DEFAULT_TIMER_PERIOD_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Initial number of events the table accepts.
    pub max_events: usize,
    /// Hard limit the table may grow to under pressure.
    pub max_resize: usize,
    /// Timeout sweep cadence. Zero disables the background scheduler.
    pub timer_period: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            max_resize: DEFAULT_MAX_RESIZE,
            timer_period: Duration::from_millis(DEFAULT_TIMER_PERIOD_MS),
        }
    }
}

impl TrackerConfig {
    fn validate(&self) -> Result<(), TrackerError> {
        if self.max_events == 0 {
            return Err(TrackerError::InvalidConfig("max_events must be positive"));
        }
        if self.max_resize < self.max_events {
            return Err(TrackerError::InvalidConfig(
                "max_resize must not be smaller than max_events",
            ));
        }
        Ok(())
    }
}

struct Shared<P, D> {
    table: EventTable<P, D>,
    clock: Arc<dyn Clock>,
    private: P,
    skipped: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl<P, D> Shared<P, D> {
    fn fire(&self, event: &LatencyEvent<P, D>, flag: CallbackFlag) {
        let callback = event.callback();
        callback(&Trigger {
            event,
            flag,
            private: &self.private,
        });
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_ns();
        self.table.for_each_expired(now, |event| {
            event.complete(EventOutcome::TimeoutTrigger, now, 0);
            self.fire(&event, CallbackFlag::Timeout);
        })
    }
}

/// Tracker instance: one per tracked domain.
///
/// `P` is the context shared by every callback of this tracker, `D` the
/// per-event data supplied to `event_in`.
pub struct Tracker<P, D>
where
    P: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    shared: Arc<Shared<P, D>>,
    scheduler: Option<TimeoutScheduler>,
    destroyed: bool,
}

impl<P, D> Tracker<P, D>
where
    P: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn create(config: TrackerConfig, private: P) -> Result<Self, TrackerError> {
        Self::with_clock(config, private, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        config: TrackerConfig,
        private: P,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrackerError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            table: EventTable::new(config.max_events, config.max_resize),
            clock,
            private,
            skipped: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        });

        let scheduler = if config.timer_period.is_zero() {
            None
        } else {
            let sweeper = shared.clone();
            Some(TimeoutScheduler::spawn(config.timer_period, move || {
                sweeper.sweep();
            })?)
        };

        debug!(
            "Tracker created (max_events={}, max_resize={}, timer_period={:?})",
            config.max_events, config.max_resize, config.timer_period
        );
        Ok(Self {
            shared,
            scheduler,
            destroyed: false,
        })
    }

    /// Starts tracking an event for `key`, stamped with the current time.
    ///
    /// On error the event is not tracked and the skipped count goes up by one.
    pub fn event_in(
        &self,
        key: &[u8],
        threshold: u64,
        callback: EventCallback<P, D>,
        timeout: u64,
        policy: DupPolicy,
        data: D,
    ) -> Result<(), AdmissionError> {
        let result = match EventKey::new(key) {
            Some(key) => self.shared.table.insert(key, policy, || {
                LatencyEvent::new(
                    key,
                    self.shared.clock.now_ns(),
                    threshold,
                    timeout,
                    callback,
                    data,
                    self.shared.live.clone(),
                )
            }),
            None => Err(AdmissionError::KeyTooLarge(key.len())),
        };
        if result.is_err() {
            self.shared.skipped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Closes the oldest open event for `key`.
    ///
    /// Returns `None` if there is none, which is expected when the event
    /// already timed out.
    pub fn event_out(&self, key: &[u8], out_id: u32) -> Option<EventOutcome> {
        let key = EventKey::new(key)?;
        let event = self.shared.table.take_oldest(&key)?;

        let now = self.shared.clock.now_ns();
        let outcome = if now.saturating_sub(event.start_ts()) >= event.threshold() {
            EventOutcome::ThresholdTrigger
        } else {
            EventOutcome::NormalClose
        };
        event.complete(outcome, now, out_id);
        if outcome == EventOutcome::ThresholdTrigger {
            self.shared.fire(&event, CallbackFlag::Normal);
        }
        Some(outcome)
    }

    /// Looks at the oldest open event for `key` without closing it. Release
    /// the reference with [`Tracker::put_event`].
    pub fn get_event(&self, key: &[u8]) -> Option<EventRef<P, D>> {
        let key = EventKey::new(key)?;
        self.shared.table.peek_oldest(&key).map(EventRef)
    }

    pub fn put_event(&self, event: EventRef<P, D>) {
        drop(event);
    }

    /// Expires every event past its deadline now. This is what the
    /// background scheduler runs each period.
    pub fn sweep_timeouts(&self) -> usize {
        self.shared.sweep()
    }

    pub fn skipped_count(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    pub fn private(&self) -> &P {
        &self.shared.private
    }

    pub fn now_ns(&self) -> u64 {
        self.shared.clock.now_ns()
    }

    /// Number of open events.
    pub fn len(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records not yet reclaimed: open events plus completed ones still held
    /// through an [`EventRef`].
    pub fn live_events(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    /// Stops the scheduler and closes every open event with
    /// [`CallbackFlag::GcDestroy`]. Returns how many were closed.
    pub fn destroy(mut self) -> usize {
        self.teardown()
    }

    fn teardown(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.destroyed = true;

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }

        let shared = &self.shared;
        let now = shared.clock.now_ns();
        let drained = shared.table.drain_all(|event| {
            event.complete(EventOutcome::GcDestroy, now, 0);
            shared.fire(&event, CallbackFlag::GcDestroy);
        });

        info!(
            "Tracker destroyed: {} open events closed, {} skipped",
            drained,
            self.skipped_count()
        );
        drained
    }
}

impl<P, D> Drop for Tracker<P, D>
where
    P: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.teardown();
    }
}
