use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use latency_tracker_common::{CallbackFlag, EventKey, EventOutcome};

/// Function invoked when an event crosses its threshold, times out, or is
/// torn down with the tracker.
pub type EventCallback<P, D> = fn(&Trigger<'_, P, D>);

/// One tracked interval.
///
/// Everything but the completion fields is fixed before the record is
/// published in the table.
pub struct LatencyEvent<P, D> {
    key: EventKey,
    start_ts: u64,
    threshold: u64,
    timeout: u64,
    callback: EventCallback<P, D>,
    data: D,
    outcome: AtomicU8,
    end_ts: AtomicU64,
    out_id: AtomicU32,
    live: Arc<AtomicUsize>,
}

impl<P, D> LatencyEvent<P, D> {
    pub(crate) fn new(
        key: EventKey,
        start_ts: u64,
        threshold: u64,
        timeout: u64,
        callback: EventCallback<P, D>,
        data: D,
        live: Arc<AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self {
            key,
            start_ts,
            threshold,
            timeout,
            callback,
            data,
            outcome: AtomicU8::new(EventOutcome::None as u8),
            end_ts: AtomicU64::new(0),
            out_id: AtomicU32::new(0),
            live,
        }
    }

    pub fn key(&self) -> &EventKey {
        &self.key
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// `None` when the event has no timeout.
    pub fn deadline(&self) -> Option<u64> {
        (self.timeout > 0).then(|| self.start_ts.saturating_add(self.timeout))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    pub fn outcome(&self) -> EventOutcome {
        EventOutcome::from(self.outcome.load(Ordering::Acquire))
    }

    /// Zero until the event is completed.
    pub fn end_ts(&self) -> u64 {
        self.end_ts.load(Ordering::Acquire)
    }

    pub fn out_id(&self) -> u32 {
        self.out_id.load(Ordering::Acquire)
    }

    pub(crate) fn callback(&self) -> EventCallback<P, D> {
        self.callback
    }

    /// Records the final outcome. Only the caller that unlinked the event may
    /// complete it, so a second completion means the table is corrupted.
    pub(crate) fn complete(&self, outcome: EventOutcome, end_ts: u64, out_id: u32) {
        self.end_ts.store(end_ts, Ordering::Relaxed);
        self.out_id.store(out_id, Ordering::Relaxed);
        let prev = self.outcome.compare_exchange(
            EventOutcome::None as u8,
            outcome as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(
            prev.is_ok(),
            "event {:?} completed twice ({:?} then {:?})",
            self.key,
            EventOutcome::from(prev.unwrap_or_else(|v| v)),
            outcome
        );
    }
}

impl<P, D> Drop for LatencyEvent<P, D> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Arguments handed to an [`EventCallback`].
pub struct Trigger<'a, P, D> {
    pub event: &'a LatencyEvent<P, D>,
    pub flag: CallbackFlag,
    /// Tracker-wide context.
    pub private: &'a P,
}

impl<P, D> Trigger<'_, P, D> {
    pub fn key(&self) -> &EventKey {
        self.event.key()
    }

    pub fn data(&self) -> &D {
        self.event.data()
    }

    pub fn out_id(&self) -> u32 {
        self.event.out_id()
    }

    pub fn start_ts(&self) -> u64 {
        self.event.start_ts()
    }

    pub fn end_ts(&self) -> u64 {
        self.event.end_ts()
    }

    pub fn delay(&self) -> u64 {
        self.end_ts().saturating_sub(self.start_ts())
    }
}

/// Counted reference to an open (or just completed) event, obtained from
/// `Tracker::get_event`. The record stays alive until every reference is
/// released, even if it is unlinked in the meantime.
pub struct EventRef<P, D>(pub(crate) Arc<LatencyEvent<P, D>>);

impl<P, D> EventRef<P, D> {
    /// Number of holders, the table included while the event is still open.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Same as `Tracker::put_event`.
    pub fn put(self) {}
}

impl<P, D> Deref for EventRef<P, D> {
    type Target = LatencyEvent<P, D>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
