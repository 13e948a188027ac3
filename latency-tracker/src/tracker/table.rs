use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use latency_tracker_common::{DupPolicy, EventKey};
use log::debug;

use super::error::AdmissionError;
use super::event::LatencyEvent;

type Bucket<P, D> = VecDeque<Arc<LatencyEvent<P, D>>>;

/// Concurrent map from key to the open events for that key, oldest first.
///
/// Locking is per shard, never table-wide: a close only contends with
/// operations on keys hashed to the same shard. Unlinking an event happens in
/// a single shard critical section, so exactly one of `take_oldest`,
/// `for_each_expired` and `drain_all` ever gets a given record.
pub(crate) struct EventTable<P, D> {
    buckets: DashMap<EventKey, Bucket<P, D>>,
    len: AtomicUsize,
    capacity: AtomicUsize,
    max_capacity: usize,
    // Open events that carry a timeout; sweeps are skipped while zero.
    timed: AtomicUsize,
}

impl<P, D> EventTable<P, D> {
    pub(crate) fn new(capacity: usize, max_capacity: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            max_capacity: max_capacity.max(capacity),
            timed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Publishes the event built by `build`. The builder runs under the
    /// bucket lock so events sharing a key are queued in start order.
    pub(crate) fn insert<F>(
        &self,
        key: EventKey,
        policy: DupPolicy,
        build: F,
    ) -> Result<(), AdmissionError>
    where
        F: FnOnce() -> LatencyEvent<P, D>,
    {
        self.reserve()?;

        let mut bucket = self.buckets.entry(key).or_default();
        if policy == DupPolicy::Reject && !bucket.is_empty() {
            drop(bucket);
            self.unreserve();
            return Err(AdmissionError::Duplicate);
        }
        if bucket.try_reserve(1).is_err() {
            let orphaned = bucket.is_empty();
            drop(bucket);
            if orphaned {
                self.buckets.remove_if(&key, |_, bucket| bucket.is_empty());
            }
            self.unreserve();
            return Err(AdmissionError::AllocationFailed);
        }

        let event = build();
        if event.timeout() > 0 {
            self.timed.fetch_add(1, Ordering::AcqRel);
        }
        bucket.push_back(Arc::new(event));
        Ok(())
    }

    /// Unlinks the oldest event for `key`.
    pub(crate) fn take_oldest(&self, key: &EventKey) -> Option<Arc<LatencyEvent<P, D>>> {
        let mut taken = None;
        self.buckets.remove_if_mut(key, |_, bucket| {
            taken = bucket.pop_front();
            bucket.is_empty()
        });
        let event = taken?;
        self.release(&event);
        Some(event)
    }

    /// Returns a new reference to the oldest event for `key` without unlinking it.
    pub(crate) fn peek_oldest(&self, key: &EventKey) -> Option<Arc<LatencyEvent<P, D>>> {
        self.buckets
            .get(key)
            .and_then(|bucket| bucket.front().cloned())
    }

    /// Unlinks every event whose deadline is at or before `now` and hands
    /// them to `f`, oldest first, once all shard locks are released. Slots
    /// are freed before `f` runs, so a panicking `f` cannot leak them.
    pub(crate) fn for_each_expired<F>(&self, now: u64, mut f: F) -> usize
    where
        F: FnMut(Arc<LatencyEvent<P, D>>),
    {
        if self.timed.load(Ordering::Acquire) == 0 {
            return 0;
        }

        let mut expired = Vec::new();
        self.buckets.retain(|_, bucket| {
            bucket.retain(|event| {
                if event.is_expired(now) {
                    expired.push(event.clone());
                    false
                } else {
                    true
                }
            });
            !bucket.is_empty()
        });

        expired.sort_by_key(|event| event.start_ts());
        let count = expired.len();
        for event in &expired {
            self.release(event);
        }
        for event in expired {
            f(event);
        }
        count
    }

    /// Unlinks everything. Used on teardown.
    pub(crate) fn drain_all<F>(&self, mut f: F) -> usize
    where
        F: FnMut(Arc<LatencyEvent<P, D>>),
    {
        let mut drained = Vec::new();
        self.buckets.retain(|_, bucket| {
            drained.extend(bucket.drain(..));
            false
        });

        drained.sort_by_key(|event| event.start_ts());
        let count = drained.len();
        for event in &drained {
            self.release(event);
        }
        for event in drained {
            f(event);
        }
        count
    }

    fn reserve(&self) -> Result<(), AdmissionError> {
        loop {
            let capacity = self.capacity.load(Ordering::Acquire);
            let reserved = self
                .len
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                    (len < capacity).then_some(len + 1)
                });
            if reserved.is_ok() {
                return Ok(());
            }
            if capacity >= self.max_capacity {
                return Err(AdmissionError::TableFull { capacity });
            }
            let grown = capacity.saturating_mul(2).min(self.max_capacity);
            if self
                .capacity
                .compare_exchange(capacity, grown, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("Event table grown from {} to {} slots", capacity, grown);
            }
        }
    }

    fn unreserve(&self) {
        let prev = self.len.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "event table length underflow");
    }

    fn release(&self, event: &LatencyEvent<P, D>) {
        self.unreserve();
        if event.timeout() > 0 {
            let prev = self.timed.fetch_sub(1, Ordering::AcqRel);
            assert!(prev > 0, "timed event count underflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::event::Trigger;

    fn noop(_: &Trigger<'_, (), u32>) {}

    struct Fixture {
        table: EventTable<(), u32>,
        live: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(capacity: usize, max_capacity: usize) -> Self {
            Self {
                table: EventTable::new(capacity, max_capacity),
                live: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn insert(
            &self,
            key: &[u8],
            start_ts: u64,
            timeout: u64,
            tag: u32,
            policy: DupPolicy,
        ) -> Result<(), AdmissionError> {
            let key = EventKey::new(key).unwrap();
            let live = self.live.clone();
            self.table.insert(key, policy, || {
                LatencyEvent::new(key, start_ts, 0, timeout, noop, tag, live)
            })
        }
    }

    #[test]
    fn same_key_closes_oldest_first() {
        let f = Fixture::new(8, 8);
        f.insert(b"k", 10, 0, 1, DupPolicy::Allow).unwrap();
        f.insert(b"k", 20, 0, 2, DupPolicy::Allow).unwrap();
        assert_eq!(f.table.len(), 2);

        let key = EventKey::new(b"k").unwrap();
        assert_eq!(*f.table.take_oldest(&key).unwrap().data(), 1);
        assert_eq!(*f.table.take_oldest(&key).unwrap().data(), 2);
        assert!(f.table.take_oldest(&key).is_none());
        assert_eq!(f.table.len(), 0);
    }

    #[test]
    fn reject_policy_refuses_second_event() {
        let f = Fixture::new(8, 8);
        f.insert(b"k", 10, 0, 1, DupPolicy::Reject).unwrap();
        assert_eq!(
            f.insert(b"k", 20, 0, 2, DupPolicy::Reject),
            Err(AdmissionError::Duplicate)
        );
        assert_eq!(f.table.len(), 1);
        assert_eq!(f.live.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn grows_up_to_max_then_rejects() {
        let f = Fixture::new(2, 4);
        for i in 0..4u32 {
            f.insert(&i.to_ne_bytes(), 0, 0, i, DupPolicy::Allow).unwrap();
        }
        assert_eq!(f.table.capacity(), 4);
        assert_eq!(
            f.insert(b"x", 0, 0, 9, DupPolicy::Allow),
            Err(AdmissionError::TableFull { capacity: 4 })
        );
    }

    #[test]
    fn peek_does_not_unlink() {
        let f = Fixture::new(4, 4);
        f.insert(b"k", 10, 0, 1, DupPolicy::Allow).unwrap();
        let key = EventKey::new(b"k").unwrap();

        let peeked = f.table.peek_oldest(&key).unwrap();
        assert_eq!(Arc::strong_count(&peeked), 2);
        assert_eq!(f.table.len(), 1);

        let taken = f.table.take_oldest(&key).unwrap();
        assert!(Arc::ptr_eq(&peeked, &taken));
    }

    #[test]
    fn expired_sweep_only_takes_past_deadlines() {
        let f = Fixture::new(8, 8);
        f.insert(b"a", 0, 100, 1, DupPolicy::Allow).unwrap();
        f.insert(b"b", 0, 300, 2, DupPolicy::Allow).unwrap();
        f.insert(b"c", 0, 0, 3, DupPolicy::Allow).unwrap();

        let mut seen = Vec::new();
        assert_eq!(f.table.for_each_expired(99, |e| seen.push(*e.data())), 0);
        assert_eq!(f.table.for_each_expired(100, |e| seen.push(*e.data())), 1);
        assert_eq!(seen, vec![1]);
        assert_eq!(f.table.for_each_expired(10_000, |e| seen.push(*e.data())), 1);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(f.table.len(), 1);
    }

    #[test]
    fn drain_empties_table() {
        let f = Fixture::new(8, 8);
        f.insert(b"a", 5, 0, 1, DupPolicy::Allow).unwrap();
        f.insert(b"a", 6, 0, 2, DupPolicy::Allow).unwrap();
        f.insert(b"b", 1, 50, 3, DupPolicy::Allow).unwrap();

        let mut seen = Vec::new();
        assert_eq!(f.table.drain_all(|e| seen.push(*e.data())), 3);
        assert_eq!(seen, vec![3, 1, 2]);
        assert_eq!(f.table.len(), 0);
        assert_eq!(f.live.load(Ordering::Relaxed), 0);
        assert_eq!(f.table.for_each_expired(u64::MAX, |_| {}), 0);
    }

    #[test]
    fn panicking_sweep_still_frees_every_slot() {
        let f = Fixture::new(8, 8);
        f.insert(b"a", 0, 10, 1, DupPolicy::Allow).unwrap();
        f.insert(b"b", 1, 10, 2, DupPolicy::Allow).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            f.table.for_each_expired(100, |_| panic!("callback failed"));
        }));
        assert!(result.is_err());
        assert_eq!(f.table.len(), 0);
        assert_eq!(f.live.load(Ordering::Relaxed), 0);
        assert_eq!(f.table.for_each_expired(u64::MAX, |_| {}), 0);
    }

    #[test]
    fn panicking_drain_still_frees_every_slot() {
        let f = Fixture::new(8, 8);
        f.insert(b"a", 0, 0, 1, DupPolicy::Allow).unwrap();
        f.insert(b"b", 1, 0, 2, DupPolicy::Allow).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            f.table.drain_all(|_| panic!("callback failed"));
        }));
        assert!(result.is_err());
        assert_eq!(f.table.len(), 0);
        assert_eq!(f.live.load(Ordering::Relaxed), 0);
    }
}
