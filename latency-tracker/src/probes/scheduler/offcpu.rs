//! Off-CPU latency probe.
//!
//! Opens an event when a task is switched out and closes it when the task is
//! switched back in. Tasks that stay off-CPU for at least the threshold are
//! reported with a stack snapshot, and so are wakeups of such tasks.
//!
//! ## Use Cases
//! - Finding tasks blocked on I/O, locks or sleeps for too long
//! - Attributing long waits to the task that finally woke the sleeper

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use latency_tracker_common::{CallbackFlag, Comm, DupPolicy, SchedExit};
use log::debug;

use super::sink::{OffCpuRecord, RecordSink, WakeupRecord};
use super::stack::{ContextCapture, StackText};
use super::{SchedEvent, TaskInfo};
use crate::probes::Probe;
use crate::telemetry;
use crate::tracker::{
    AdmissionError, Clock, MonotonicClock, Tracker, TrackerConfig, TrackerError, Trigger,
};

pub const DEFAULT_THRESHOLD_US: u64 = 5 * 1000 * 1000;
pub const DEFAULT_TIMEOUT_US: u64 = 0;

#[derive(Debug, Clone)]
pub struct OffCpuConfig {
    pub threshold_us: u64,
    /// Zero disables timeouts.
    pub timeout_us: u64,
    pub skip_kernel_threads: bool,
    /// Raise the threshold to every delay reported, so only new worst cases
    /// show up.
    pub track_worst: bool,
    pub nr_cpus: usize,
}

impl Default for OffCpuConfig {
    fn default() -> Self {
        Self {
            threshold_us: DEFAULT_THRESHOLD_US,
            timeout_us: DEFAULT_TIMEOUT_US,
            skip_kernel_threads: false,
            track_worst: false,
            nr_cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// Which task each CPU is currently running. Zero means idle or unknown.
pub struct CpuSlots {
    current: Box<[AtomicU32]>,
}

impl CpuSlots {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            current: (0..nr_cpus.max(1)).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn set(&self, cpu: u32, pid: u32) {
        if let Some(slot) = self.current.get(cpu as usize) {
            slot.store(pid, Ordering::Relaxed);
        }
    }

    pub fn current(&self, cpu: u32) -> Option<u32> {
        self.current
            .get(cpu as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
    }

    pub fn is_running(&self, pid: u32) -> bool {
        pid != 0
            && self
                .current
                .iter()
                .any(|slot| slot.load(Ordering::Relaxed) == pid)
    }
}

/// Shared by every callback of the probe's tracker.
pub struct OffCpuContext {
    sink: Arc<dyn RecordSink>,
    capture: Arc<dyn ContextCapture>,
    threshold_ns: AtomicU64,
    track_worst: bool,
    alerts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffCpuSummary {
    /// Switch-outs the tracker could not admit.
    pub skipped: u64,
    pub alerts: u64,
    pub wakeup_alerts: u64,
    /// Tasks still off-CPU when the probe was stopped.
    pub drained: usize,
}

pub struct OffCpuProbe {
    tracker: Tracker<OffCpuContext, Comm>,
    slots: CpuSlots,
    timeout_ns: AtomicU64,
    skip_kernel_threads: bool,
    wakeup_alerts: AtomicU64,
}

fn pid_key(pid: u32) -> [u8; 4] {
    pid.to_ne_bytes()
}

fn skip_reason(err: &AdmissionError) -> &'static str {
    match err {
        AdmissionError::TableFull { .. } => "table_full",
        AdmissionError::AllocationFailed => "allocation_failed",
        AdmissionError::KeyTooLarge(_) => "key_too_large",
        AdmissionError::Duplicate => "duplicate",
    }
}

fn offcpu_cb(trigger: &Trigger<'_, OffCpuContext, Comm>) {
    if trigger.flag != CallbackFlag::Normal {
        return;
    }
    if trigger.out_id() == SchedExit::Died as u32 {
        return;
    }

    let ctx = trigger.private;
    let delay = trigger.delay();
    if ctx.track_worst {
        ctx.threshold_ns.fetch_max(delay, Ordering::Relaxed);
    }

    let Some(pid) = trigger.key().as_pid() else {
        return;
    };
    let stack = ctx.capture.capture(pid, 0);
    ctx.sink.emit_offcpu(&OffCpuRecord {
        comm: trigger.data().as_str().to_string(),
        pid,
        delay_ns: delay,
        flag: trigger.flag.as_str(),
        stack: stack.as_str().to_string(),
    });
    ctx.alerts.fetch_add(1, Ordering::Relaxed);
}

impl OffCpuProbe {
    pub fn new(
        config: OffCpuConfig,
        tracker_config: TrackerConfig,
        sink: Arc<dyn RecordSink>,
        capture: Arc<dyn ContextCapture>,
    ) -> Result<Self, TrackerError> {
        Self::with_clock(
            config,
            tracker_config,
            sink,
            capture,
            Arc::new(MonotonicClock::default()),
        )
    }

    pub fn with_clock(
        config: OffCpuConfig,
        tracker_config: TrackerConfig,
        sink: Arc<dyn RecordSink>,
        capture: Arc<dyn ContextCapture>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrackerError> {
        let ctx = OffCpuContext {
            sink,
            capture,
            threshold_ns: AtomicU64::new(config.threshold_us.saturating_mul(1000)),
            track_worst: config.track_worst,
            alerts: AtomicU64::new(0),
        };
        let tracker = Tracker::with_clock(tracker_config, ctx, clock)?;

        Ok(Self {
            tracker,
            slots: CpuSlots::new(config.nr_cpus),
            timeout_ns: AtomicU64::new(config.timeout_us.saturating_mul(1000)),
            skip_kernel_threads: config.skip_kernel_threads,
            wakeup_alerts: AtomicU64::new(0),
        })
    }

    pub fn threshold_us(&self) -> u64 {
        self.tracker.private().threshold_ns.load(Ordering::Relaxed) / 1000
    }

    /// Applies to tasks switched out from now on.
    pub fn set_threshold_us(&self, us: u64) {
        self.tracker
            .private()
            .threshold_ns
            .store(us.saturating_mul(1000), Ordering::Relaxed);
    }

    pub fn timeout_us(&self) -> u64 {
        self.timeout_ns.load(Ordering::Relaxed) / 1000
    }

    pub fn set_timeout_us(&self, us: u64) {
        self.timeout_ns
            .store(us.saturating_mul(1000), Ordering::Relaxed);
    }

    pub fn slots(&self) -> &CpuSlots {
        &self.slots
    }

    pub fn alerts(&self) -> u64 {
        self.tracker.private().alerts.load(Ordering::Relaxed)
    }

    pub fn wakeup_alerts(&self) -> u64 {
        self.wakeup_alerts.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.tracker.skipped_count()
    }

    /// Tasks currently off-CPU and tracked.
    pub fn tracked(&self) -> usize {
        self.tracker.len()
    }

    fn skip(&self, task: &TaskInfo) -> bool {
        self.skip_kernel_threads && task.kernel_thread
    }

    fn on_switch(&self, cpu: u32, prev: Option<&TaskInfo>, next: Option<&TaskInfo>) {
        self.slots.set(cpu, next.map_or(0, |task| task.pid));

        if let Some(prev) = prev
            && !self.skip(prev)
        {
            let threshold = self.tracker.private().threshold_ns.load(Ordering::Relaxed);
            let timeout = self.timeout_ns.load(Ordering::Relaxed);
            if let Err(e) = self.tracker.event_in(
                &pid_key(prev.pid),
                threshold,
                offcpu_cb,
                timeout,
                DupPolicy::Allow,
                prev.comm,
            ) {
                debug!("Skipped off-CPU event for pid {}: {}", prev.pid, e);
                telemetry::record_skipped_event(skip_reason(&e));
            }
        }

        if let Some(next) = next
            && !self.skip(next)
        {
            self.tracker
                .event_out(&pid_key(next.pid), SchedExit::Normal as u32);
        }
    }

    fn on_wakeup(&self, task: &TaskInfo, waker: Option<&TaskInfo>) {
        // Already running on another CPU: nothing to report.
        if self.slots.is_running(task.pid) {
            return;
        }

        let Some(event) = self.tracker.get_event(&pid_key(task.pid)) else {
            return;
        };
        let ctx = self.tracker.private();
        let delta = self.tracker.now_ns().saturating_sub(event.start_ts());
        if delta > ctx.threshold_ns.load(Ordering::Relaxed) {
            let (waker_comm, waker_pid, waker_stack) = match waker {
                Some(waker) => (
                    waker.comm.as_str().to_string(),
                    waker.pid,
                    ctx.capture.capture(waker.pid, 0),
                ),
                None => ("<unknown>".to_string(), 0, StackText::default()),
            };
            ctx.sink.emit_wakeup(&WakeupRecord {
                waker_comm,
                waker_pid,
                waker_stack: waker_stack.as_str().to_string(),
                wakee_comm: event.data().as_str().to_string(),
                wakee_pid: task.pid,
                delay_ns: delta,
                flag: 0,
            });
            self.wakeup_alerts.fetch_add(1, Ordering::Relaxed);
        }
        self.tracker.put_event(event);
    }

    fn on_exit(&self, task: &TaskInfo) {
        self.tracker
            .event_out(&pid_key(task.pid), SchedExit::Died as u32);
    }

    /// Tears the tracker down and reports the totals.
    pub fn finish(self) -> OffCpuSummary {
        let skipped = self.skipped();
        let alerts = self.alerts();
        let wakeup_alerts = self.wakeup_alerts();
        let drained = self.tracker.destroy();
        OffCpuSummary {
            skipped,
            alerts,
            wakeup_alerts,
            drained,
        }
    }
}

impl Probe for OffCpuProbe {
    type Event = SchedEvent;

    fn name(&self) -> &'static str {
        "offcpu"
    }

    fn handle(&self, event: &SchedEvent) {
        match event {
            SchedEvent::Switch { cpu, prev, next } => {
                self.on_switch(*cpu, prev.as_ref(), next.as_ref())
            }
            SchedEvent::Wakeup { task, waker } => self.on_wakeup(task, waker.as_ref()),
            SchedEvent::Exit { task } => self.on_exit(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::scheduler::MemorySink;
    use crate::tracker::ManualClock;
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    struct FixedCapture;

    impl ContextCapture for FixedCapture {
        fn capture(&self, pid: u32, _skip: usize) -> StackText {
            StackText::from_frames([format!("frame_of_{}", pid).as_str()], 0)
        }
    }

    struct Harness {
        probe: OffCpuProbe,
        sink: Arc<MemorySink>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: OffCpuConfig) -> Harness {
        let sink = Arc::new(MemorySink::default());
        let clock = Arc::new(ManualClock::new(0));
        let tracker_config = TrackerConfig {
            timer_period: Duration::ZERO,
            ..TrackerConfig::default()
        };
        let probe = OffCpuProbe::with_clock(
            config,
            tracker_config,
            sink.clone(),
            Arc::new(FixedCapture),
            clock.clone(),
        )
        .unwrap();
        Harness { probe, sink, clock }
    }

    fn config(threshold_ms: u64) -> OffCpuConfig {
        OffCpuConfig {
            threshold_us: threshold_ms * 1000,
            nr_cpus: 2,
            ..OffCpuConfig::default()
        }
    }

    fn switch(cpu: u32, prev: Option<TaskInfo>, next: Option<TaskInfo>) -> SchedEvent {
        SchedEvent::Switch { cpu, prev, next }
    }

    #[test]
    fn long_sleep_is_reported_with_stack() {
        let h = harness(config(10));
        let bash = TaskInfo::new(100, "bash");
        let idle = TaskInfo::new(0, "swapper/0");

        h.probe.handle(&switch(0, Some(bash), Some(idle)));
        h.clock.advance(25 * MS);
        h.probe.handle(&switch(0, Some(idle), Some(bash)));

        let records = h.sink.offcpu_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].comm, "bash");
        assert_eq!(records[0].pid, 100);
        assert_eq!(records[0].delay_ns, 25 * MS);
        assert_eq!(records[0].flag, "normal");
        assert_eq!(records[0].stack, "frame_of_100\n");
        assert_eq!(h.probe.alerts(), 1);
    }

    #[test]
    fn short_sleep_is_not_reported() {
        let h = harness(config(10));
        let bash = TaskInfo::new(100, "bash");

        h.probe.handle(&switch(0, Some(bash), None));
        h.clock.advance(5 * MS);
        h.probe.handle(&switch(1, None, Some(bash)));

        assert!(h.sink.offcpu_records().is_empty());
        assert_eq!(h.probe.tracked(), 0);
    }

    #[test]
    fn exited_task_is_not_reported() {
        let h = harness(config(10));
        let task = TaskInfo::new(7, "worker");

        h.probe.handle(&switch(0, Some(task), None));
        h.clock.advance(50 * MS);
        h.probe.handle(&SchedEvent::Exit { task });

        assert!(h.sink.offcpu_records().is_empty());
        assert_eq!(h.probe.tracked(), 0);
    }

    #[test]
    fn wakeup_after_threshold_reports_waker() {
        let h = harness(config(10));
        let sleeper = TaskInfo::new(100, "sleeper");
        let waker = TaskInfo::new(200, "waker");

        h.probe.handle(&switch(0, Some(sleeper), Some(waker)));
        h.clock.advance(30 * MS);
        h.probe.handle(&SchedEvent::Wakeup {
            task: sleeper,
            waker: Some(waker),
        });

        let wakeups = h.sink.wakeup_records();
        assert_eq!(wakeups.len(), 1);
        assert_eq!(wakeups[0].wakee_comm, "sleeper");
        assert_eq!(wakeups[0].wakee_pid, 100);
        assert_eq!(wakeups[0].waker_pid, 200);
        assert_eq!(wakeups[0].waker_stack, "frame_of_200\n");
        assert_eq!(wakeups[0].delay_ns, 30 * MS);
        // The wakeup only peeks; the event is still open.
        assert_eq!(h.probe.tracked(), 1);
        assert_eq!(h.probe.wakeup_alerts(), 1);
    }

    #[test]
    fn wakeup_of_running_task_is_ignored() {
        let h = harness(config(10));
        let task = TaskInfo::new(100, "task");

        h.probe.handle(&switch(0, Some(task), None));
        // Running again on cpu 1 before its switch-in was observed.
        h.probe.slots().set(1, 100);
        h.clock.advance(30 * MS);
        h.probe.handle(&SchedEvent::Wakeup { task, waker: None });

        assert!(h.sink.wakeup_records().is_empty());
    }

    #[test]
    fn kernel_threads_can_be_skipped() {
        let h = harness(OffCpuConfig {
            skip_kernel_threads: true,
            ..config(10)
        });
        let kworker = TaskInfo::kernel(9, "kworker/0:1");

        h.probe.handle(&switch(0, Some(kworker), None));
        assert_eq!(h.probe.tracked(), 0);
        assert_eq!(h.probe.skipped(), 0);
    }

    #[test]
    fn track_worst_raises_threshold() {
        let h = harness(OffCpuConfig {
            track_worst: true,
            ..config(10)
        });
        let task = TaskInfo::new(100, "task");

        h.probe.handle(&switch(0, Some(task), None));
        h.clock.advance(40 * MS);
        h.probe.handle(&switch(0, None, Some(task)));
        assert_eq!(h.probe.threshold_us(), 40_000);

        h.probe.handle(&switch(0, Some(task), None));
        h.clock.advance(20 * MS);
        h.probe.handle(&switch(0, None, Some(task)));
        assert_eq!(h.sink.offcpu_records().len(), 1);
    }

    #[test]
    fn timeout_flag_is_not_reported() {
        let h = harness(OffCpuConfig {
            timeout_us: 50_000,
            ..config(10)
        });
        let task = TaskInfo::new(100, "stuck");

        h.probe.handle(&switch(0, Some(task), None));
        h.clock.advance(60 * MS);
        assert_eq!(h.probe.tracker.sweep_timeouts(), 1);
        assert!(h.sink.offcpu_records().is_empty());
        assert_eq!(h.probe.tracked(), 0);
    }

    #[test]
    fn finish_reports_totals() {
        let h = harness(config(10));
        h.probe.set_timeout_us(0);
        h.probe.set_threshold_us(1_000);
        assert_eq!(h.probe.threshold_us(), 1_000);

        let a = TaskInfo::new(1, "a");
        let b = TaskInfo::new(2, "b");
        h.probe.handle(&switch(0, Some(a), Some(b)));
        h.clock.advance(2 * MS);
        h.probe.handle(&switch(0, Some(b), Some(a)));

        let summary = h.probe.finish();
        assert_eq!(
            summary,
            OffCpuSummary {
                skipped: 0,
                alerts: 1,
                wakeup_alerts: 0,
                drained: 1,
            }
        );
    }

    #[test]
    fn cpu_slots_ignore_unknown_cpus() {
        let slots = CpuSlots::new(2);
        slots.set(5, 42);
        assert_eq!(slots.current(5), None);
        slots.set(1, 42);
        assert_eq!(slots.current(1), Some(42));
        assert!(slots.is_running(42));
        assert!(!slots.is_running(0));
    }
}
