use std::io::Write;
use std::sync::Mutex;

use log::warn;
use serde::Serialize;

use crate::telemetry;

/// A task stayed off-CPU for at least the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffCpuRecord {
    pub comm: String,
    pub pid: u32,
    pub delay_ns: u64,
    pub flag: &'static str,
    pub stack: String,
}

/// A task that had been off-CPU for longer than the threshold was woken up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WakeupRecord {
    pub waker_comm: String,
    pub waker_pid: u32,
    pub waker_stack: String,
    pub wakee_comm: String,
    pub wakee_pid: u32,
    pub delay_ns: u64,
    pub flag: u32,
}

/// Where off-CPU findings go.
pub trait RecordSink: Send + Sync {
    fn emit_offcpu(&self, record: &OffCpuRecord);
    fn emit_wakeup(&self, record: &WakeupRecord);
}

/// Emits structured `tracing` events and records metrics.
#[derive(Debug, Default)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn emit_offcpu(&self, record: &OffCpuRecord) {
        tracing::info!(
            target: "latency_tracker::offcpu",
            comm = %record.comm,
            pid = record.pid,
            delay_ns = record.delay_ns,
            flag = record.flag,
            stack = %record.stack,
            "offcpu_latency"
        );
        telemetry::record_offcpu_event(record.delay_ns, record.flag, &record.comm);
    }

    fn emit_wakeup(&self, record: &WakeupRecord) {
        tracing::info!(
            target: "latency_tracker::offcpu",
            waker_comm = %record.waker_comm,
            waker_pid = record.waker_pid,
            waker_stack = %record.waker_stack,
            wakee_comm = %record.wakee_comm,
            wakee_pid = record.wakee_pid,
            delay_ns = record.delay_ns,
            flag = record.flag,
            "offcpu_sched_wakeup"
        );
        telemetry::record_wakeup_event(record.delay_ns, &record.wakee_comm, &record.waker_comm);
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonLine<'a> {
    OffcpuLatency(&'a OffCpuRecord),
    OffcpuSchedWakeup(&'a WakeupRecord),
}

/// One JSON object per line on stdout. Also records metrics.
#[derive(Debug, Default)]
pub struct JsonSink;

impl JsonSink {
    fn write(&self, line: &JsonLine<'_>) {
        let mut out = std::io::stdout().lock();
        let written = serde_json::to_writer(&mut out, line)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"));
        if let Err(e) = written {
            warn!("Failed to write record: {}", e);
        }
    }
}

impl RecordSink for JsonSink {
    fn emit_offcpu(&self, record: &OffCpuRecord) {
        self.write(&JsonLine::OffcpuLatency(record));
        telemetry::record_offcpu_event(record.delay_ns, record.flag, &record.comm);
    }

    fn emit_wakeup(&self, record: &WakeupRecord) {
        self.write(&JsonLine::OffcpuSchedWakeup(record));
        telemetry::record_wakeup_event(record.delay_ns, &record.wakee_comm, &record.waker_comm);
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    offcpu: Mutex<Vec<OffCpuRecord>>,
    wakeups: Mutex<Vec<WakeupRecord>>,
}

impl MemorySink {
    pub fn offcpu_records(&self) -> Vec<OffCpuRecord> {
        self.offcpu.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn wakeup_records(&self) -> Vec<WakeupRecord> {
        self.wakeups.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RecordSink for MemorySink {
    fn emit_offcpu(&self, record: &OffCpuRecord) {
        self.offcpu
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }

    fn emit_wakeup(&self, record: &WakeupRecord) {
        self.wakeups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offcpu_record() -> OffCpuRecord {
        OffCpuRecord {
            comm: "bash".into(),
            pid: 42,
            delay_ns: 6_000_000_000,
            flag: "normal",
            stack: "do_nanosleep+0x6d/0x150\n".into(),
        }
    }

    #[test]
    fn json_line_is_tagged() {
        let record = offcpu_record();
        let value = serde_json::to_value(JsonLine::OffcpuLatency(&record)).unwrap();
        assert_eq!(value["event"], "offcpu_latency");
        assert_eq!(value["pid"], 42);
        assert_eq!(value["delay_ns"], 6_000_000_000u64);
        assert_eq!(value["comm"], "bash");
    }

    #[test]
    fn memory_sink_keeps_records() {
        let sink = MemorySink::default();
        sink.emit_offcpu(&offcpu_record());
        assert_eq!(sink.offcpu_records(), vec![offcpu_record()]);
        assert!(sink.wakeup_records().is_empty());
    }

    #[test]
    fn log_sink_does_not_panic_without_subscriber() {
        LogSink.emit_offcpu(&offcpu_record());
    }
}
