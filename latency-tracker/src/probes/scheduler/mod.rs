pub mod offcpu;
pub mod sampler;
pub mod sink;
pub mod stack;

use latency_tracker_common::Comm;

pub use offcpu::{CpuSlots, OffCpuConfig, OffCpuProbe, OffCpuSummary};
pub use sampler::ProcSampler;
pub use sink::{JsonSink, LogSink, MemorySink, OffCpuRecord, RecordSink, WakeupRecord};
pub use stack::{ContextCapture, NoCapture, ProcStackCapture, StackText};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: u32,
    pub comm: Comm,
    pub kernel_thread: bool,
}

impl TaskInfo {
    pub fn new(pid: u32, comm: &str) -> Self {
        Self {
            pid,
            comm: Comm::new(comm),
            kernel_thread: false,
        }
    }

    pub fn kernel(pid: u32, comm: &str) -> Self {
        Self {
            kernel_thread: true,
            ..Self::new(pid, comm)
        }
    }
}

/// Scheduler activity fed to the off-CPU probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedEvent {
    /// `prev` leaves `cpu`, `next` starts running on it. Either side may be
    /// unknown.
    Switch {
        cpu: u32,
        prev: Option<TaskInfo>,
        next: Option<TaskInfo>,
    },
    Wakeup {
        task: TaskInfo,
        waker: Option<TaskInfo>,
    },
    Exit {
        task: TaskInfo,
    },
}
