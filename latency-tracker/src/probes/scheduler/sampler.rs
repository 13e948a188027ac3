//! Scheduler activity sampled from procfs.
//!
//! Every poll reads the state of all tasks and turns running <-> sleeping
//! transitions since the previous poll into [`SchedEvent`]s. Intervals
//! shorter than the poll period are invisible, so the sampler suits
//! thresholds well above it.

use std::collections::HashMap;

use anyhow::{Context, Result};
use log::debug;

use super::{SchedEvent, TaskInfo};
use crate::probes::EventSource;

const PF_KTHREAD: u32 = 0x0020_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskState {
    pub task: TaskInfo,
    pub running: bool,
    pub cpu: u32,
}

impl TaskState {
    fn from_stat(stat: &procfs::process::Stat) -> Self {
        let pid = stat.pid as u32;
        let task = if stat.flags & PF_KTHREAD != 0 {
            TaskInfo::kernel(pid, &stat.comm)
        } else {
            TaskInfo::new(pid, &stat.comm)
        };
        Self {
            task,
            running: stat.state == 'R',
            cpu: stat.processor.unwrap_or(0).max(0) as u32,
        }
    }
}

pub struct ProcSampler {
    seen: HashMap<u32, TaskState>,
    own_pid: i32,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            own_pid: std::process::id() as i32,
        }
    }
}

impl ProcSampler {
    fn snapshot(&self) -> Result<Vec<TaskState>> {
        let mut tasks = Vec::new();
        for process in procfs::process::all_processes().context("Failed to list processes")? {
            let Ok(process) = process else {
                continue;
            };
            if process.pid == self.own_pid {
                continue;
            }
            let Ok(iter) = process.tasks() else {
                continue;
            };
            for task in iter.flatten() {
                if let Ok(stat) = task.stat() {
                    tasks.push(TaskState::from_stat(&stat));
                }
            }
        }
        Ok(tasks)
    }

    /// Switch-outs come first so a CPU slot is freed before the next task
    /// claims it, then wakeups with their switch-ins, then exits.
    fn diff(&mut self, snapshot: Vec<TaskState>, out: &mut Vec<SchedEvent>) {
        let mut switched_in = Vec::new();
        let mut current = HashMap::with_capacity(snapshot.len());

        for state in snapshot {
            match self.seen.get(&state.task.pid) {
                Some(prev) if prev.running && !state.running => {
                    out.push(SchedEvent::Switch {
                        cpu: prev.cpu,
                        prev: Some(state.task),
                        next: None,
                    });
                }
                Some(prev) if !prev.running && state.running => {
                    switched_in.push(SchedEvent::Wakeup {
                        task: state.task,
                        waker: None,
                    });
                    switched_in.push(SchedEvent::Switch {
                        cpu: state.cpu,
                        prev: None,
                        next: Some(state.task),
                    });
                }
                _ => {}
            }
            current.insert(state.task.pid, state);
        }
        out.extend(switched_in);

        let mut exited: Vec<TaskInfo> = self
            .seen
            .values()
            .filter(|state| !current.contains_key(&state.task.pid))
            .map(|state| state.task)
            .collect();
        exited.sort_by_key(|task| task.pid);
        out.extend(exited.into_iter().map(|task| SchedEvent::Exit { task }));

        self.seen = current;
    }
}

impl EventSource for ProcSampler {
    type Event = SchedEvent;

    fn poll(&mut self, out: &mut Vec<SchedEvent>) -> Result<()> {
        let snapshot = self.snapshot()?;
        let before = out.len();
        self.diff(snapshot, out);
        if out.len() > before {
            debug!("Sampled {} scheduler events", out.len() - before);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pid: u32, running: bool, cpu: u32) -> TaskState {
        TaskState {
            task: TaskInfo::new(pid, "t"),
            running,
            cpu,
        }
    }

    #[test]
    fn first_sighting_emits_nothing() {
        let mut sampler = ProcSampler::default();
        let mut out = Vec::new();
        sampler.diff(vec![state(1, true, 0), state(2, false, 1)], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn transitions_become_switches() {
        let mut sampler = ProcSampler::default();
        let mut out = Vec::new();
        sampler.diff(vec![state(1, true, 0), state(2, false, 1)], &mut out);
        sampler.diff(vec![state(1, false, 0), state(2, true, 3)], &mut out);

        assert_eq!(
            out,
            vec![
                SchedEvent::Switch {
                    cpu: 0,
                    prev: Some(TaskInfo::new(1, "t")),
                    next: None,
                },
                SchedEvent::Wakeup {
                    task: TaskInfo::new(2, "t"),
                    waker: None,
                },
                SchedEvent::Switch {
                    cpu: 3,
                    prev: None,
                    next: Some(TaskInfo::new(2, "t")),
                },
            ]
        );
    }

    #[test]
    fn vanished_tasks_exit() {
        let mut sampler = ProcSampler::default();
        let mut out = Vec::new();
        sampler.diff(vec![state(5, false, 0), state(3, true, 0)], &mut out);
        sampler.diff(vec![], &mut out);
        assert_eq!(
            out,
            vec![
                SchedEvent::Exit {
                    task: TaskInfo::new(3, "t"),
                },
                SchedEvent::Exit {
                    task: TaskInfo::new(5, "t"),
                },
            ]
        );
    }

    #[test]
    fn unchanged_state_is_quiet() {
        let mut sampler = ProcSampler::default();
        let mut out = Vec::new();
        sampler.diff(vec![state(1, false, 0)], &mut out);
        sampler.diff(vec![state(1, false, 2)], &mut out);
        assert!(out.is_empty());
    }
}
