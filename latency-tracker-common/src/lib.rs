#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::hash::{Hash, Hasher};

/// Largest key accepted by the tracker, in bytes.
pub const MAX_KEY_SIZE: usize = 128;

/// Size of the bounded stack text attached to off-CPU records.
pub const MAX_STACK_TXT: usize = 256;

/// Length of a task command name, including the trailing NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Opaque, fixed-size event key.
///
/// Equality and hashing only consider the first `len` bytes, so two keys built
/// from the same byte slice always collide in the table.
#[derive(Clone, Copy)]
pub struct EventKey {
    len: u8,
    bytes: [u8; MAX_KEY_SIZE],
}

impl EventKey {
    /// Returns `None` if `bytes` is longer than [`MAX_KEY_SIZE`].
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_KEY_SIZE {
            return None;
        }
        let mut key = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_KEY_SIZE],
        };
        key.bytes[..bytes.len()].copy_from_slice(bytes);
        Some(key)
    }

    pub fn from_pid(pid: u32) -> Self {
        let mut key = Self {
            len: 4,
            bytes: [0; MAX_KEY_SIZE],
        };
        key.bytes[..4].copy_from_slice(&pid.to_ne_bytes());
        key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decodes a key built with [`EventKey::from_pid`].
    pub fn as_pid(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.as_bytes().try_into().ok()?;
        Some(u32::from_ne_bytes(bytes))
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for EventKey {}

impl Hash for EventKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKey(")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Why a callback fired.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlag {
    Normal = 0,
    Timeout = 1,
    GcDestroy = 2,
}

impl CallbackFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackFlag::Normal => "normal",
            CallbackFlag::Timeout => "timeout",
            CallbackFlag::GcDestroy => "gc_destroy",
        }
    }
}

/// Final state of an event record. Set once, never changed afterwards.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    None = 0,
    NormalClose = 1,
    ThresholdTrigger = 2,
    TimeoutTrigger = 3,
    GcDestroy = 4,
}

impl From<u8> for EventOutcome {
    fn from(v: u8) -> Self {
        match v {
            1 => EventOutcome::NormalClose,
            2 => EventOutcome::ThresholdTrigger,
            3 => EventOutcome::TimeoutTrigger,
            4 => EventOutcome::GcDestroy,
            _ => EventOutcome::None,
        }
    }
}

/// What `event_in` does when the key already has an open event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DupPolicy {
    /// Queue the new event behind the existing ones; closes match oldest first.
    #[default]
    Allow,
    /// Refuse the new event.
    Reject,
}

/// `out_id` values reported by the scheduler front-end.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedExit {
    Normal = 0,
    Died = 1,
}

/// NUL-padded task command name.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Comm(pub [u8; TASK_COMM_LEN]);

impl Comm {
    /// Truncates to `TASK_COMM_LEN - 1` bytes, like the kernel does.
    pub fn new(name: &str) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        let len = name.len().min(TASK_COMM_LEN - 1);
        comm[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(comm)
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0)
            .unwrap_or("<invalid>")
            .trim_matches(char::from(0))
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
