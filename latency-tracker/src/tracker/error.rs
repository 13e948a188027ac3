use thiserror::Error;

/// Why `event_in` could not start tracking an event. Every variant is counted
/// in the tracker's skipped count.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("event table is full ({capacity} events)")]
    TableFull { capacity: usize },
    #[error("failed to allocate storage for the event")]
    AllocationFailed,
    #[error("key of {0} bytes exceeds the maximum key size")]
    KeyTooLarge(usize),
    #[error("an event with this key is already tracked")]
    Duplicate,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid tracker configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn the timeout scheduler")]
    Spawn(#[source] std::io::Error),
}
