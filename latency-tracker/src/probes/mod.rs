use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use log::{info, warn};
use tokio::task::JoinHandle;

use crate::telemetry;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod scheduler;

/// Instrumentation front-end fed by an [`EventSource`].
pub trait Probe: Send + Sync {
    type Event;

    fn name(&self) -> &'static str;

    fn handle(&self, event: &Self::Event);
}

/// Producer of raw events, polled on a blocking thread.
pub trait EventSource: Send + 'static {
    type Event;

    /// Appends whatever happened since the previous poll.
    fn poll(&mut self, out: &mut Vec<Self::Event>) -> Result<()>;
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Polls `source` every `interval` and hands each event to `probe` until
/// shutdown is requested.
pub fn spawn_source_handler<S, P>(mut source: S, probe: Arc<P>, interval: Duration) -> JoinHandle<()>
where
    S: EventSource,
    S::Event: Send,
    P: Probe<Event = S::Event> + 'static,
{
    let shutdown = shutdown_flag();
    telemetry::record_active_probe(probe.name(), 1);
    info!("{} probe attached (poll interval={:?})", probe.name(), interval);

    tokio::task::spawn_blocking(move || {
        let mut events = Vec::new();
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = source.poll(&mut events) {
                warn!("{} source poll failed: {:#}", probe.name(), e);
            }
            for event in events.drain(..) {
                probe.handle(&event);
            }
            std::thread::sleep(interval);
        }
        telemetry::record_active_probe(probe.name(), 0);
    })
}
