pub mod probes;
pub mod settings;
pub mod telemetry;
pub mod tracker;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::info;
use tokio::signal;

use crate::probes::scheduler::{
    ContextCapture, JsonSink, LogSink, NoCapture, OffCpuProbe, OffCpuSummary, ProcSampler,
    ProcStackCapture, RecordSink,
};
use crate::probes::{request_shutdown, spawn_source_handler};
use crate::settings::{OutputFormat, Settings};

pub use latency_tracker_common::{CallbackFlag, DupPolicy, EventKey, EventOutcome};

/// Runs the off-CPU probe against procfs until Ctrl-C.
pub struct OffCpuEngine {
    pub settings: Settings,
}

impl OffCpuEngine {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn build_probe(&self) -> Result<OffCpuProbe> {
        let sink: Arc<dyn RecordSink> = match self.settings.output_format() {
            OutputFormat::Log => Arc::new(LogSink),
            OutputFormat::Json => Arc::new(JsonSink),
        };
        let capture: Arc<dyn ContextCapture> = if self.settings.capture_stacks() {
            Arc::new(ProcStackCapture)
        } else {
            Arc::new(NoCapture)
        };
        let config = self.settings.to_offcpu_config();
        info!(
            "Off-CPU threshold={}us timeout={}us",
            config.threshold_us, config.timeout_us
        );
        OffCpuProbe::new(
            config,
            self.settings.to_tracker_config(),
            sink,
            capture,
        )
        .context("Failed to create off-CPU tracker")
    }

    pub async fn run(self) -> Result<OffCpuSummary> {
        let probe = Arc::new(self.build_probe()?);
        let handler = spawn_source_handler(
            ProcSampler::default(),
            probe.clone(),
            self.settings.sample_interval(),
        );

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        request_shutdown();
        handler.await.context("Sampler task failed")?;

        let probe = Arc::try_unwrap(probe)
            .map_err(|_| anyhow!("Off-CPU probe still referenced after shutdown"))?;
        let summary = probe.finish();
        info!("Missed events : {}", summary.skipped);
        info!("Total offcpu alerts : {}", summary.alerts);
        info!("Total wakeup alerts : {}", summary.wakeup_alerts);
        Ok(summary)
    }
}
