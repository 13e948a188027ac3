use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use latency_tracker::{OffCpuEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
#[command(name = "offcpu", about = "Report tasks that stay off-CPU for too long")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; environment variables take precedence
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Report tasks off-CPU for at least this long (microseconds)
    #[clap(long)]
    threshold_us: Option<u64>,

    /// Force-close events open this long (microseconds, 0 disables)
    #[clap(long)]
    timeout_us: Option<u64>,

    /// Emit records as JSON lines on stdout
    #[clap(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if opt.verbose { "info" } else { "warn" },
    ))
    .init();

    let mut settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    if opt.threshold_us.is_some() {
        settings.offcpu.threshold_us = opt.threshold_us;
    }
    if opt.timeout_us.is_some() {
        settings.offcpu.timeout_us = opt.timeout_us;
    }
    if opt.json {
        settings.offcpu.output = Some("json".into());
    }

    telemetry::init_metrics()?;

    let result = OffCpuEngine::new(settings).run().await;
    telemetry::shutdown_metrics();
    result.map(|_| ())
}
