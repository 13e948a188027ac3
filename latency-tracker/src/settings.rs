use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::probes::POLL_INTERVAL_MS;
use crate::probes::scheduler::OffCpuConfig;
use crate::tracker::TrackerConfig;

/// Event table and timeout scheduler configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TrackerSettings {
    pub max_events: Option<usize>,
    pub max_resize: Option<usize>,
    pub timer_period_ms: Option<u64>,
}

/// Off-CPU probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct OffCpuSettings {
    pub threshold_us: Option<u64>,
    pub timeout_us: Option<u64>,
    pub sample_interval_ms: Option<u64>,
    pub skip_kernel_threads: Option<bool>,
    pub track_worst: Option<bool>,
    /// Reading `/proc/<pid>/stack` needs CAP_SYS_ADMIN.
    pub capture_stacks: Option<bool>,
    /// `log` (default) or `json`
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Log,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub offcpu: OffCpuSettings,
}

impl Settings {
    /// Environment only, e.g. `OFFCPU__THRESHOLD_US=100000`.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Optional YAML file, overridden by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn to_tracker_config(&self) -> TrackerConfig {
        let defaults = TrackerConfig::default();
        let max_events = self.tracker.max_events.unwrap_or(defaults.max_events);
        TrackerConfig {
            max_events,
            max_resize: self
                .tracker
                .max_resize
                .unwrap_or(defaults.max_resize)
                .max(max_events),
            timer_period: self
                .tracker
                .timer_period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timer_period),
        }
    }

    pub fn to_offcpu_config(&self) -> OffCpuConfig {
        let defaults = OffCpuConfig::default();
        OffCpuConfig {
            threshold_us: self.offcpu.threshold_us.unwrap_or(defaults.threshold_us),
            timeout_us: self.offcpu.timeout_us.unwrap_or(defaults.timeout_us),
            skip_kernel_threads: self
                .offcpu
                .skip_kernel_threads
                .unwrap_or(defaults.skip_kernel_threads),
            track_worst: self.offcpu.track_worst.unwrap_or(defaults.track_worst),
            nr_cpus: defaults.nr_cpus,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(
            self.offcpu
                .sample_interval_ms
                .unwrap_or(POLL_INTERVAL_MS)
                .max(1),
        )
    }

    pub fn capture_stacks(&self) -> bool {
        self.offcpu.capture_stacks.unwrap_or(true)
    }

    pub fn output_format(&self) -> OutputFormat {
        match self.offcpu.output.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("json") => OutputFormat::Json,
            Some(s) if !s.eq_ignore_ascii_case("log") => {
                log::warn!("Unknown output format '{}', using log", s);
                OutputFormat::Log
            }
            _ => OutputFormat::Log,
        }
    }
}
