//! OpenTelemetry metrics export module
//!
//! Exports latency tracker metrics to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint
//! Metrics are exported only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! Every `record_*` helper is a no-op otherwise.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<TrackerMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Active probes count, read by the ObservableGauge callback
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct TrackerMetrics {
    pub offcpu_duration_ns: Histogram<u64>,
    pub offcpu_alerts: Counter<u64>,
    pub wakeup_alerts: Counter<u64>,
    pub wakeup_delay_ns: Histogram<u64>,
    pub skipped_events: Counter<u64>,
}

impl TrackerMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            offcpu_duration_ns: meter
                .u64_histogram("offcpu_duration_ns")
                .with_description("Time spent off-CPU for events over threshold")
                .with_unit("ns")
                .build(),
            offcpu_alerts: meter
                .u64_counter("offcpu_alerts")
                .with_description("Number of off-CPU threshold alerts")
                .with_unit("events")
                .build(),
            wakeup_alerts: meter
                .u64_counter("wakeup_alerts")
                .with_description("Number of wakeups of tasks off-CPU past threshold")
                .with_unit("events")
                .build(),
            wakeup_delay_ns: meter
                .u64_histogram("wakeup_delay_ns")
                .with_description("Time off-CPU observed at wakeup")
                .with_unit("ns")
                .build(),
            skipped_events: meter
                .u64_counter("tracker_skipped_events")
                .with_description("Events the tracker could not admit")
                .with_unit("events")
                .build(),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 2. If not set, metrics are disabled (no default fallback)
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
/// Must be called from within a Tokio runtime.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "latency-tracker"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("latency_tracker");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(TrackerMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static TrackerMetrics> {
    METRICS.get()
}

/// Updates the active probes map read by the ObservableGauge callback
pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

pub fn active_probe_count(probe_name: &str) -> Option<u64> {
    active_probes_map()
        .read()
        .ok()
        .and_then(|probes| probes.get(probe_name).copied())
}

pub fn record_offcpu_event(duration_ns: u64, flag: &str, comm: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("flag", flag.to_string()),
            KeyValue::new("process", comm.to_string()),
        ];
        m.offcpu_duration_ns.record(duration_ns, &attrs);
        m.offcpu_alerts.add(1, &attrs);
    }
}

pub fn record_wakeup_event(delay_ns: u64, wakee_comm: &str, waker_comm: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("process", wakee_comm.to_string()),
            KeyValue::new("waker", waker_comm.to_string()),
        ];
        m.wakeup_delay_ns.record(delay_ns, &attrs);
        m.wakeup_alerts.add(1, &attrs);
    }
}

pub fn record_skipped_event(reason: &str) {
    if let Some(m) = metrics() {
        m.skipped_events
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
