// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "clustered-job-scheduler";

/// Initialize structured logging with JSON formatting and trace context
///
/// Sets up the tracing subscriber with JSON output, the log level from
/// configuration (overridable through `RUST_LOG`), and an OpenTelemetry
/// layer when a tracing endpoint is configured.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_names(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider, flushing remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the scheduler metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "scheduler_triggers_acquired_total",
        "Total number of triggers acquired for firing"
    );
    describe_counter!(
        "scheduler_triggers_fired_total",
        "Total number of triggers handed to the worker pool"
    );
    describe_counter!(
        "scheduler_misfires_total",
        "Total number of misfired triggers repaired at acquisition or resume"
    );
    describe_counter!(
        "scheduler_status_write_failures_total",
        "Total number of failed trigger status document writes"
    );
    describe_counter!(
        "scheduler_work_rejected_total",
        "Total number of work items the worker pool refused"
    );
    describe_gauge!(
        "scheduler_watchlist_size",
        "Triggers possibly still executing on another node"
    );
    describe_gauge!(
        "scheduler_pool_busy_workers",
        "Worker threads currently running a job"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_triggers_acquired(count: usize) {
    counter!("scheduler_triggers_acquired_total").increment(count as u64);
}

#[inline]
pub fn record_trigger_fired(job_group: &str) {
    counter!("scheduler_triggers_fired_total", "job_group" => job_group.to_string()).increment(1);
}

#[inline]
pub fn record_misfire(trigger_group: &str) {
    counter!("scheduler_misfires_total", "trigger_group" => trigger_group.to_string())
        .increment(1);
}

#[inline]
pub fn record_status_write_failure() {
    counter!("scheduler_status_write_failures_total").increment(1);
}

#[inline]
pub fn record_work_rejected() {
    counter!("scheduler_work_rejected_total").increment(1);
}

/// Set the number of triggers waiting for cross-node confirmation
#[inline]
pub fn update_watchlist_size(size: usize) {
    gauge!("scheduler_watchlist_size").set(size as f64);
}

#[inline]
pub fn update_busy_workers(pool: &str, busy: usize) {
    gauge!("scheduler_pool_busy_workers", "pool" => pool.to_string()).set(busy as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_valid_level() {
        // A second initialization in the same process reports an error instead of panicking
        let result = init_logging("info", None);
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_init_logging_rejects_nothing_for_known_levels() {
        for level in ["error", "warn", "debug", "trace"] {
            let result = init_logging(level, None);
            assert!(result.is_ok() || result.is_err());
        }
    }

    #[test]
    fn test_metrics_recording() {
        // No recorder installed; recording must still be a no-op rather than a panic
        record_triggers_acquired(3);
        record_trigger_fired("reports");
        record_misfire("DEFAULT");
        record_status_write_failure();
        record_work_rejected();
        update_watchlist_size(2);
        update_busy_workers("scheduler", 1);
    }
}
