//! Telemetry emitter: OTEL-shaped spans written to the durable journal,
//! mirrored live through `tracing`.
//!
//! Three independent outputs exist for the same events:
//!
//! - The durable journal (`telemetry_spans.jsonl`), written via
//!   [`StateStore::append_telemetry_span`] and subject to head sampling.
//! - The live `tracing` stream, always emitted regardless of sampling,
//!   consumed by whatever subscriber layer [`init_tracing`] installed
//!   (stdout, OTLP, or both per the `stdout`/`otlp` feature flags).
//! - `swarmsh_spans_total`/`swarmsh_span_duration_seconds` metrics, scraped
//!   by Prometheus when the `prometheus` feature installs the exporter.
//!
//! Operations that end a unit of work (`complete`, `fail`) or that flag a
//! health problem are always sampled into the journal; everything else is
//! head-sampled at the configured rate.

use crate::clock::{new_span_id, new_trace_id, now_ns};
use crate::config::KernelConfig;
use crate::model::{ServiceInfo, SpanStatus, TelemetrySpan};
use crate::store::StateStore;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Operation names that bypass sampling entirely: the record of how a
/// unit of work ended, or a health alert, is never optional.
const ALWAYS_SAMPLE: &[&str] = &[
    "coordination.complete",
    "coordination.fail",
    "health.alert",
];

/// Installs the process-wide `tracing` subscriber. Call once, from a
/// binary's `main`, before any other SwarmSH call. The returned guard must
/// be held for the lifetime of the process — dropping it stops the
/// non-blocking file writer from flushing.
///
/// Layers installed: a compact stdout layer, a JSON-formatted
/// daily-rolling file layer under
/// `logs/swarmsh.log`, and (with the `stdout`/`otlp` feature) an
/// OpenTelemetry bridge layer. With neither telemetry feature the
/// subscriber is just the two `tracing-subscriber` fmt layers.
pub fn init_tracing(config: &KernelConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true).with_level(true).compact();

    let file_appender = tracing_appender::rolling::daily(config.coordination_dir.join("logs"), "swarmsh.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false).json();

    #[cfg(any(feature = "stdout", feature = "otlp"))]
    {
        let tracer = build_otel_tracer(config)?;
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .with(file_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .context("installing tracing subscriber with OTEL layer")?;
    }

    #[cfg(not(any(feature = "stdout", feature = "otlp")))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .context("installing tracing subscriber")?;
    }

    #[cfg(feature = "prometheus")]
    init_metrics()?;

    Ok(guard)
}

/// Installs the Prometheus metrics exporter and registers the counters and
/// histograms [`TelemetryEmitter::record_span`] feeds on every call.
#[cfg(feature = "prometheus")]
fn init_metrics() -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .install()
        .context("installing Prometheus metrics exporter")?;

    metrics::describe_counter!("swarmsh_spans_total", "Total number of telemetry spans recorded");
    metrics::describe_histogram!(
        "swarmsh_span_duration_seconds",
        "Duration of kernel and control-loop operations in seconds"
    );
    Ok(())
}

#[cfg(feature = "stdout")]
fn build_otel_tracer(config: &KernelConfig) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace::TracerProvider as SdkTracerProvider, Resource};

    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
    ]);
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_resource(resource)
        .build();
    let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, config.service_name.clone());
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracer)
}

#[cfg(all(feature = "otlp", not(feature = "stdout")))]
fn build_otel_tracer(config: &KernelConfig) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::Resource;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
    ]);
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("installing OTLP pipeline")
}

/// Durable-journal writer with head sampling, shared across the kernel,
/// control loops, and worker runtime.
#[derive(Clone)]
pub struct TelemetryEmitter {
    store: Arc<StateStore>,
    service: ServiceInfo,
    sample_rate: f64,
}

impl TelemetryEmitter {
    pub fn new(store: Arc<StateStore>, config: &KernelConfig) -> Self {
        Self {
            store,
            service: ServiceInfo {
                name: config.service_name.clone(),
                version: config.service_version.clone(),
            },
            sample_rate: config.telemetry_sample_rate.clamp(0.0, 1.0),
        }
    }

    /// Record one completed span. `operation_name` should be
    /// dot-namespaced (`"coordination.claim"`, `"health.scan"`, ...).
    /// Spans not in [`ALWAYS_SAMPLE`] are head-sampled at the configured
    /// rate; the live `tracing::info_span!` mirror is unconditional.
    pub fn record_span(
        &self,
        operation_name: &str,
        trace_id: Option<String>,
        parent_span_id: Option<String>,
        start_time_ns: u64,
        status: SpanStatus,
        attributes: BTreeMap<String, String>,
    ) -> crate::error::SwarmResult<TelemetrySpan> {
        let span = TelemetrySpan {
            trace_id: trace_id.unwrap_or_else(new_trace_id),
            span_id: new_span_id(),
            parent_span_id,
            operation_name: operation_name.to_string(),
            start_time_ns,
            duration_ns: now_ns().saturating_sub(start_time_ns),
            status,
            attributes,
            service: self.service.clone(),
        };

        tracing::info_span!(
            "swarmsh.span",
            operation = %span.operation_name,
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            status = ?span.status,
        )
        .in_scope(|| {
            tracing::debug!(duration_ns = span.duration_ns, "span recorded");
        });

        metrics::counter!(
            "swarmsh_spans_total",
            1,
            "operation" => operation_name.to_string(),
            "status" => format!("{:?}", span.status)
        );
        metrics::histogram!(
            "swarmsh_span_duration_seconds",
            span.duration_ns as f64 / 1_000_000_000.0,
            "operation" => operation_name.to_string()
        );

        if self.should_sample(operation_name) {
            self.store.append_telemetry_span(&span)?;
        }
        Ok(span)
    }

    fn should_sample(&self, operation_name: &str) -> bool {
        if ALWAYS_SAMPLE.contains(&operation_name) {
            return true;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        // Deterministic head sample keyed off the low bits of the clock so
        // tests stay reproducible without a dedicated RNG thread.
        let bucket = (now_ns() % 1_000_000) as f64 / 1_000_000.0;
        bucket < self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_sample_list_bypasses_rate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let mut cfg = KernelConfig::for_dir(dir.path());
        cfg.telemetry_sample_rate = 0.0;
        let emitter = TelemetryEmitter::new(store.clone(), &cfg);

        emitter
            .record_span(
                "coordination.complete",
                None,
                None,
                now_ns(),
                SpanStatus::Ok,
                BTreeMap::new(),
            )
            .unwrap();

        assert_eq!(store.read_telemetry_spans().unwrap().len(), 1);
    }

    #[test]
    fn zero_rate_drops_non_critical_spans() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let mut cfg = KernelConfig::for_dir(dir.path());
        cfg.telemetry_sample_rate = 0.0;
        let emitter = TelemetryEmitter::new(store.clone(), &cfg);

        emitter
            .record_span("coordination.claim", None, None, now_ns(), SpanStatus::Ok, BTreeMap::new())
            .unwrap();

        assert!(store.read_telemetry_spans().unwrap().is_empty());
    }
}
