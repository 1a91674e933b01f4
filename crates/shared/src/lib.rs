use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    Resource,
    runtime,
    trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer},
};
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_semantic_conventions::resource::{DEPLOYMENT_ENVIRONMENT, SERVICE_NAME, SERVICE_VERSION};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use tracing_core::{Level, LevelFilter};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub mod message;
pub mod tls;

pub use message::TelemetryMessage;

/// Where and how a binary reports its logs, spans and metrics.
///
/// OTLP export is enabled by `OTEL_EXPORTER_OTLP_ENDPOINT`. Metrics are fed by tracing events
/// carrying `monotonic_counter.*` or `histogram.*` fields.
#[derive(Debug)]
pub struct TracingConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub endpoint: Option<String>,
    pub metrics_interval: Duration,
    pub log_level: Level,
    pub default_directive: LevelFilter,
}

impl TracingConfig {
    pub fn from_env(service_name: &str, service_version: &str) -> Self {
        let metrics_interval = std::env::var("OTEL_METRIC_EXPORT_INTERVAL")
            .ok()
            .and_then(|ms| ms.parse().ok())
            .map_or(Duration::from_secs(5), Duration::from_millis);

        Self {
            service_name: format!("bandwatch-{}", service_name),
            service_version: service_version.to_string(),
            environment: std::env::var("BANDWATCH_ENVIRONMENT").unwrap_or_else(|_| String::from("develop")),
            endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            metrics_interval,
            log_level: Level::DEBUG,
            default_directive: LevelFilter::INFO,
        }
    }

    fn resource(&self) -> Resource {
        Resource::from_schema_url(
            [
                KeyValue::new(SERVICE_NAME, self.service_name.clone()),
                KeyValue::new(SERVICE_VERSION, self.service_version.clone()),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT, self.environment.clone()),
            ],
            SCHEMA_URL,
        )
    }
}

pub fn print_header(
    bandwatch_official_build: bool,
    cargo_pkg_name: &str,
    cargo_pkg_version: &str,
    vergen_git_describe: &str,
    vergen_git_dirty: &str,
    vergen_build_timestamp: &str,
    vergen_cargo_target_triple: &str,
) {
    let version_string = if bandwatch_official_build {
        cargo_pkg_version.to_string()
    } else {
        format!(
            "{}{} built at {} for {} - UNOFFICIAL BUILD",
            vergen_git_describe,
            if vergen_git_dirty == "true" { "* (dirty)" } else { "" },
            vergen_build_timestamp.get(..19).unwrap_or(vergen_build_timestamp),
            vergen_cargo_target_triple
        )
    };

    println!("bandwatch-{} ver. {}", cargo_pkg_name, version_string);
}

/// Flushes the OTLP pipelines when the binary exits.
pub struct Guard {
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(Err(err)) = self.meter_provider.as_ref().map(SdkMeterProvider::shutdown) {
            eprintln!("{err:?}");
        }
        global::shutdown_tracer_provider();
    }
}

/// Installs the global subscriber for the binary named `service_name`.
pub fn init(service_name: &str, service_version: &str) -> Result<Guard> {
    let config = TracingConfig::from_env(service_name, service_version);
    let meter_provider = init_tracing_subscriber(&config)?;
    Ok(Guard { meter_provider })
}

fn otlp_exporter(endpoint: &str) -> TonicExporterBuilder {
    opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint)
}

fn init_meter_provider(config: &TracingConfig, endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = otlp_exporter(endpoint)
        .build_metrics_exporter(
            Box::new(DefaultAggregationSelector::new()),
            Box::new(DefaultTemporalitySelector::new()),
        )
        .context("Failed to build metrics exporter")?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(config.metrics_interval)
        .build();

    let meter_provider = MeterProviderBuilder::default()
        .with_resource(config.resource())
        .with_reader(reader)
        .build();

    global::set_meter_provider(meter_provider.clone());
    Ok(meter_provider)
}

fn init_tracer(config: &TracingConfig, endpoint: &str) -> Result<Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(1.0))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(config.resource()),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(otlp_exporter(endpoint))
        .install_batch(runtime::Tokio)
        .context("Failed to install tracer provider")
}

fn init_tracing_subscriber(config: &TracingConfig) -> Result<Option<SdkMeterProvider>> {
    let endpoint = config.endpoint.as_deref();
    let tracer = endpoint.map(|endpoint| init_tracer(config, endpoint)).transpose()?;
    let meter_provider = endpoint.map(|endpoint| init_meter_provider(config, endpoint)).transpose()?;

    let log_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(config.default_directive.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(config.log_level))
        .with(tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_filter(log_filter)
        )
        .with(meter_provider.clone().map(MetricsLayer::new))
        .with(tracer.map(OpenTelemetryLayer::new))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(meter_provider)
}

#[cfg(test)]
mod tests {
    use opentelemetry::{Key, Value};

    use super::*;

    #[test]
    fn resource_names_the_binary() {
        let config = TracingConfig {
            environment: String::from("staging"),
            ..TracingConfig::from_env("server", "0.3.0")
        };
        let resource = config.resource();

        assert_eq!(resource.get(Key::new(SERVICE_NAME)), Some(Value::from("bandwatch-server")));
        assert_eq!(resource.get(Key::new(SERVICE_VERSION)), Some(Value::from("0.3.0")));
        assert_eq!(resource.get(Key::new(DEPLOYMENT_ENVIRONMENT)), Some(Value::from("staging")));
    }
}
