use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "capsync";
const OTEL_STDOUT_ENV: &str = "CAPSYNC_OTEL_STDOUT";
const DEFAULT_FILTER: &str = "info";

/// What to switch on at startup, resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Export spans to stdout through OpenTelemetry.
    pub otel_stdout: bool,
    /// Filter used when `RUST_LOG` is unset or unparsable.
    pub default_filter: String,
}

impl TelemetryOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            otel_stdout: lookup(OTEL_STDOUT_ENV).is_some_and(|val| is_truthy(&val)),
            default_filter: DEFAULT_FILTER.to_owned(),
        }
    }
}

/// Process-wide logging, tracing and metrics. Keep it alive for the life of
/// the process; dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        Self::init_with(TelemetryOptions::from_env())
    }

    pub fn init_with(options: TelemetryOptions) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let tracer_provider = options.otel_stdout.then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

        tracing_subscriber::registry()
            .with(otel_layer)
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "failed to flush OpenTelemetry spans");
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn truthy_values() {
        for value in ["1", "true", "TRUE", "yes", "On"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "", "enabled"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test_timeout::timeout]
    fn options_follow_the_otel_switch() {
        let off = TelemetryOptions::from_lookup(|_| None);
        assert!(!off.otel_stdout);
        assert_eq!(off.default_filter, "info");

        let on = TelemetryOptions::from_lookup(|key| {
            (key == OTEL_STDOUT_ENV).then(|| "yes".to_owned())
        });
        assert!(on.otel_stdout);
    }
}
