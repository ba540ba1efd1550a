use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-pier";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Installs the Prometheus recorder and the tracing subscriber. With
    /// `log_file` set, events are also appended to that file without ANSI
    /// colouring so `get_logs` can serve them.
    pub fn init(log_file: Option<&Path>) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let file_layer = match log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(Mutex::new(file)),
                )
            }
            None => None,
        };

        let tracer_provider = env_truthy("BEACH_PIER_OTEL_STDOUT").then(|| {
            SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                        .build(),
                )
                .build()
        });
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_target(false))
            .with(file_layer)
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled (BEACH_PIER_OTEL_STDOUT=1)");
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
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
