//! Observability surface (C9, §6.1): structured emission of events for
//! dashboards, plus the `tracing`/OpenTelemetry init an embedding binary
//! needs before it starts a [`crate::worker::WorkerPool`] or
//! [`crate::api::Api`]. Read-only by construction: nothing here mutates a
//! run.

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::model::{Run, RunStatus};

/// Span name for a workflow decision tick: `decide {workflow_name}`.
pub fn decide_span_name(workflow_name: &str) -> String {
    format!("decide {workflow_name}")
}

/// Span name for a step execution: `step {step_name}`.
pub fn step_span_name(step_name: &str) -> String {
    format!("step {step_name}")
}

/// `GET /health` response body (§6.1).
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub storage_healthy: bool,
}

/// One entry of `GET /workflows` (§6.1): a registered workflow's name. A
/// parameter schema would need a schema-derivation crate the rest of the
/// stack doesn't carry; omitted rather than faked.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetadata {
    pub name: String,
}

/// A compact, dashboard-friendly projection of a [`Run`] — the event log
/// itself remains the durable source of truth; this is only a read model.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub recovery_attempts: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            workflow_name: run.workflow_name.clone(),
            status: run.status,
            recovery_attempts: run.recovery_attempts,
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}

/// Configuration for the process-wide tracing subscriber. The worker binary
/// builds this from the resolved [`WorkerConfig`] rather than reading
/// `OTEL_*` variables on its own, so a run's module/storage choice always
/// shows up on its spans without the caller having to restate it in the
/// environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub otlp_timeout: Duration,
    pub environment: Option<String>,
    pub enable_console: bool,
    pub log_filter: Option<String>,
    /// Workflow module resolved at startup, surfaced as a resource
    /// attribute so traces from two workers running different modules
    /// against the same collector don't need log correlation to tell apart.
    pub module: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "durable-workflow".to_string(),
            service_version: None,
            otlp_endpoint: None,
            otlp_timeout: Duration::from_secs(5),
            environment: None,
            enable_console: true,
            log_filter: None,
            module: None,
        }
    }
}

impl TelemetryConfig {
    /// Reads `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_ENVIRONMENT`, and `RUST_LOG`
    /// with no knowledge of a resolved worker config. Used by tools that
    /// never call [`crate::config::resolve`] (e.g. the CLI's one-shot
    /// subcommands).
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "durable-workflow".to_string()),
            log_filter: std::env::var("RUST_LOG").ok(),
            ..Self::from_env_overlay()
        }
    }

    /// Builds telemetry config from a resolved worker configuration,
    /// letting `OTEL_*` env vars still supply the pieces `WorkerConfig` has
    /// no field for (the collector endpoint, an explicit service version).
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| format!("durable-worker-{}", config.module)),
            log_filter: std::env::var("RUST_LOG").ok(),
            module: Some(config.module.clone()),
            ..Self::from_env_overlay()
        }
    }

    fn from_env_overlay() -> Self {
        Self {
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            ..Self::default()
        }
    }

    fn resource(&self) -> Resource {
        let mut attrs = vec![KeyValue::new("service.name", self.service_name.clone())];
        if let Some(version) = &self.service_version {
            attrs.push(KeyValue::new("service.version", version.clone()));
        }
        if let Some(env) = &self.environment {
            attrs.push(KeyValue::new("deployment.environment", env.clone()));
        }
        if let Some(module) = &self.module {
            attrs.push(KeyValue::new("durable_workflow.module", module.clone()));
        }
        Resource::new(attrs)
    }
}

/// Holds the tracer provider alive; drop it only at process shutdown.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

/// Outcome of trying to stand up the OTLP exporter, reported once the
/// subscriber below is live so the log actually reaches a sink.
enum OtlpOutcome {
    Disabled,
    Enabled(String),
    Failed(String),
}

/// Initializes the global tracing subscriber. Call once, near the top of
/// `main`, and keep the returned guard alive for the process lifetime.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let console_layer = config
        .enable_console
        .then(|| tracing_subscriber::fmt::layer().with_target(true).with_filter(filter));

    let mut provider = None;
    let mut outcome = OtlpOutcome::Disabled;
    let otel_layer = config.otlp_endpoint.as_ref().and_then(|endpoint| {
        match build_otlp_tracer(endpoint, config.otlp_timeout, config.resource()) {
            Ok((tracer_provider, tracer)) => {
                outcome = OtlpOutcome::Enabled(endpoint.clone());
                provider = Some(tracer_provider);
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            Err(e) => {
                outcome = OtlpOutcome::Failed(e.to_string());
                None
            }
        }
    });

    tracing_subscriber::registry().with(console_layer).with(otel_layer).init();

    match outcome {
        OtlpOutcome::Enabled(endpoint) => tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled"),
        OtlpOutcome::Failed(e) => tracing::warn!(error = %e, "failed to initialize OTLP exporter, continuing without it"),
        OtlpOutcome::Disabled => tracing::debug!("OpenTelemetry tracing disabled: no OTLP endpoint configured"),
    }

    TelemetryGuard { provider }
}

fn build_otlp_tracer(
    endpoint: &str,
    timeout: Duration,
    resource: Resource,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(timeout)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("durable-workflow");
    Ok((provider, tracer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_names() {
        assert_eq!(decide_span_name("charge_order"), "decide charge_order");
        assert_eq!(step_span_name("charge"), "step charge");
    }

    #[test]
    fn config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "durable-workflow");
        assert!(config.otlp_endpoint.is_none());
        assert!(config.enable_console);
        assert!(config.module.is_none());
    }

    #[test]
    fn config_from_worker_config_carries_module_as_a_resource_attribute() {
        let worker_config = WorkerConfig {
            module: "billing_workflows".to_string(),
            ..WorkerConfig::default()
        };
        let config = TelemetryConfig::from_worker_config(&worker_config);
        assert_eq!(config.module.as_deref(), Some("billing_workflows"));
        assert_eq!(config.service_name, "durable-worker-billing_workflows");
    }

    #[test]
    fn run_summary_projects_fields() {
        let run = Run::new("wf", serde_json::Value::Null, serde_json::Value::Null);
        let summary = RunSummary::from(&run);
        assert_eq!(summary.workflow_name, "wf");
        assert_eq!(summary.status, RunStatus::Pending);
    }
}
