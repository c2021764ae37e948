//! Log output and optional OTLP trace export.
//!
//! Logs always go to stdout. Traces are exported over gRPC only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::{anyhow, Result};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
    Resource,
};
use std::{collections::BTreeMap, env::var, sync::OnceLock, time::Duration};
use tonic::{
    metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
use ulid::Ulid;

const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

// Dependencies that are noisy at debug level.
const QUIET_TARGETS: [&str; 5] = [
    "hyper=error",
    "tokio=error",
    "sqlx=warn",
    "opentelemetry_sdk=warn",
    "tower_http=info",
];

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Exporter settings taken from the standard `OTEL_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExporterSettings {
    endpoint: String,
    /// Set for `https` endpoints.
    tls_domain: Option<String>,
    headers: BTreeMap<String, String>,
    instance_id: String,
}

impl ExporterSettings {
    fn from_env(endpoint: &str) -> Self {
        if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL") {
            if protocol != "grpc" {
                debug!("OTEL_EXPORTER_OTLP_PROTOCOL='{protocol}' ignored, exporting over gRPC");
            }
        }

        let endpoint = normalize_endpoint(endpoint);
        let tls_domain = endpoint
            .strip_prefix("https://")
            .and_then(|rest| rest.split('/').next())
            .and_then(|authority| authority.split(':').next())
            .filter(|host| !host.is_empty())
            .map(str::to_string);

        Self {
            endpoint,
            tls_domain,
            headers: var("OTEL_EXPORTER_OTLP_HEADERS")
                .map(|raw| parse_headers(&raw))
                .unwrap_or_default(),
            instance_id: var("OTEL_SERVICE_INSTANCE_ID")
                .unwrap_or_else(|_| format!("{}-{}", env!("CARGO_PKG_NAME"), Ulid::new())),
        }
    }

    fn metadata(&self) -> Result<MetadataMap> {
        let mut meta = MetadataMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let key = MetadataKey::<Ascii>::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| anyhow!("invalid OTLP header name {name}: {e}"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|e| anyhow!("invalid OTLP header value for {name}: {e}"))?;
            meta.insert(key, value);
        }
        Ok(meta)
    }
}

/// `key=value` pairs separated by commas; malformed pairs are skipped.
fn parse_headers(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn init_tracer(settings: &ExporterSettings) -> Result<Tracer> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&settings.endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);

    if let Some(domain) = &settings.tls_domain {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain.clone())
                .with_native_roots(),
        );
    }
    if !settings.headers.is_empty() {
        builder = builder.with_metadata(settings.metadata()?);
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(builder.build()?)
        .with_resource(
            Resource::builder_empty()
                .with_attributes(vec![
                    KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("service.instance.id", settings.instance_id.clone()),
                ])
                .build(),
        )
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

/// `RUST_LOG` wins over the verbosity flag; dependencies stay quiet either way.
fn log_filter(verbosity: Level) -> Result<EnvFilter> {
    QUIET_TARGETS.iter().try_fold(
        EnvFilter::builder()
            .with_default_directive(verbosity.into())
            .from_env_lossy(),
        |filter, directive| -> Result<EnvFilter> { Ok(filter.add_directive(directive.parse()?)) },
    )
}

/// Initialize logging and, when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, the
/// OTLP trace exporter.
///
/// # Errors
/// Returns an error if tracer or subscriber initialization fails
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let filter = log_filter(verbosity_level.unwrap_or(Level::ERROR))?;
    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false);

    if let Ok(endpoint) = var(ENDPOINT_VAR) {
        let tracer = init_tracer(&ExporterSettings::from_env(&endpoint))?;
        let subscriber = Registry::default()
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(fmt_layer).with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Flush and stop the exporter, if one was installed.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("Shutting down tracer provider");
        let _ = provider.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OTEL_VARS: [&str; 3] = [
        "OTEL_EXPORTER_OTLP_HEADERS",
        "OTEL_SERVICE_INSTANCE_ID",
        "OTEL_EXPORTER_OTLP_PROTOCOL",
    ];

    fn unset_otel() -> Vec<(&'static str, Option<&'static str>)> {
        OTEL_VARS.iter().map(|name| (*name, None)).collect()
    }

    #[test]
    fn bare_host_defaults_to_tls() {
        temp_env::with_vars(unset_otel(), || {
            let settings = ExporterSettings::from_env("collector.example.com:4317/");
            assert_eq!(settings.endpoint, "https://collector.example.com:4317");
            assert_eq!(settings.tls_domain.as_deref(), Some("collector.example.com"));
            assert!(settings.headers.is_empty());
            assert!(settings.instance_id.starts_with("credo-"));
        });
    }

    #[test]
    fn plain_http_collector_skips_tls() {
        temp_env::with_vars(unset_otel(), || {
            let settings = ExporterSettings::from_env("http://localhost:4317");
            assert_eq!(settings.endpoint, "http://localhost:4317");
            assert_eq!(settings.tls_domain, None);
        });
    }

    #[test]
    fn headers_and_instance_from_env() {
        temp_env::with_vars(
            [
                (
                    "OTEL_EXPORTER_OTLP_HEADERS",
                    Some("Authorization=Bearer abc, x-tenant = credo ,malformed"),
                ),
                ("OTEL_SERVICE_INSTANCE_ID", Some("credo-eu-1")),
                ("OTEL_EXPORTER_OTLP_PROTOCOL", Some("http/protobuf")),
            ],
            || {
                let settings = ExporterSettings::from_env("https://otel.example.com");
                assert_eq!(settings.instance_id, "credo-eu-1");
                assert_eq!(settings.headers.len(), 2);
                assert_eq!(
                    settings.headers.get("x-tenant").map(String::as_str),
                    Some("credo")
                );

                let meta = settings.metadata().unwrap();
                assert_eq!(
                    meta.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer abc")
                );
            },
        );
    }

    #[test]
    fn invalid_header_value_is_an_error() {
        let settings = ExporterSettings {
            endpoint: "https://otel.example.com".to_string(),
            tls_domain: None,
            headers: BTreeMap::from([("x-key".to_string(), "line\nbreak".to_string())]),
            instance_id: "credo-test".to_string(),
        };
        assert!(settings.metadata().is_err());
    }

    #[test]
    fn dependencies_stay_quiet() {
        temp_env::with_var("RUST_LOG", None::<&str>, || {
            let filter = log_filter(Level::DEBUG).unwrap().to_string().to_lowercase();
            for directive in QUIET_TARGETS {
                assert!(filter.contains(directive), "{filter}");
            }
        });
    }

    #[test]
    fn shutdown_without_exporter_is_a_no_op() {
        shutdown_tracer();
    }
}
