//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! ```no_run
//! use flowgate_types::config::LoggingSettings;
//!
//! // Human-readable logs at the configured level, one step more verbose.
//! flowgate_observe::init_tracing(&LoggingSettings::default(), 1).unwrap();
//! ```

use std::sync::OnceLock;

use flowgate_types::config::LoggingSettings;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Kept so buffered spans can be flushed on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global subscriber.
///
/// - `RUST_LOG` wins when set. Otherwise `settings.filter` is used, raised
///   to `debug` (one `-v`) or `trace` (two or more) for the flowgate crates.
/// - `settings.json` switches the fmt layer to JSON lines.
/// - `settings.otel` bridges spans to OpenTelemetry with a stdout exporter.
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the filter
/// directive does not parse.
pub fn init_tracing(settings: &LoggingSettings, verbosity: u8) -> Result<(), Box<dyn std::error::Error>> {
    let directive = filter_directive(
        &settings.filter,
        verbosity,
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let env_filter = EnvFilter::try_new(&directive)?;

    let fmt_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let otel_layer = if settings.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("flowgate");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

/// Flush pending spans and shut the tracer provider down. No-op when
/// OpenTelemetry was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

fn filter_directive(configured: &str, verbosity: u8, env: Option<String>) -> String {
    if let Some(env) = env.filter(|e| !e.trim().is_empty()) {
        return env;
    }
    let base = if configured.trim().is_empty() { "info" } else { configured.trim() };
    match verbosity {
        0 => base.to_string(),
        1 => format!("{base},flowgate=debug"),
        _ => format!("{base},flowgate=trace"),
    }
}
