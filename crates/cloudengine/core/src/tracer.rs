use std::env;

#[cfg(feature = "otlp")]
use opentelemetry_otlp as otlp;
use tracing::{dispatcher, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

const KEY: &str = "RUST_LOG";

fn init_layer_env_filter<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    EnvFilter::from_default_env()
}

#[cfg(feature = "otlp")]
fn init_otlp_pipeline() -> otlp::TonicExporterBuilder {
    otlp::new_exporter().tonic()
}

#[cfg(feature = "metrics")]
fn init_layer_otlp_metrics<S>() -> Option<impl Layer<S>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    use opentelemetry_sdk::runtime::Tokio as Runtime;

    match otlp::new_pipeline()
        .metrics(Runtime)
        .with_exporter(init_otlp_pipeline())
        .build()
    {
        Ok(provider) => Some(::tracing_opentelemetry::MetricsLayer::new(provider)),
        Err(error) => {
            eprintln!("failed to init an otlp metrics pipeline: {error}");
            None
        }
    }
}

#[cfg(feature = "trace")]
fn init_layer_otlp_tracer<S>() -> Option<impl Layer<S>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    use opentelemetry_sdk::runtime::Tokio as Runtime;

    match otlp::new_pipeline()
        .tracing()
        .with_exporter(init_otlp_pipeline())
        .install_batch(Runtime)
    {
        Ok(tracer) => Some(::tracing_opentelemetry::OpenTelemetryLayer::new(tracer)),
        Err(error) => {
            eprintln!("failed to init an otlp tracer: {error}");
            None
        }
    }
}

fn init_once_opentelemetry(export: bool) {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // Set default service name
    {
        const SERVICE_NAME_KEY: &str = "OTEL_SERVICE_NAME";
        const SERVICE_NAME_VALUE: &str = env!("CARGO_CRATE_NAME");

        if env::var_os(SERVICE_NAME_KEY).is_none() {
            env::set_var(SERVICE_NAME_KEY, SERVICE_NAME_VALUE);
        }
    }

    let layer = Registry::default()
        .with(init_layer_env_filter())
        .with(::tracing_subscriber::fmt::layer());

    if export {
        #[cfg(feature = "metrics")]
        let layer = layer.with(init_layer_otlp_metrics());
        #[cfg(feature = "trace")]
        let layer = layer.with(init_layer_otlp_tracer());

        layer.try_init().ok();
    } else {
        layer.try_init().ok();
    }
}

/// Maps a verbosity counter (`-d`, `-dd`, ...) into a tracing level.
pub fn init_once_with_level_int(level: u8, export: bool) {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    let debug_level = match level {
        0 => "WARN",
        1 => "INFO",
        2 => "DEBUG",
        _ => "TRACE",
    };
    env::set_var(KEY, debug_level);

    init_once_opentelemetry(export)
}

/// Routes all events to the libtest capture buffer, so that only the logs of
/// failing tests are printed.
pub fn init_once_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("DEBUG"));

    ::tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn shutdown() {
    ::opentelemetry::global::shutdown_tracer_provider();
}
