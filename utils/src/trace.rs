use opentelemetry::sdk::trace as sdktrace;
use tracing::Subscriber;
use tracing_subscriber::{registry::LookupSpan, Layer};

/// Build the `tracing_opentelemetry` layer shared by every binary that
/// embeds the core, so spans emitted by the apply loop, watch hub and
/// proposal router all land in the same trace.
pub fn otlp_layer<S>(tracer: sdktrace::Tracer) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_opentelemetry::layer().with_tracer(tracer)
}

/// A rolling file writer guard, kept alive for the process lifetime so
/// buffered log lines are flushed on shutdown.
pub struct LogWriterGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

/// Build a non-blocking rolling-file writer under `dir`, returning the
/// writer and a guard that must be held for the duration of the process.
pub fn rolling_file_writer(
    dir: impl AsRef<std::path::Path>,
    file_name_prefix: &str,
) -> (tracing_appender::non_blocking::NonBlocking, LogWriterGuard) {
    let file_appender = tracing_appender::rolling::daily(dir, file_name_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    (non_blocking, LogWriterGuard(guard))
}
