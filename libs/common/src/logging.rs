//! Logging setup shared by gateway services
//!
//! Console output uses `GatewayFormat`. When a log directory is configured
//! an additional daily-rolling file layer is added.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Event formatter: `timestamp [LEVEL] {span fields} message`
///
/// Link supervision runs inside a span carrying the device serial and
/// transport, so each line from a link is tagged with both:
/// `2026-03-02T00:50:44.809112Z [WARN] {device=PUMP-0001 transport=tcp} transport lost`
struct GatewayFormat;

impl<S, N> FormatEvent<S, N> for GatewayFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            writer,
            "{} [{}] ",
            now.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            event.metadata().level()
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}} ", fields)?;
                    }
                }
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and the filter target
    pub service_name: String,
    /// Base filter level when `RUST_LOG` is not set
    pub level: String,
    /// Directory for daily log files. `None` keeps logging on the console only
    pub log_dir: Option<PathBuf>,
    /// Emit JSON lines to the log file instead of the bracketed format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
        }
    }
}

/// Build the filter directive string.
///
/// `RUST_LOG` wins when present; otherwise dependencies log at info and the
/// service's own target at the configured level.
pub fn filter_directive(config: &LogConfig, rust_log: Option<&str>) -> String {
    match rust_log {
        Some(env) if !env.trim().is_empty() => env.to_string(),
        _ => {
            let target = config.service_name.replace('-', "_");
            format!("info,{}={}", target, config.level)
        },
    }
}

/// Initialize the global subscriber.
///
/// The returned guard flushes the file writer when dropped; hold it for the
/// lifetime of the process.
pub fn init_with_config(
    config: &LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let env_filter = EnvFilter::try_new(filter_directive(config, rust_log.as_deref()))?;

    let console_layer = fmt::layer()
        .with_ansi(false)
        .event_format(GatewayFormat)
        .boxed();

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(GatewayFormat)
                    .boxed()
            };
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::info!("Logging: {} @ console", config.service_name),
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_ansi(false)
                .event_format(GatewayFormat)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_link_span_tags_lines() {
        let serial = "PUMP-0001";
        let transport = "tcp";
        let out = capture(|| {
            let span = tracing::info_span!("link", device = %serial, transport = %transport);
            let _enter = span.enter();
            tracing::warn!("transport lost");
        });
        assert!(
            out.contains("[WARN] {device=PUMP-0001 transport=tcp} transport lost"),
            "{}",
            out
        );
    }

    #[test]
    fn test_line_without_span() {
        let out = capture(|| tracing::info!("Gateway started"));
        assert!(out.ends_with("[INFO] Gateway started\n"), "{}", out);
    }

    #[test]
    fn test_filter_directive_scopes_level_to_service() {
        let config = LogConfig {
            service_name: "gwsrv".to_string(),
            level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(filter_directive(&config, None), "info,gwsrv=debug");
        assert_eq!(filter_directive(&config, Some("  ")), "info,gwsrv=debug");
    }

    #[test]
    fn test_filter_directive_prefers_rust_log() {
        let config = LogConfig::default();
        assert_eq!(
            filter_directive(&config, Some("trace,rumqttc=info")),
            "trace,rumqttc=info"
        );
    }
}
