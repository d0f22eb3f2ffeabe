//! tracing setup: env-selected filter and format, non-blocking file writer.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::session::now_secs;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Where the active filter directive came from
#[derive(Debug, PartialEq, Eq)]
enum FilterSource {
    Workflowdock(String),
    RustLog(String),
    Default,
}

impl FilterSource {
    /// `WORKFLOWDOCK_LOG_FILTER` wins over `RUST_LOG`; unparsable values fall through.
    fn pick(workflowdock: Option<String>, rust_log: Option<String>) -> Self {
        let valid = |v: &String| EnvFilter::try_new(v).is_ok();
        match (workflowdock, rust_log) {
            (Some(v), _) if valid(&v) => FilterSource::Workflowdock(v),
            (_, Some(v)) if valid(&v) => FilterSource::RustLog(v),
            _ => FilterSource::Default,
        }
    }

    fn directive(&self) -> &str {
        match self {
            FilterSource::Workflowdock(v) | FilterSource::RustLog(v) => v,
            FilterSource::Default => DEFAULT_FILTER,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FilterSource::Workflowdock(_) => "WORKFLOWDOCK_LOG_FILTER",
            FilterSource::RustLog(_) => "RUST_LOG",
            FilterSource::Default => "default",
        }
    }
}

pub fn init_logging(log_dir: &Path, file_name: &str) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;

    let source = FilterSource::pick(
        std::env::var("WORKFLOWDOCK_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let format = LogFormat::parse(std::env::var("WORKFLOWDOCK_LOG_FORMAT").ok().as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));
    let registry = tracing_subscriber::registry().with(EnvFilter::try_new(source.directive())?);

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    let run_id = format!("{}-{}", std::process::id(), now_secs());
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_dir.join(file_name).display(),
        format = format.as_str(),
        filter = source.directive(),
        filter_source = source.label(),
        run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_prefers_own_variable_and_skips_garbage() {
        assert_eq!(
            FilterSource::pick(Some("debug".into()), Some("warn".into())),
            FilterSource::Workflowdock("debug".into())
        );
        assert_eq!(
            FilterSource::pick(Some("workflowdock=loud".into()), Some("warn".into())),
            FilterSource::RustLog("warn".into())
        );
        let fallback = FilterSource::pick(None, None);
        assert_eq!(fallback.directive(), DEFAULT_FILTER);
        assert_eq!(fallback.label(), "default");
    }

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse(Some("PRETTY")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some("xml")), LogFormat::Json);
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
    }
}
