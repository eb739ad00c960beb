use std::fs;
use std::path::Path;

use time::UtcOffset;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{reload::Handle, EnvFilter};

pub const LOGGING_ENV_FILE: &str = "logging.env";

pub fn init_logging() -> Result<LoggingHandle<EnvFilter, impl Subscriber>, String> {
    // Library code logs through the `log` facade.
    tracing_log::LogTracer::init().map_err(|err| format!("failed to bridge log records: {}", err))?;
    init_tracing_logger()
}

#[derive(Debug)]
pub enum ReloadLogLevelError {
    InvalidFilter(String),
    ReloadFailed(tracing_subscriber::reload::Error),
}

pub fn reload_log_level(
    logging_handle: &LoggingHandle<EnvFilter, impl Subscriber>,
) -> Result<String, ReloadLogLevelError> {
    let new_filter = read_env_filter(Path::new(LOGGING_ENV_FILE)).map_err(ReloadLogLevelError::InvalidFilter)?;

    let filter_string = format!("{}", new_filter);

    logging_handle
        .handle
        .reload(new_filter)
        .map_err(ReloadLogLevelError::ReloadFailed)?;

    Ok(filter_string)
}

fn init_tracing_logger() -> Result<LoggingHandle<EnvFilter, impl Subscriber>, String> {
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        UtcOffset::current_local_offset().unwrap_or_else(|err| {
            eprintln!("Failed to get timezone: {}", err);
            UtcOffset::UTC
        }),
        time::macros::format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3] +[offset_hour]"
        ),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let env_filter = read_env_filter(Path::new(LOGGING_ENV_FILE)).unwrap_or_else(|err| {
        eprintln!(
            "Failed to read env filter, using environment variable or default: {}",
            err
        );
        EnvFilter::builder()
            .with_default_directive(Level::DEBUG.into())
            .from_env_lossy()
    });

    println!("Env Filter: {}", env_filter);

    let builder = tracing_subscriber::fmt()
        .with_timer(timer)
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_filter_reloading();

    let handle = builder.reload_handle();

    tracing::subscriber::set_global_default(builder.finish())
        .map_err(|err| format!("failed to initialize logger: {}", err))?;

    Ok(LoggingHandle {
        _non_blocking_guard: guard,
        handle,
    })
}

/// First line of `path`, parsed as an `EnvFilter` directive list.
fn read_env_filter(path: &Path) -> Result<EnvFilter, String> {
    let s = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read file {}: {}", path.display(), err))?;
    let first_line = s
        .lines()
        .next()
        .ok_or_else(|| format!("{} is empty", path.display()))?;
    EnvFilter::builder()
        .with_default_directive(Level::DEBUG.into())
        .parse(first_line)
        .map_err(|err| format!("Failed to parse env filter: {}", err))
}

pub struct LoggingHandle<L, S> {
    _non_blocking_guard: WorkerGuard,
    handle: Handle<L, S>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_line_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logging.env");
        fs::write(&path, "info,rtu_outputs::output=trace\nthis line is ignored\n").unwrap();
        let filter = read_env_filter(&path).unwrap();
        let directives = filter.to_string();
        assert!(directives.contains("rtu_outputs::output=trace"));
        assert!(!directives.contains("ignored"));
    }

    #[test]
    fn missing_or_empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logging.env");
        assert!(read_env_filter(&path).is_err());
        fs::write(&path, "").unwrap();
        assert!(read_env_filter(&path).is_err());
    }
}
