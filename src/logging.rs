use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

// Keeps the file writer flushing for the lifetime of the process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter_for(level: Level) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        // Requested level for this crate, WARN for dependencies
        EnvFilter::builder().parse(format!(
            "warn,mcp_dash={}",
            level.as_str().to_lowercase()
        ))
    })
}

/// Initialize logging to the console and to a daily rolling JSON file
pub fn init(level: Level) -> InitResult {
    let log_dir = log_directory().ok_or("Failed to find home directory for log files")?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "mcp-dash.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter_for(level)?)
        .with(
            fmt::layer() // Console layer
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer() // File layer
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    tracing::info!("Logging initialized, writing files to {}", log_dir.display());
    Ok(())
}

/// Initialize console-only logging
pub fn init_simple(level: Level) -> InitResult {
    tracing_subscriber::registry()
        .with(filter_for(level)?)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    tracing::info!("Simple logging initialized at level {}", level);
    Ok(())
}

/// Directory where log files are stored
pub fn log_directory() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mcp-dash").join("logs"))
}
