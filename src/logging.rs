//! Logging Module
//!
//! Initializes the tracing stack: a compact console layer always, plus a
//! daily-rolling file layer when a log directory is configured. The
//! configured level is the default filter; `RUST_LOG` overrides it.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber.
///
/// Tolerant of repeated calls (tests initialize per-process); only the
/// first call installs the subscriber.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
        .compact();

    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                ProxyError::IoError(format!(
                    "failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                ))
            })?;
            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, log_dir, "object-proxy.log");
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        }
        None => None,
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    match result {
        Ok(()) => {
            info!("logging initialized (level: {})", config.log_level);
            if let Some(dir) = &config.log_dir {
                info!("application logs also written to {}", dir.display());
            }
        }
        Err(_) => {
            // Already initialized, likely in tests.
            debug!("tracing subscriber already initialized, skipping");
        }
    }
    Ok(())
}
