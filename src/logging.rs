//! Tracing setup. Logs go to a daily file so stdout stays usable.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const FILE_PREFIX: &str = "fleetq.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Keep the returned guard alive until
/// exit, or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let directory = config.directory();
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(&config.level)?)
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn filter(level: &str) -> Result<EnvFilter> {
  if let Ok(from_env) = EnvFilter::try_from_default_env() {
    return Ok(from_env);
  }
  EnvFilter::try_new(level).map_err(|e| eyre!("Invalid logging.level {:?}: {}", level, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_level_directives() {
    if std::env::var_os("RUST_LOG").is_some() {
      return;
    }
    assert!(filter("info").is_ok());
    assert!(filter("fleetq=debug,reqwest=warn").is_ok());
    assert!(filter("fleetq=[").is_err());
  }
}
