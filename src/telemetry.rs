use std::io::IsTerminal;

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LOG_ENV;

/// Installs the stderr subscriber. `TALLYSYNC_LOG` takes precedence over `-v`.
/// Calling it twice is harmless; the second call is ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .compact()
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}
