//! Tracing subscriber setup

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transfers_config::LoggingConfig;

/// Verbosity requested on the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbosity {
    /// `--debug`
    pub debug: bool,
    /// `--verbose`
    pub verbose: bool,
    /// `--quiet`
    pub quiet: bool,
}

impl Verbosity {
    /// Level implied by the flags, falling back to the configured one
    pub fn level<'a>(&self, configured: &'a str) -> &'a str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else if self.quiet {
            "error"
        } else {
            configured
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over both the flags and the
/// config. Console output goes to stderr so stdout stays parseable.
///
/// The returned guard flushes the log file and must live until exit.
pub fn init_logging(
    config: &LoggingConfig,
    verbosity: Verbosity,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = verbosity.level(&config.level);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let json = config.json_format;
    let console_text = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let console_json = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    let (file_layer, guard) = match config.log_dir.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "transfers.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}
