/*! Logging configuration for the darknode

Exports:
- `LogLevel`: log-level type accepted on the command line
- `get_log_level()`: resolves the default log level (from env or default)
- `init_tracing()`: initializes the global tracing subscriber

Node configuration proper (identity, addresses, policy) lives in
[`crate::node_config`].
*/

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Log level accepted by `--log-level`, matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level to start from when `--log-level` is absent: `RUST_LOG` if it names a
/// bare level, `info` otherwise.
pub fn get_log_level() -> LogLevel {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| LogLevel::from_str(s.trim(), true).ok())
        .unwrap_or_default()
}

/// Directives applied when `RUST_LOG` is unset. libp2p is chatty at debug.
pub fn default_directives(level: LogLevel) -> String {
    format!("{level},darknode={level},libp2p=warn")
}

/// Initialize tracing with the specified log level
///
/// A non-empty `RUST_LOG` wins over `level`. Initialization is a no-op if a
/// global subscriber is already installed.
pub fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
