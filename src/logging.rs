//! Logging setup shared by the app binaries.

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Most bytes rendered by [`hexdump`].
pub const HEXDUMP_LIMIT: usize = 64;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Installs the global subscriber and returns the app's root span.
///
/// `RUST_LOG`, when set, takes priority over `level`. Calling this twice is
/// harmless; the second call only builds another span.
pub fn init(name: &str, level: LogLevel) -> tracing::Span {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter().into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    tracing::info_span!("app", name = %name)
}

/// Hex rendering of at most the first [`HEXDUMP_LIMIT`] bytes.
pub fn hexdump(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(HEXDUMP_LIMIT)];
    let mut out = hex::encode(shown);
    if bytes.len() > HEXDUMP_LIMIT {
        out.push_str(&format!("..(+{}B)", bytes.len() - HEXDUMP_LIMIT));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_truncates_long_input() {
        assert_eq!(hexdump(&[0xC0, 0x42]), "c042");
        let long = vec![0xAA; 100];
        let dump = hexdump(&long);
        assert!(dump.starts_with(&"aa".repeat(64)));
        assert!(dump.ends_with("..(+36B)"));
    }

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(LogLevel::default().as_filter(), LevelFilter::INFO);
        assert_eq!(LogLevel::Trace.as_filter(), LevelFilter::TRACE);
    }
}
