//! Logging initialization for the sync engine.
//!
//! Services call [`init_logging`] once at startup and use standard `tracing`
//! macros everywhere else. Output goes to stderr in a compact format and,
//! when a log path is configured, to a JSONL file that can be tailed with
//! `tail -f ... | jq`.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included as the root span on every line.
    pub service_name: String,
    /// Default filter when `RUST_LOG` is not set.
    pub default_level: String,
    /// Optional JSONL log file.
    pub log_path: Option<PathBuf>,
    /// Emit human-readable logs on stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "realtime-sync".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
        }
    }
}

/// Append-only JSONL writer, flushed per line so concurrent tails see
/// complete records.
#[derive(Clone)]
struct LogFileWriter {
    inner: Arc<Mutex<BufWriter<File>>>,
}

impl LogFileWriter {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(8192, file))),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock();
        let written = guard.write(buf)?;
        guard.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize logging with the default service name and stderr output.
///
/// # Example
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("engine started");
/// ```
pub fn init_logging(level: &str) {
    init_with_config(LogConfig {
        default_level: level.into(),
        ..Default::default()
    });
}

/// Initialize logging for a named service, optionally mirroring to a JSONL file.
pub fn init_logging_for_service(service_name: &str, level: &str, log_path: Option<PathBuf>) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        log_path,
        also_stderr: true,
    });
}

fn init_with_config(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(io::stderr)
            .compact()
    });

    let file_layer = config.log_path.as_deref().and_then(|path| {
        match LogFileWriter::open(path) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(writer),
            ),
            Err(err) => {
                eprintln!("failed to open log file {}: {}", path.display(), err);
                None
            }
        }
    });

    // A global subscriber may already be installed (tests, embedding hosts).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    tracing::debug!(service = %config.service_name, "logging initialized");
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_level_all_variants() {
        assert_eq!(parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(parse_level("debug"), tracing::Level::DEBUG);
        assert_eq!(parse_level("info"), tracing::Level::INFO);
        assert_eq!(parse_level("warn"), tracing::Level::WARN);
        assert_eq!(parse_level("warning"), tracing::Level::WARN);
        assert_eq!(parse_level("ERROR"), tracing::Level::ERROR);
    }

    #[test]
    fn parse_level_unknown_defaults_to_info() {
        assert_eq!(parse_level(""), tracing::Level::INFO);
        assert_eq!(parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn log_file_writer_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("test.jsonl");

        let mut writer = LogFileWriter::open(&path).unwrap();
        writer.write_all(b"{\"a\":1}\n").unwrap();
        let mut second = writer.make_writer();
        second.write_all(b"{\"b\":2}\n").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn default_log_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "realtime-sync");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(config.also_stderr);
    }
}
