//! Integration tests for logging bootstrap

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bridge_traits::error::Result as SinkResult;
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_runtime::logging::{init_logging, redact_if_sensitive, LogFormat, LoggingConfig};

#[derive(Default)]
struct CapturingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for CapturingSink {
    async fn log(&self, entry: LogEntry) -> SinkResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}

#[test]
fn test_config_builder() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Debug)
        .with_redaction(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(!config.redact_sensitive);
    assert!(config.display_thread_info);
}

#[test]
fn test_redaction_of_credentials_fields() {
    assert_eq!(redact_if_sensitive("access_token", "t"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("library_id", "lib-1"), "lib-1");
}

// Only one global subscriber per process: keep every init assertion in this test.
#[test]
fn test_init_once_and_forward_to_sink() {
    let sink = Arc::new(CapturingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_logger_sink(sink.clone());

    init_logging(config.clone()).unwrap();
    tracing::info!(target: "core_service::service_loop", phase = "Running", "Service phase changed");

    assert!(init_logging(config).is_err());

    let entries = sink.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].fields.get("phase"), Some(&"Running".to_string()));
}
