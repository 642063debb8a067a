use std::sync::OnceLock;

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::bluetooth::EVENT_CHANNEL_CAPACITY;

static LOGGER: OnceLock<EventLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes records to stderr and publishes them for a host application.
pub struct EventLogger {
    level: Level,
    log_tx: broadcast::Sender<LogMessage>,
}

impl EventLogger {
    pub fn new(level: Level) -> Self {
        let (log_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { level, log_tx }
    }

    /// Installs the logger process-wide. Fails if any logger is already set.
    pub fn init(level: Level) -> Result<&'static EventLogger, SetLoggerError> {
        let logger = LOGGER.get_or_init(|| EventLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(logger.level.to_level_filter()))?;
        Ok(logger)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.log_tx.subscribe()
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // No subscribers is not an error
        let _ = self.log_tx.send(log_message);
    }
}

impl log::Log for EventLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn publishes_enabled_records() {
        let logger = EventLogger::new(Level::Info);
        let mut messages = logger.subscribe();

        logger.log(&Record::builder().level(Level::Warn).args(format_args!("link lost")).build());
        logger.log(&Record::builder().level(Level::Debug).args(format_args!("hidden")).build());

        let message = messages.try_recv().unwrap();
        assert_eq!(message.level, "WARN");
        assert_eq!(message.message, "link lost");
        assert!(chrono::DateTime::parse_from_rfc3339(&message.timestamp).is_ok());
        assert!(messages.try_recv().is_err());
    }
}
