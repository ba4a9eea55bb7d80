use crate::{log_error, log_info, log_warn};
use serde::Serialize;
use tokio::sync::broadcast;

const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Operator-facing message emitted by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

/// Fan-out of operator notices. Every notice is also logged.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn info(&self, title: &str, message: impl Into<String>) {
        self.emit(NoticeLevel::Info, title, message.into());
    }

    pub fn warn(&self, title: &str, message: impl Into<String>) {
        self.emit(NoticeLevel::Warning, title, message.into());
    }

    pub fn error(&self, title: &str, message: impl Into<String>) {
        self.emit(NoticeLevel::Error, title, message.into());
    }

    fn emit(&self, level: NoticeLevel, title: &str, message: String) {
        match level {
            NoticeLevel::Info => log_info!("{}: {}", title, message),
            NoticeLevel::Warning => log_warn!("{}: {}", title, message),
            NoticeLevel::Error => log_error!("{}: {}", title, message),
        }
        // No subscribers is fine; the log line above is the record.
        let _ = self.sender.send(Notice {
            level,
            title: title.to_string(),
            message,
        });
    }
}
