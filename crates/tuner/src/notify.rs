use log::info;
use serde::{Deserialize, Serialize};

/// Side-effect sink for per-task and end-of-run announcements.
///
/// The orchestrator never branches on which notifier is available; the
/// implementation is selected once from configuration.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Configuration-selected notifier strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    #[default]
    Log,
    None,
}

impl NotifierKind {
    pub fn build(self) -> Box<dyn Notifier> {
        match self {
            NotifierKind::Log => Box::new(LogNotifier),
            NotifierKind::None => Box::new(NoopNotifier),
        }
    }
}

/// Default notifier: a banner on the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!("{}", "=".repeat(50));
        info!("📢 {}", title);
        for line in message.lines() {
            info!("   {}", line);
        }
        info!("{}", "=".repeat(50));
    }
}

/// Notifier that swallows everything.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _title: &str, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_deserializes_from_lowercase() {
        let kind: NotifierKind = serde_yaml::from_str("log").unwrap();
        assert_eq!(kind, NotifierKind::Log);
        let kind: NotifierKind = serde_yaml::from_str("none").unwrap();
        assert_eq!(kind, NotifierKind::None);
    }

    #[test]
    fn default_kind_is_log() {
        assert_eq!(NotifierKind::default(), NotifierKind::Log);
    }
}
