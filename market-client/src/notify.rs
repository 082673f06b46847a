use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
    Info,
}

/// Follow-up the UI offers alongside a notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeAction {
    RefillCoins,
    SignIn,
    OpenChat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Sink for user-facing toasts.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);

    fn success(&self, title: &str, message: &str) {
        self.notify(Notice::new(NoticeLevel::Success, title, message));
    }

    fn error(&self, title: &str, message: &str) {
        self.notify(Notice::new(NoticeLevel::Error, title, message));
    }

    fn info(&self, title: &str, message: &str) {
        self.notify(Notice::new(NoticeLevel::Info, title, message));
    }
}

/// Writes notices to the log. Used when no UI sink is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Success | NoticeLevel::Info => {
                tracing::info!("{}: {}", notice.title, notice.message)
            }
            NoticeLevel::Error => tracing::warn!("{}: {}", notice.title, notice.message),
        }
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Notice> {
        self.notices().pop()
    }

    pub fn count(&self, level: NoticeLevel) -> usize {
        self.notices().iter().filter(|n| n.level == level).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        notifier.info("Heads up", "syncing");
        notifier.notify(
            Notice::new(NoticeLevel::Error, "Insufficient coins", "refill to continue")
                .with_action(NoticeAction::RefillCoins),
        );

        let notices = notifier.notices();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].level, NoticeLevel::Info);
        assert_eq!(notifier.last().unwrap().action, Some(NoticeAction::RefillCoins));
        assert_eq!(notifier.count(NoticeLevel::Error), 1);
    }
}
