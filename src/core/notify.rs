use crate::core::traits::notifier::{Notification, NotificationLevel, Notifier};

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        let Notification {
            recipient,
            level,
            title,
            body,
        } = notification;
        match level {
            NotificationLevel::Warn => tracing::warn!(recipient, %title, %body, "notification"),
            NotificationLevel::Critical => {
                tracing::error!(recipient, %title, %body, "critical notification")
            }
        }
    }
}
