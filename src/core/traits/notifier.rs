use crate::core::domain::OwnerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationLevel {
    Warn,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub recipient: OwnerId,
    pub level: NotificationLevel,
    pub title: String,
    pub body: String,
}

/// Delivers messages to checker authors.
#[mockall::automock]
pub trait Notifier: std::fmt::Debug + Send + Sync {
    fn notify(&self, notification: Notification);
}
