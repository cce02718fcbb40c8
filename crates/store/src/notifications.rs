use async_trait::async_trait;
use common::UserId;
use domain::Notification;

use crate::Result;

/// In-app notification persistence.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Stores a notification.
    async fn push(&self, notification: Notification) -> Result<()>;

    /// True if the user already has an unread notification with this
    /// tag. The coupon engine checks this before notifying, which is
    /// what makes re-running a distribution idempotent.
    async fn has_unread_tagged(&self, user_id: UserId, tag: &str) -> Result<bool>;

    /// All notifications for a user, newest first.
    async fn notifications_for(&self, user_id: UserId) -> Result<Vec<Notification>>;
}
