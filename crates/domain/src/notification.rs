//! In-app notifications.

use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An in-app notification for one user.
///
/// `tag` carries the coupon code for distribution notifications; the
/// coupon engine checks for an existing unread tagged row before
/// notifying again, which is what makes re-running a distribution
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub subject: String,
    pub body: String,
    pub tag: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Creates an unread tagged notification.
    pub fn tagged(
        user_id: UserId,
        subject: impl Into<String>,
        body: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subject: subject.into(),
            body: body.into(),
            tag: Some(tag.into()),
            read: false,
            created_at: Utc::now(),
        }
    }
}
