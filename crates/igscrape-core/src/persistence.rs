//! Persistence ports (§1 Non-goal: no concrete database is bundled).
//! Every long-running component here depends on these traits, not on a
//! storage engine; a real deployment wires in whatever backs these with
//! actual tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    InstagramFollower, InstagramProfile, NotificationSchedule, Payment, SubscriptionHistory, Tariff, User, UserActivity,
};

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> crate::Result<Option<InstagramProfile>>;
    async fn upsert(&self, profile: InstagramProfile) -> crate::Result<InstagramProfile>;
    async fn replace_followers(&self, profile_id: i64, followers: Vec<InstagramFollower>) -> crate::Result<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find(&self, user_id: &str) -> crate::Result<Option<User>>;
    async fn save(&self, user: User) -> crate::Result<User>;
}

#[async_trait]
pub trait TariffRepository: Send + Sync {
    async fn find(&self, id: i64) -> crate::Result<Option<Tariff>>;
    async fn find_by_name(&self, name: &str) -> crate::Result<Option<Tariff>>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert(&self, payment: Payment) -> crate::Result<Payment>;
    async fn find_completed_with_token(&self, user_id: &str, tariff_id: i64) -> crate::Result<Option<Payment>>;
    /// Natural-key lookup used to dedup webhook replays (§7 idempotency).
    async fn find_by_transaction_id(&self, transaction_id: &str) -> crate::Result<Option<Payment>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_active_for_user(&self, user_id: &str) -> crate::Result<Option<SubscriptionHistory>>;
    async fn save(&self, subscription: SubscriptionHistory) -> crate::Result<SubscriptionHistory>;
    async fn due_for_charge(&self, now: DateTime<Utc>) -> crate::Result<Vec<SubscriptionHistory>>;
    async fn due_for_pause_resume(&self, now: DateTime<Utc>) -> crate::Result<Vec<SubscriptionHistory>>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn schedule(&self, notification: NotificationSchedule) -> crate::Result<NotificationSchedule>;
    async fn due(&self, now: DateTime<Utc>) -> crate::Result<Vec<NotificationSchedule>>;
    async fn save(&self, notification: NotificationSchedule) -> crate::Result<NotificationSchedule>;
}

#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn record(&self, activity: UserActivity) -> crate::Result<UserActivity>;
    /// Whether `user_id` has ever logged an activity of this type, used to
    /// decide whether a profile-parse notification burst has already fired.
    async fn has_any(&self, user_id: &str, activity_type: &str) -> crate::Result<bool>;
}
