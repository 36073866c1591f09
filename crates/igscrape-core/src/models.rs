//! §3 data model: the entities the core reads and writes through the
//! abstract persistence layer. Persistence itself is out of scope (§1);
//! these are the row shapes a real storage engine would map to tables.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub telegram_username: Option<String>,
    pub is_paid: bool,
    pub current_tariff_id: Option<i64>,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub total_requests: i64,
    pub remaining_requests: Option<i64>,
}

impl User {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            created_at: now,
            first_name: None,
            last_name: None,
            telegram_username: None,
            is_paid: false,
            current_tariff_id: None,
            subscription_start: None,
            subscription_end: None,
            is_active: true,
            total_requests: 0,
            remaining_requests: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tariff {
    pub id: i64,
    pub name: String,
    pub price: Decimal,
    pub duration_days: Option<i64>,
    pub requests_count: Option<i64>,
    pub subtitle: Option<String>,
    pub features: Option<serde_json::Value>,
    pub is_active: bool,
    pub is_demo: bool,
    pub auto_renewal: bool,
    pub next_tariff_id: Option<i64>,
}

impl Tariff {
    /// Invariant from §3: exactly one of {duration, quota} is meaningful,
    /// but both may be null for bespoke entries.
    pub fn is_quota_tariff(&self) -> bool {
        self.requests_count.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Processing => "processing",
            ParseStatus::Completed => "completed",
            ParseStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramProfile {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub external_url: Option<String>,
    pub followers_count: i64,
    pub following_count: i64,
    pub posts_count: i64,
    pub is_verified: bool,
    pub is_private: bool,
    pub is_business: bool,
    pub analytics_data: Option<serde_json::Value>,
    pub posts_data: Option<serde_json::Value>,
    pub comments_data: Option<serde_json::Value>,
    pub profile_pic_url: Option<String>,
    pub profile_pic_url_local: Option<String>,
    pub last_scraped: Option<DateTime<Utc>>,
    pub scrape_count: i64,
    pub is_data_fresh: bool,
    pub parsing_status: ParseStatus,
    pub parse_task_id: Option<String>,
    pub followers_parsed_at: Option<DateTime<Utc>>,
    pub followings_parsed_at: Option<DateTime<Utc>>,
}

impl InstagramProfile {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: 0,
            username: username.into(),
            full_name: None,
            biography: None,
            external_url: None,
            followers_count: 0,
            following_count: 0,
            posts_count: 0,
            is_verified: false,
            is_private: false,
            is_business: false,
            analytics_data: None,
            posts_data: None,
            comments_data: None,
            profile_pic_url: None,
            profile_pic_url_local: None,
            last_scraped: None,
            scrape_count: 0,
            is_data_fresh: false,
            parsing_status: ParseStatus::Pending,
            parse_task_id: None,
            followers_parsed_at: None,
            followings_parsed_at: None,
        }
    }

    /// `fresh = last_scraped ≠ null ∧ (now − last_scraped) < TTL` (§4.8).
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        match self.last_scraped {
            Some(last) => now - last < ttl,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramFollower {
    pub id: i64,
    pub profile_id: i64,
    pub follower_pk: String,
    pub username: String,
    pub full_name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub profile_pic_url_local: Option<String>,
    pub is_verified: bool,
    pub is_private: bool,
    pub has_anonymous_profile_picture: bool,
    pub fbid_v2: Option<String>,
    pub third_party_downloads_enabled: bool,
    pub latest_reel_media: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub user_id: String,
    pub tariff_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub card_token: Option<String>,
    pub card_first_six: Option<String>,
    pub card_last_four: Option<String>,
    pub card_type: Option<String>,
    pub is_recurrent: bool,
    pub subscription_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionHistory {
    pub id: i64,
    pub user_id: String,
    pub tariff_id: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: SubscriptionStatus,
    pub pause_days_used: i64,
    pub gateway_subscription_id: Option<String>,
    pub card_token: Option<String>,
    pub auto_renewal: bool,
    pub failed_attempts: i64,
    pub last_payment_attempt: Option<DateTime<Utc>>,
    /// Dedicated field (§9 open question) instead of overloading
    /// `last_payment_attempt` as "pause start".
    pub paused_at: Option<DateTime<Utc>>,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub original_tariff_id: Option<i64>,
    pub downgrade_attempts: i64,
}

impl SubscriptionHistory {
    /// The tariff a due charge should bill: `original_tariff_id` when set,
    /// else the subscription's own `tariff_id` (§4.11).
    pub fn billing_tariff_id(&self) -> i64 {
        self.original_tariff_id.unwrap_or(self.tariff_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivity {
    pub id: i64,
    pub user_id: String,
    pub activity_type: String,
    pub timestamp: DateTime<Utc>,
    pub extra_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSchedule {
    pub id: i64,
    pub user_id: String,
    pub notification_type: String,
    pub scheduled_time: DateTime<Utc>,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub profile_username: Option<String>,
    pub message_text: Option<String>,
    pub button_text: Option<String>,
    pub button_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

/// In-memory task record (C6/C14); never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub status: TaskState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub followers: Option<Vec<InstagramFollower>>,
    pub followings: Option<Vec<InstagramFollower>>,
    pub mutuals: Option<Vec<InstagramFollower>>,
    pub comments: Option<serde_json::Value>,
}

impl TaskStatusRecord {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: TaskState::Pending,
            created_at: now,
            completed_at: None,
            error: None,
            followers: None,
            followings: None,
            mutuals: None,
            comments: None,
        }
    }
}

/// Closed downgrade map from §4.10. `None` means the chain terminates.
pub fn downgrade_target(tariff_name: &str) -> Option<&'static str> {
    match tariff_name {
        "Exclusive" => Some("Daily"),
        "Daily" => Some("Full"),
        "Full" => Some("Eco"),
        "Eco" => Some("Demo"),
        "Demo" => None,
        _ => None,
    }
}

pub type ExtraMap = HashMap<String, serde_json::Value>;
