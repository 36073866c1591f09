//! In-process storage adapters for the launcher. The core treats
//! persistence as an abstract port (§1 Non-goal: no database engine is
//! bundled); this binary stands one up with `DashMap` so the process is
//! runnable standalone, the same way the core's own job queue keeps its
//! task-status map in memory rather than behind a store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use igscrape_core::models::{
    InstagramFollower, InstagramProfile, NotificationSchedule, Payment, PaymentStatus, SubscriptionHistory, Tariff,
    User, UserActivity,
};
use igscrape_core::persistence::{
    ActivityRepository, NotificationRepository, PaymentRepository, ProfileRepository, SubscriptionRepository,
    TariffRepository, UserRepository,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

fn next_id(counter: &AtomicI64) -> i64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Default)]
pub struct InMemoryProfiles {
    by_username: DashMap<String, InstagramProfile>,
    followers: DashMap<i64, Vec<InstagramFollower>>,
    next_id: AtomicI64,
}

#[async_trait]
impl ProfileRepository for InMemoryProfiles {
    async fn find_by_username(&self, username: &str) -> igscrape_core::Result<Option<InstagramProfile>> {
        Ok(self.by_username.get(username).map(|p| p.clone()))
    }

    async fn upsert(&self, mut profile: InstagramProfile) -> igscrape_core::Result<InstagramProfile> {
        if profile.id == 0 {
            profile.id = next_id(&self.next_id);
        }
        profile.scrape_count += 1;
        profile.last_scraped = Some(Utc::now());
        self.by_username.insert(profile.username.clone(), profile.clone());
        Ok(profile)
    }

    async fn replace_followers(&self, profile_id: i64, followers: Vec<InstagramFollower>) -> igscrape_core::Result<()> {
        self.followers.insert(profile_id, followers);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUsers {
    by_id: DashMap<String, User>,
}

#[async_trait]
impl UserRepository for InMemoryUsers {
    async fn find(&self, user_id: &str) -> igscrape_core::Result<Option<User>> {
        Ok(self.by_id.get(user_id).map(|u| u.clone()))
    }

    async fn save(&self, user: User) -> igscrape_core::Result<User> {
        self.by_id.insert(user.user_id.clone(), user.clone());
        Ok(user)
    }
}

pub struct InMemoryTariffs {
    by_id: DashMap<i64, Tariff>,
}

impl InMemoryTariffs {
    /// Seeds the closed downgrade chain from §4.10: Exclusive → Daily →
    /// Full → Eco → Demo.
    pub fn seeded() -> Self {
        let by_id = DashMap::new();
        for tariff in default_tariffs() {
            by_id.insert(tariff.id, tariff);
        }
        Self { by_id }
    }
}

#[async_trait]
impl TariffRepository for InMemoryTariffs {
    async fn find(&self, id: i64) -> igscrape_core::Result<Option<Tariff>> {
        Ok(self.by_id.get(&id).map(|t| t.clone()))
    }

    async fn find_by_name(&self, name: &str) -> igscrape_core::Result<Option<Tariff>> {
        Ok(self.by_id.iter().find(|t| t.name == name).map(|t| t.clone()))
    }
}

fn default_tariffs() -> Vec<Tariff> {
    use rust_decimal_macros::dec;

    vec![
        Tariff {
            id: 1,
            name: "Demo".to_string(),
            price: dec!(0),
            duration_days: Some(1),
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo: true,
            auto_renewal: false,
            next_tariff_id: Some(2),
        },
        Tariff {
            id: 2,
            name: "Eco".to_string(),
            price: dec!(299),
            duration_days: Some(10),
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo: false,
            auto_renewal: true,
            next_tariff_id: None,
        },
        Tariff {
            id: 3,
            name: "Full".to_string(),
            price: dec!(599),
            duration_days: Some(10),
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo: false,
            auto_renewal: true,
            next_tariff_id: None,
        },
        Tariff {
            id: 4,
            name: "Daily".to_string(),
            price: dec!(799),
            duration_days: Some(10),
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo: false,
            auto_renewal: true,
            next_tariff_id: None,
        },
        Tariff {
            id: 5,
            name: "Exclusive".to_string(),
            price: dec!(999),
            duration_days: Some(10),
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo: false,
            auto_renewal: true,
            next_tariff_id: None,
        },
    ]
}

#[derive(Default)]
pub struct InMemoryPayments {
    rows: Mutex<Vec<Payment>>,
    next_id: AtomicI64,
}

#[async_trait]
impl PaymentRepository for InMemoryPayments {
    async fn insert(&self, mut payment: Payment) -> igscrape_core::Result<Payment> {
        payment.id = next_id(&self.next_id);
        self.rows.lock().unwrap().push(payment.clone());
        Ok(payment)
    }

    async fn find_completed_with_token(&self, user_id: &str, tariff_id: i64) -> igscrape_core::Result<Option<Payment>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.user_id == user_id
                    && p.tariff_id == tariff_id
                    && p.status == PaymentStatus::Completed
                    && p.card_token.is_some()
            })
            .cloned())
    }

    async fn find_by_transaction_id(&self, transaction_id: &str) -> igscrape_core::Result<Option<Payment>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemorySubscriptions {
    rows: Mutex<Vec<SubscriptionHistory>>,
    next_id: AtomicI64,
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptions {
    async fn find_active_for_user(&self, user_id: &str) -> igscrape_core::Result<Option<SubscriptionHistory>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.user_id == user_id && s.status == igscrape_core::models::SubscriptionStatus::Active)
            .cloned())
    }

    async fn save(&self, mut subscription: SubscriptionHistory) -> igscrape_core::Result<SubscriptionHistory> {
        let mut rows = self.rows.lock().unwrap();
        if subscription.id == 0 {
            drop(rows);
            subscription.id = next_id(&self.next_id);
            rows = self.rows.lock().unwrap();
        }
        if let Some(existing) = rows.iter_mut().find(|s| s.id == subscription.id) {
            *existing = subscription.clone();
        } else {
            rows.push(subscription.clone());
        }
        Ok(subscription)
    }

    async fn due_for_charge(&self, now: DateTime<Utc>) -> igscrape_core::Result<Vec<SubscriptionHistory>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.status == igscrape_core::models::SubscriptionStatus::Active
                    && s.auto_renewal
                    && s.card_token.is_some()
                    && s.next_payment_date.map(|d| d <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn due_for_pause_resume(&self, now: DateTime<Utc>) -> igscrape_core::Result<Vec<SubscriptionHistory>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.status == igscrape_core::models::SubscriptionStatus::Paused
                    && s.card_token.is_some()
                    && s.paused_at
                        .map(|paused| now - paused >= chrono::Duration::days(7))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryNotifications {
    rows: Mutex<Vec<NotificationSchedule>>,
    next_id: AtomicI64,
}

#[async_trait]
impl NotificationRepository for InMemoryNotifications {
    async fn schedule(&self, mut notification: NotificationSchedule) -> igscrape_core::Result<NotificationSchedule> {
        notification.id = next_id(&self.next_id);
        self.rows.lock().unwrap().push(notification.clone());
        Ok(notification)
    }

    async fn due(&self, now: DateTime<Utc>) -> igscrape_core::Result<Vec<NotificationSchedule>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|n| !n.sent && n.scheduled_time <= now)
            .cloned()
            .collect())
    }

    async fn save(&self, notification: NotificationSchedule) -> igscrape_core::Result<NotificationSchedule> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.iter_mut().find(|n| n.id == notification.id) {
            *existing = notification.clone();
        }
        Ok(notification)
    }
}

#[derive(Default)]
pub struct InMemoryActivity {
    rows: Mutex<Vec<UserActivity>>,
    next_id: AtomicI64,
}

#[async_trait]
impl ActivityRepository for InMemoryActivity {
    async fn record(&self, mut activity: UserActivity) -> igscrape_core::Result<UserActivity> {
        activity.id = next_id(&self.next_id);
        self.rows.lock().unwrap().push(activity.clone());
        Ok(activity)
    }

    async fn has_any(&self, user_id: &str, activity_type: &str) -> igscrape_core::Result<bool> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.user_id == user_id && a.activity_type == activity_type))
    }
}
