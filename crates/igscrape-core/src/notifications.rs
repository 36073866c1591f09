//! Notification Scheduler (C12): seeds a short onboarding touchpoint
//! sequence after a user's first profile parse and records coarse app
//! lifecycle activity. Delivery itself goes through a `Notifier`
//! capability the host application supplies, mirroring how `scrape.rs`
//! keeps `CommentsFallback` external to the core — this module never
//! talks to a messaging API directly.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::NotificationConfig;
use crate::models::{NotificationSchedule, UserActivity};
use crate::persistence::{ActivityRepository, NotificationRepository};

pub const ACTIVITY_PROFILE_PARSE: &str = "profile_parse";
pub const ACTIVITY_APP_START: &str = "app_start";
pub const ACTIVITY_APP_EXIT: &str = "app_exit";

const NOTIFICATION_MAX_RETRIES: i64 = 3;

/// Delivery capability the host application supplies.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: &str, notification: &NotificationSchedule) -> crate::Result<()>;
}

/// No-op default notifier: logs what would have been sent.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, user_id: &str, notification: &NotificationSchedule) -> crate::Result<()> {
        info!(
            user_id,
            notification_type = %notification.notification_type,
            "would send notification (no Notifier configured)"
        );
        Ok(())
    }
}

pub struct NotificationScheduler {
    notifications: Arc<dyn NotificationRepository>,
    activity: Arc<dyn ActivityRepository>,
    notifier: Arc<dyn Notifier>,
    config: NotificationConfig,
}

impl NotificationScheduler {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        activity: Arc<dyn ActivityRepository>,
        notifier: Arc<dyn Notifier>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            notifications,
            activity,
            notifier,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, tick_interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick_interval).await;
                if let Err(e) = self.deliver_due().await {
                    error!(error = %e, "notification delivery tick failed");
                }
            }
        })
    }

    /// Logs the activity and, on a user's first-ever profile parse, seeds
    /// the onboarding notification sequence.
    pub async fn register_profile_parse(&self, user_id: &str, profile_username: &str) -> crate::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let is_first = !self.activity.has_any(user_id, ACTIVITY_PROFILE_PARSE).await?;
        self.activity
            .record(UserActivity {
                id: 0,
                user_id: user_id.to_string(),
                activity_type: ACTIVITY_PROFILE_PARSE.to_string(),
                timestamp: Utc::now(),
                extra_data: Some(serde_json::json!({ "profile_username": profile_username })),
            })
            .await?;

        if is_first {
            self.schedule_onboarding_sequence(user_id, profile_username).await?;
        }
        Ok(())
    }

    pub async fn register_app_start(&self, user_id: &str) -> crate::Result<()> {
        self.record_lifecycle(user_id, ACTIVITY_APP_START).await
    }

    pub async fn register_app_exit(&self, user_id: &str) -> crate::Result<()> {
        self.record_lifecycle(user_id, ACTIVITY_APP_EXIT).await
    }

    async fn record_lifecycle(&self, user_id: &str, activity_type: &str) -> crate::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.activity
            .record(UserActivity {
                id: 0,
                user_id: user_id.to_string(),
                activity_type: activity_type.to_string(),
                timestamp: Utc::now(),
                extra_data: None,
            })
            .await?;
        Ok(())
    }

    /// Five touchpoints: a short random nudge (`delay_short_secs` to
    /// `2 * delay_short_secs` out), two fixed mid-sequence check-ins, and
    /// a final one at `delay_long_secs`. Each carries a deep link into the
    /// mini-app.
    async fn schedule_onboarding_sequence(&self, user_id: &str, profile_username: &str) -> crate::Result<()> {
        let now = Utc::now();
        let short_floor = self.config.delay_short_secs.max(1);
        let short_offset = Duration::seconds(rand::thread_rng().gen_range(short_floor..=short_floor * 2) as i64);

        let steps: [(&str, Duration, &str); 5] = [
            ("onboarding_quick_tips", short_offset, "See quick tips"),
            ("onboarding_explore", Duration::hours(2), "Explore your profile"),
            ("onboarding_day_two", Duration::hours(48), "Check what's new"),
            ("onboarding_day_three", Duration::hours(72), "Unlock more insights"),
            (
                "onboarding_final",
                Duration::seconds(self.config.delay_long_secs as i64),
                "Come back for more",
            ),
        ];

        for (notification_type, offset, button_text) in steps {
            self.notifications
                .schedule(NotificationSchedule {
                    id: 0,
                    user_id: user_id.to_string(),
                    notification_type: notification_type.to_string(),
                    scheduled_time: now + offset,
                    sent: false,
                    sent_at: None,
                    profile_username: Some(profile_username.to_string()),
                    message_text: None,
                    button_text: Some(button_text.to_string()),
                    button_url: Some(self.config.mini_app_url.clone()),
                    created_at: now,
                    error_message: None,
                    retry_count: 0,
                })
                .await?;
        }
        Ok(())
    }

    /// Sends every due, unsent, under-retry-limit notification. Send
    /// failures bump `retry_count`; once it reaches the cap the row is
    /// left `sent = false` permanently rather than retried forever.
    pub async fn deliver_due(&self) -> crate::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let due = self.notifications.due(Utc::now()).await?;
        for mut notification in due {
            if notification.sent || notification.retry_count >= NOTIFICATION_MAX_RETRIES {
                continue;
            }

            match self.notifier.send(&notification.user_id, &notification).await {
                Ok(()) => {
                    notification.sent = true;
                    notification.sent_at = Some(Utc::now());
                    notification.error_message = None;
                }
                Err(e) => {
                    warn!(error = %e, notification_id = notification.id, "notification delivery failed, will retry");
                    notification.retry_count += 1;
                    notification.error_message = Some(e.to_string());
                }
            }
            self.notifications.save(notification).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct InMemoryActivity(Mutex<Vec<UserActivity>>);
    #[async_trait]
    impl ActivityRepository for InMemoryActivity {
        async fn record(&self, mut activity: UserActivity) -> crate::Result<UserActivity> {
            let mut guard = self.0.lock().unwrap();
            activity.id = guard.len() as i64 + 1;
            guard.push(activity.clone());
            Ok(activity)
        }
        async fn has_any(&self, user_id: &str, activity_type: &str) -> crate::Result<bool> {
            Ok(self.0.lock().unwrap().iter().any(|a| a.user_id == user_id && a.activity_type == activity_type))
        }
    }

    struct InMemoryNotifications(Mutex<Vec<NotificationSchedule>>);
    #[async_trait]
    impl NotificationRepository for InMemoryNotifications {
        async fn schedule(&self, mut notification: NotificationSchedule) -> crate::Result<NotificationSchedule> {
            let mut guard = self.0.lock().unwrap();
            notification.id = guard.len() as i64 + 1;
            guard.push(notification.clone());
            Ok(notification)
        }
        async fn due(&self, now: chrono::DateTime<Utc>) -> crate::Result<Vec<NotificationSchedule>> {
            Ok(self.0.lock().unwrap().iter().filter(|n| !n.sent && n.scheduled_time <= now).cloned().collect())
        }
        async fn save(&self, notification: NotificationSchedule) -> crate::Result<NotificationSchedule> {
            let mut guard = self.0.lock().unwrap();
            if let Some(existing) = guard.iter_mut().find(|n| n.id == notification.id) {
                *existing = notification.clone();
            }
            Ok(notification)
        }
    }

    struct FailingNotifier;
    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _user_id: &str, _notification: &NotificationSchedule) -> crate::Result<()> {
            Err(crate::Error::notification("simulated delivery failure"))
        }
    }

    fn scheduler(
        notifier: Arc<dyn Notifier>,
        enabled: bool,
    ) -> (NotificationScheduler, Arc<InMemoryActivity>, Arc<InMemoryNotifications>) {
        let activity = Arc::new(InMemoryActivity(Mutex::new(vec![])));
        let notifications = Arc::new(InMemoryNotifications(Mutex::new(vec![])));
        let config = NotificationConfig {
            enabled,
            delay_short_secs: 300,
            delay_long_secs: 345_600,
            mini_app_url: "https://t.me/example_bot/app".to_string(),
        };
        let scheduler = NotificationScheduler::new(notifications.clone(), activity.clone(), notifier, config);
        (scheduler, activity, notifications)
    }

    #[tokio::test]
    async fn first_profile_parse_seeds_five_onboarding_notifications() {
        let (scheduler, _activity, notifications) = scheduler(Arc::new(LoggingNotifier), true);
        scheduler.register_profile_parse("u1", "alice").await.unwrap();
        assert_eq!(notifications.0.lock().unwrap().len(), 5);
        for notification in notifications.0.lock().unwrap().iter() {
            assert_eq!(notification.button_url.as_deref(), Some("https://t.me/example_bot/app"));
        }
    }

    #[tokio::test]
    async fn second_profile_parse_does_not_reseed_the_sequence() {
        let (scheduler, _activity, notifications) = scheduler(Arc::new(LoggingNotifier), true);
        scheduler.register_profile_parse("u1", "alice").await.unwrap();
        scheduler.register_profile_parse("u1", "bob").await.unwrap();
        assert_eq!(notifications.0.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn disabled_config_is_a_complete_no_op() {
        let (scheduler, activity, notifications) = scheduler(Arc::new(LoggingNotifier), false);
        scheduler.register_profile_parse("u1", "alice").await.unwrap();
        scheduler.register_app_start("u1").await.unwrap();
        assert!(notifications.0.lock().unwrap().is_empty());
        assert!(activity.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_retries_on_failure_up_to_the_cap() {
        let (scheduler, _activity, notifications) = scheduler(Arc::new(FailingNotifier), true);
        notifications
            .schedule(NotificationSchedule {
                id: 0,
                user_id: "u1".to_string(),
                notification_type: "onboarding_quick_tips".to_string(),
                scheduled_time: Utc::now() - Duration::minutes(1),
                sent: false,
                sent_at: None,
                profile_username: Some("alice".to_string()),
                message_text: None,
                button_text: Some("See quick tips".to_string()),
                button_url: Some("https://t.me/example_bot/app".to_string()),
                created_at: Utc::now(),
                error_message: None,
                retry_count: 0,
            })
            .await
            .unwrap();

        for _ in 0..3 {
            scheduler.deliver_due().await.unwrap();
        }

        let saved = notifications.0.lock().unwrap()[0].clone();
        assert!(!saved.sent);
        assert_eq!(saved.retry_count, 3);

        scheduler.deliver_due().await.unwrap();
        let saved_again = notifications.0.lock().unwrap()[0].clone();
        assert_eq!(saved_again.retry_count, 3);
    }

    #[tokio::test]
    async fn app_lifecycle_events_are_recorded_without_scheduling_notifications() {
        let (scheduler, activity, notifications) = scheduler(Arc::new(LoggingNotifier), true);
        scheduler.register_app_start("u1").await.unwrap();
        scheduler.register_app_exit("u1").await.unwrap();
        assert_eq!(activity.0.lock().unwrap().len(), 2);
        assert!(notifications.0.lock().unwrap().is_empty());
    }
}
