//! Recurring Payments Scheduler (C11): a background tick loop that
//! resumes subscriptions whose pause window has elapsed and charges
//! subscriptions due for renewal, in that order within the same tick
//! (§4.11) so a freshly resumed subscription can be charged immediately
//! rather than waiting for the next tick.
//!
//! The post-downgrade retry in `process_due` is an explicit bounded loop,
//! not recursive `async fn` self-calls — recursive async functions need
//! heap-boxed futures in Rust, and a plain loop with a depth counter
//! gives the same bound without that.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::models::{SubscriptionHistory, SubscriptionStatus};
use crate::payment::{charge_recurrent, recurring_period, PaymentService};
use crate::payment_gateway::{CreateSubscriptionRequest, PaymentGatewayClient};
use crate::persistence::{SubscriptionRepository, TariffRepository, UserRepository};

const MAX_DOWNGRADE_DEPTH: u32 = 5;
const RECURRING_CURRENCY: &str = "RUB";
const RECURRING_PERIOD_DAYS: i64 = 10;

pub struct RecurringPaymentsScheduler {
    subscriptions: Arc<dyn SubscriptionRepository>,
    tariffs: Arc<dyn TariffRepository>,
    users: Arc<dyn UserRepository>,
    gateway: Arc<PaymentGatewayClient>,
    payments: Arc<PaymentService>,
    tick_interval: std::time::Duration,
}

impl RecurringPaymentsScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        tariffs: Arc<dyn TariffRepository>,
        users: Arc<dyn UserRepository>,
        gateway: Arc<PaymentGatewayClient>,
        payments: Arc<PaymentService>,
        tick_interval: std::time::Duration,
    ) -> Self {
        Self {
            subscriptions,
            tariffs,
            users,
            gateway,
            payments,
            tick_interval,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.tick_interval).await;
                if let Err(e) = self.tick().await {
                    error!(error = %e, "recurring payments tick failed");
                }
            }
        })
    }

    pub async fn tick(&self) -> crate::Result<()> {
        let now = Utc::now();

        for subscription in self.subscriptions.due_for_pause_resume(now).await? {
            if let Err(e) = self.resume_due_pause(subscription).await {
                warn!(error = %e, "failed to auto-resume a paused subscription");
            }
        }

        for subscription in self.subscriptions.due_for_charge(Utc::now()).await? {
            if let Err(e) = self.process_due(subscription).await {
                warn!(error = %e, "failed to process a due subscription charge");
            }
        }

        Ok(())
    }

    /// A paused subscription past its pause window gets a fresh gateway
    /// subscription starting immediately, then falls straight into the
    /// charge pass below instead of waiting for the next tick.
    async fn resume_due_pause(&self, mut subscription: SubscriptionHistory) -> crate::Result<()> {
        let token = subscription
            .card_token
            .clone()
            .ok_or_else(|| Error::validation("paused subscription has no card token, cannot auto-resume"))?;
        let tariff = self
            .tariffs
            .find(subscription.billing_tariff_id())
            .await?
            .ok_or_else(|| Error::not_found(format!("tariff {}", subscription.billing_tariff_id())))?;

        let now = Utc::now();
        let response = self
            .gateway
            .create_subscription(&CreateSubscriptionRequest {
                token,
                account_id: subscription.user_id.clone(),
                description: format!("{} resumed subscription", tariff.name),
                amount: tariff.price,
                currency: RECURRING_CURRENCY.to_string(),
                start_date: now,
                interval: "Day".to_string(),
                period: RECURRING_PERIOD_DAYS as u32,
            })
            .await?;

        subscription.status = SubscriptionStatus::Active;
        subscription.auto_renewal = true;
        subscription.paused_at = None;
        if response.success {
            subscription.gateway_subscription_id = response.model.map(|m| m.id);
        }
        subscription.next_payment_date = Some(now);
        let subscription = self.subscriptions.save(subscription).await?;

        self.process_due(subscription).await
    }

    async fn process_due(&self, mut subscription: SubscriptionHistory) -> crate::Result<()> {
        let mut depth = 0u32;
        loop {
            if depth >= MAX_DOWNGRADE_DEPTH {
                warn!(
                    subscription_id = subscription.id,
                    "exceeded max downgrade depth in a single tick, disabling auto-renewal and cancelling"
                );
                self.best_effort_cancel_gateway(&subscription).await;
                subscription.status = SubscriptionStatus::Cancelled;
                subscription.auto_renewal = false;
                let subscription = self.subscriptions.save(subscription).await?;
                if let Some(mut user) = self.users.find(&subscription.user_id).await? {
                    user.is_paid = false;
                    user.current_tariff_id = None;
                    self.users.save(user).await?;
                }
                return Ok(());
            }

            let tariff = self
                .tariffs
                .find(subscription.billing_tariff_id())
                .await?
                .ok_or_else(|| Error::not_found(format!("tariff {}", subscription.billing_tariff_id())))?;

            let charged = charge_recurrent(&self.gateway, &subscription, &tariff).await.unwrap_or(false);

            if charged {
                let now = Utc::now();
                subscription.failed_attempts = 0;
                subscription.last_payment_attempt = Some(now);
                subscription.next_payment_date = Some(now + recurring_period());
                if let Some(original) = subscription.original_tariff_id.take() {
                    subscription.tariff_id = original;
                }
                self.subscriptions.save(subscription.clone()).await?;

                if let Some(mut user) = self.users.find(&subscription.user_id).await? {
                    let base = user.subscription_end.filter(|end| *end > now).unwrap_or(now);
                    user.subscription_end = Some(base + Duration::days(tariff.duration_days.unwrap_or(0)));
                    self.users.save(user).await?;
                }

                info!(subscription_id = subscription.id, "recurring charge succeeded");
                return Ok(());
            }

            subscription.failed_attempts += 1;
            subscription.last_payment_attempt = Some(Utc::now());

            if subscription.failed_attempts < 3 {
                subscription.next_payment_date = Some(Utc::now() + Duration::days(1));
                self.subscriptions.save(subscription).await?;
                return Ok(());
            }

            match self.payments.downgrade_cascade(&subscription).await? {
                Some(downgraded) => {
                    subscription = downgraded;
                    depth += 1;
                }
                None => return Ok(()),
            }
        }
    }

    async fn best_effort_cancel_gateway(&self, subscription: &SubscriptionHistory) {
        if let Some(gateway_id) = &subscription.gateway_subscription_id {
            if let Err(e) = self.gateway.cancel_subscription(gateway_id).await {
                warn!(error = %e, subscription_id = subscription.id, "failed to cancel gateway subscription at max downgrade depth");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaymentGatewayConfig;
    use crate::models::{Payment, Tariff, User};
    use crate::persistence::PaymentRepository;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use wiremock::matchers::{method as wm_method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct InMemoryUsers(Mutex<Vec<User>>);
    #[async_trait]
    impl UserRepository for InMemoryUsers {
        async fn find(&self, user_id: &str) -> crate::Result<Option<User>> {
            Ok(self.0.lock().unwrap().iter().find(|u| u.user_id == user_id).cloned())
        }
        async fn save(&self, user: User) -> crate::Result<User> {
            let mut guard = self.0.lock().unwrap();
            if let Some(existing) = guard.iter_mut().find(|u| u.user_id == user.user_id) {
                *existing = user.clone();
            } else {
                guard.push(user.clone());
            }
            Ok(user)
        }
    }

    struct InMemoryTariffs(Vec<Tariff>);
    #[async_trait]
    impl TariffRepository for InMemoryTariffs {
        async fn find(&self, id: i64) -> crate::Result<Option<Tariff>> {
            Ok(self.0.iter().find(|t| t.id == id).cloned())
        }
        async fn find_by_name(&self, name: &str) -> crate::Result<Option<Tariff>> {
            Ok(self.0.iter().find(|t| t.name == name).cloned())
        }
    }

    struct InMemoryPayments(Mutex<Vec<Payment>>);
    #[async_trait]
    impl PaymentRepository for InMemoryPayments {
        async fn insert(&self, mut payment: Payment) -> crate::Result<Payment> {
            let mut guard = self.0.lock().unwrap();
            payment.id = guard.len() as i64 + 1;
            guard.push(payment.clone());
            Ok(payment)
        }
        async fn find_completed_with_token(&self, _user_id: &str, _tariff_id: i64) -> crate::Result<Option<Payment>> {
            Ok(None)
        }
        async fn find_by_transaction_id(&self, _transaction_id: &str) -> crate::Result<Option<Payment>> {
            Ok(None)
        }
    }

    struct InMemorySubscriptions(Mutex<Vec<SubscriptionHistory>>);
    #[async_trait]
    impl SubscriptionRepository for InMemorySubscriptions {
        async fn find_active_for_user(&self, user_id: &str) -> crate::Result<Option<SubscriptionHistory>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.user_id == user_id && matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::Paused))
                .cloned())
        }
        async fn save(&self, subscription: SubscriptionHistory) -> crate::Result<SubscriptionHistory> {
            let mut guard = self.0.lock().unwrap();
            if let Some(existing) = guard.iter_mut().find(|s| s.id == subscription.id) {
                *existing = subscription.clone();
            } else {
                guard.push(subscription.clone());
            }
            Ok(subscription)
        }
        async fn due_for_charge(&self, now: chrono::DateTime<Utc>) -> crate::Result<Vec<SubscriptionHistory>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|s| {
                    s.status == SubscriptionStatus::Active
                        && s.auto_renewal
                        && s.card_token.is_some()
                        && s.next_payment_date.map(|d| d <= now).unwrap_or(false)
                })
                .cloned()
                .collect())
        }
        async fn due_for_pause_resume(&self, now: chrono::DateTime<Utc>) -> crate::Result<Vec<SubscriptionHistory>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|s| {
                    s.status == SubscriptionStatus::Paused
                        && s.card_token.is_some()
                        && s.paused_at.map(|p| p + Duration::days(7) <= now).unwrap_or(false)
                })
                .cloned()
                .collect())
        }
    }

    fn tariff(id: i64, name: &str, price: Decimal) -> Tariff {
        Tariff {
            id,
            name: name.to_string(),
            price,
            duration_days: Some(30),
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo: false,
            auto_renewal: true,
            next_tariff_id: None,
        }
    }

    fn subscription(id: i64, tariff_id: i64, failed_attempts: i64, next_payment_date: chrono::DateTime<Utc>) -> SubscriptionHistory {
        SubscriptionHistory {
            id,
            user_id: "u1".to_string(),
            tariff_id,
            start_date: Utc::now(),
            end_date: None,
            status: SubscriptionStatus::Active,
            pause_days_used: 0,
            gateway_subscription_id: Some("gw-1".to_string()),
            card_token: Some("tok".to_string()),
            auto_renewal: true,
            failed_attempts,
            last_payment_attempt: None,
            paused_at: None,
            next_payment_date: Some(next_payment_date),
            original_tariff_id: None,
            downgrade_attempts: 0,
        }
    }

    /// Harness wired to a mock gateway that always answers `succeed`.
    async fn harness(
        tariffs: Vec<Tariff>,
        succeed: bool,
    ) -> (RecurringPaymentsScheduler, Arc<InMemorySubscriptions>, Arc<InMemoryUsers>, MockServer) {
        let mock_server = MockServer::start().await;
        Mock::given(wm_method("POST"))
            .and(wm_path("/test/payments/tokens/charge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Success": succeed,
                "Message": if succeed { serde_json::Value::Null } else { serde_json::Value::String("declined".into()) },
                "Model": { "TransactionId": "tx-recur", "Status": if succeed { "Completed" } else { "Declined" } }
            })))
            .mount(&mock_server)
            .await;
        Mock::given(wm_method("POST"))
            .and(wm_path("/test/subscriptions/create"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Success": true,
                "Message": null,
                "Model": { "Id": "gw-new", "AccountId": "u1", "Status": "Active", "NextTransactionDate": null }
            })))
            .mount(&mock_server)
            .await;
        Mock::given(wm_method("POST"))
            .and(wm_path("/test/subscriptions/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Success": true,
                "Message": null,
                "Model": { "Id": "gw-1", "AccountId": "u1", "Status": "Cancelled", "NextTransactionDate": null }
            })))
            .mount(&mock_server)
            .await;

        let mut gateway = PaymentGatewayClient::new(&PaymentGatewayConfig {
            test_mode: true,
            public_id: "pub".into(),
            api_secret: "secret".into(),
        });
        gateway.base_url = format!("{}/test", mock_server.uri());
        let gateway = Arc::new(gateway);

        let users = Arc::new(InMemoryUsers(Mutex::new(vec![User::new("u1", Utc::now())])));
        let tariffs_repo = Arc::new(InMemoryTariffs(tariffs));
        let payments_repo = Arc::new(InMemoryPayments(Mutex::new(vec![])));
        let subscriptions = Arc::new(InMemorySubscriptions(Mutex::new(vec![])));

        let payment_service = Arc::new(PaymentService::new(
            users.clone(),
            tariffs_repo.clone(),
            payments_repo,
            subscriptions.clone(),
            gateway.clone(),
        ));

        let scheduler = RecurringPaymentsScheduler::new(
            subscriptions.clone(),
            tariffs_repo,
            users.clone(),
            gateway,
            payment_service,
            std::time::Duration::from_secs(3600),
        );

        (scheduler, subscriptions, users, mock_server)
    }

    #[tokio::test]
    async fn successful_charge_extends_subscription_and_clears_failures() {
        let (scheduler, subscriptions, users, _mock) = harness(vec![tariff(1, "Daily", dec!(199))], true).await;
        let due = subscription(1, 1, 1, Utc::now() - Duration::minutes(1));
        subscriptions.save(due).await.unwrap();

        scheduler.tick().await.unwrap();

        let saved = subscriptions.find_active_for_user("u1").await.unwrap().unwrap();
        assert_eq!(saved.failed_attempts, 0);
        assert!(saved.next_payment_date.unwrap() > Utc::now() + Duration::days(9));

        let user = users.find("u1").await.unwrap().unwrap();
        assert!(user.subscription_end.is_some());
    }

    #[tokio::test]
    async fn failed_charge_under_threshold_reschedules_for_tomorrow() {
        let (scheduler, subscriptions, _users, _mock) = harness(vec![tariff(1, "Daily", dec!(199))], false).await;
        let due = subscription(1, 1, 0, Utc::now() - Duration::minutes(1));
        subscriptions.save(due).await.unwrap();

        scheduler.tick().await.unwrap();

        let saved = subscriptions.find_active_for_user("u1").await.unwrap().unwrap();
        assert_eq!(saved.failed_attempts, 1);
        let next = saved.next_payment_date.unwrap();
        assert!(next > Utc::now() + Duration::hours(23));
        assert!(next < Utc::now() + Duration::hours(25));
    }

    /// The 3rd consecutive decline triggers the downgrade cascade, which
    /// itself immediately retries the charge against the new tariff in
    /// the same tick (§4.11). With the gateway declining every charge,
    /// that retry also fails, leaving the subscription downgraded but
    /// rescheduled for tomorrow rather than cleared to zero failures.
    #[tokio::test]
    async fn third_failure_downgrades_instead_of_rescheduling() {
        let (scheduler, subscriptions, users, _mock) =
            harness(vec![tariff(1, "Exclusive", dec!(999)), tariff(2, "Daily", dec!(199))], false).await;
        let due = subscription(1, 1, 2, Utc::now() - Duration::minutes(1));
        subscriptions.save(due).await.unwrap();

        scheduler.tick().await.unwrap();

        let saved = subscriptions.find_active_for_user("u1").await.unwrap().unwrap();
        assert_eq!(saved.tariff_id, 2);
        assert_eq!(saved.downgrade_attempts, 1);
        assert_eq!(saved.failed_attempts, 1);
        let next = saved.next_payment_date.unwrap();
        assert!(next > Utc::now() + Duration::hours(23));
        assert!(next < Utc::now() + Duration::hours(25));

        let user = users.find("u1").await.unwrap().unwrap();
        assert_eq!(user.current_tariff_id, Some(2));
    }

    #[tokio::test]
    async fn downgrade_chain_bottoms_out_and_cancels_within_one_tick() {
        let (scheduler, subscriptions, users, _mock) = harness(vec![tariff(1, "Demo", dec!(0))], false).await;
        let due = subscription(1, 1, 2, Utc::now() - Duration::minutes(1));
        subscriptions.save(due).await.unwrap();

        scheduler.tick().await.unwrap();

        let saved = subscriptions.0.lock().unwrap().iter().find(|s| s.id == 1).cloned().unwrap();
        assert_eq!(saved.status, SubscriptionStatus::Cancelled);

        let user = users.find("u1").await.unwrap().unwrap();
        assert!(!user.is_paid);
    }
}
