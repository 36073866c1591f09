//! Payment Service (C10): coordinates user subscription state with the
//! payment gateway (C9) — activation, pause/resume/cancel, the demo→paid
//! upgrade flow, and webhook reconciliation. The downgrade cascade here
//! is shared with the recurring-payments scheduler (C11), which drives
//! the same cascade on a charge failure.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::warn;

use crate::error::Error;
use crate::models::{downgrade_target, Payment, PaymentStatus, SubscriptionHistory, SubscriptionStatus, Tariff};
use crate::payment_gateway::{ChargeTokenRequest, CreateSubscriptionRequest, PaymentGatewayClient, WebhookPayload};
use crate::persistence::{PaymentRepository, SubscriptionRepository, TariffRepository, UserRepository};

/// Gateway-side recurrence terms fixed by the product (§4.10): a demo or
/// an "Exclusive" tariff both bill 999 every 10 days; only the first
/// charge's offset differs.
const RECURRING_AMOUNT: Decimal = dec!(999);
const RECURRING_PERIOD_DAYS: i64 = 10;
const RECURRING_CURRENCY: &str = "RUB";
const EXCLUSIVE_TARIFF_NAME: &str = "Exclusive";

pub struct PaymentService {
    users: Arc<dyn UserRepository>,
    tariffs: Arc<dyn TariffRepository>,
    payments: Arc<dyn PaymentRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    gateway: Arc<PaymentGatewayClient>,
}

impl PaymentService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        tariffs: Arc<dyn TariffRepository>,
        payments: Arc<dyn PaymentRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        gateway: Arc<PaymentGatewayClient>,
    ) -> Self {
        Self {
            users,
            tariffs,
            payments,
            subscriptions,
            gateway,
        }
    }

    /// Idempotent activation: reuses a completed payment with a token for
    /// `(user, tariff)` if one already exists, else records a new one.
    pub async fn activate_subscription_simple(
        &self,
        user_id: &str,
        tariff_id: i64,
        card_token: Option<String>,
        transaction_id: Option<String>,
    ) -> crate::Result<SubscriptionHistory> {
        let tariff = self.require_tariff(tariff_id).await?;
        let mut user = self.require_user(user_id).await?;
        let now = Utc::now();

        let existing = self.payments.find_completed_with_token(user_id, tariff_id).await?;
        if existing.is_none() {
            self.payments
                .insert(Payment {
                    id: 0,
                    user_id: user_id.to_string(),
                    tariff_id,
                    amount: tariff.price,
                    currency: RECURRING_CURRENCY.to_string(),
                    payment_method: "card".to_string(),
                    status: PaymentStatus::Completed,
                    transaction_id,
                    card_token: card_token.clone(),
                    card_first_six: None,
                    card_last_four: None,
                    card_type: None,
                    is_recurrent: false,
                    subscription_id: None,
                    created_at: now,
                    paid_at: Some(now),
                })
                .await?;
        }

        user.is_paid = true;
        user.current_tariff_id = Some(tariff.id);
        user.subscription_start = Some(now);
        user.subscription_end = tariff.duration_days.map(|days| now + Duration::days(days));
        if let Some(quota) = tariff.requests_count {
            user.remaining_requests = Some(quota);
        }
        self.users.save(user).await?;

        let mut subscription = SubscriptionHistory {
            id: 0,
            user_id: user_id.to_string(),
            tariff_id: tariff.id,
            start_date: now,
            end_date: None,
            status: SubscriptionStatus::Active,
            pause_days_used: 0,
            gateway_subscription_id: None,
            card_token: card_token.clone(),
            auto_renewal: card_token.is_some(),
            failed_attempts: 0,
            last_payment_attempt: None,
            paused_at: None,
            next_payment_date: None,
            original_tariff_id: None,
            downgrade_attempts: 0,
        };

        if tariff.is_demo && card_token.is_some() {
            let exclusive = self.tariffs.find_by_name(EXCLUSIVE_TARIFF_NAME).await?;
            subscription.next_payment_date = Some(now + Duration::hours(24));
            subscription.original_tariff_id = exclusive.map(|t| t.id);
            subscription.gateway_subscription_id = Some(format!("pending-{}", uuid::Uuid::new_v4()));
        }

        self.subscriptions.save(subscription).await
    }

    /// Like `activate_subscription_simple`, but for the demo tariff and
    /// the named recurring tariff ("Exclusive") it creates the gateway
    /// subscription up front instead of leaving a `pending-*` marker.
    pub async fn create_recurrent_subscription(
        &self,
        user_id: &str,
        tariff_id: i64,
        card_token: String,
        transaction_id: Option<String>,
    ) -> crate::Result<SubscriptionHistory> {
        let tariff = self.require_tariff(tariff_id).await?;

        if !tariff.is_demo && tariff.name != EXCLUSIVE_TARIFF_NAME {
            return self
                .activate_subscription_simple(user_id, tariff_id, Some(card_token), transaction_id)
                .await;
        }

        let now = Utc::now();
        let start_date = if tariff.is_demo { now + Duration::hours(24) } else { now + Duration::days(RECURRING_PERIOD_DAYS) };

        let gateway_response = self
            .gateway
            .create_subscription(&CreateSubscriptionRequest {
                token: card_token.clone(),
                account_id: user_id.to_string(),
                description: format!("{} recurring subscription", tariff.name),
                amount: RECURRING_AMOUNT,
                currency: RECURRING_CURRENCY.to_string(),
                start_date,
                interval: "Day".to_string(),
                period: RECURRING_PERIOD_DAYS as u32,
            })
            .await?;

        if !gateway_response.success {
            return Err(Error::payment(
                gateway_response.message.unwrap_or_else(|| "gateway declined subscription creation".to_string()),
            ));
        }

        let mut subscription = self
            .activate_subscription_simple(user_id, tariff_id, Some(card_token), transaction_id)
            .await?;

        subscription.gateway_subscription_id = gateway_response.model.map(|m| m.id);
        subscription.next_payment_date = Some(start_date);
        if tariff.is_demo {
            let exclusive = self.tariffs.find_by_name(EXCLUSIVE_TARIFF_NAME).await?;
            subscription.original_tariff_id = exclusive.map(|t| t.id);
        }
        self.subscriptions.save(subscription).await
    }

    pub async fn pause_subscription(&self, user_id: &str) -> crate::Result<SubscriptionHistory> {
        let mut subscription = self.require_auto_renewing_subscription(user_id).await?;

        if let Some(gateway_id) = &subscription.gateway_subscription_id {
            if let Err(e) = self.gateway.cancel_subscription(gateway_id).await {
                warn!(error = %e, user_id, "failed to cancel gateway subscription on pause, proceeding locally");
            }
        }

        let now = Utc::now();
        subscription.status = SubscriptionStatus::Paused;
        subscription.auto_renewal = false;
        subscription.paused_at = Some(now);
        subscription.last_payment_attempt = Some(now);
        subscription.pause_days_used += 7;
        self.subscriptions.save(subscription).await
    }

    pub async fn resume_subscription(&self, user_id: &str) -> crate::Result<SubscriptionHistory> {
        let mut subscription = self
            .subscriptions
            .find_active_for_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no subscription for user {user_id}")))?;

        if subscription.status != SubscriptionStatus::Paused {
            return Err(Error::validation("subscription is not paused"));
        }

        let card_token = subscription
            .card_token
            .clone()
            .ok_or_else(|| Error::validation("paused subscription has no card token to resume with"))?;
        let tariff = self.require_tariff(subscription.billing_tariff_id()).await?;

        let now = Utc::now();
        let start_date = now + Duration::days(1);
        let gateway_response = self
            .gateway
            .create_subscription(&CreateSubscriptionRequest {
                token: card_token,
                account_id: user_id.to_string(),
                description: format!("{} resumed subscription", tariff.name),
                amount: tariff.price,
                currency: RECURRING_CURRENCY.to_string(),
                start_date,
                interval: "Day".to_string(),
                period: RECURRING_PERIOD_DAYS as u32,
            })
            .await?;

        if !gateway_response.success {
            return Err(Error::payment(
                gateway_response.message.unwrap_or_else(|| "gateway declined subscription resume".to_string()),
            ));
        }

        subscription.status = SubscriptionStatus::Active;
        subscription.auto_renewal = true;
        subscription.gateway_subscription_id = gateway_response.model.map(|m| m.id);
        subscription.next_payment_date = Some(start_date);
        self.subscriptions.save(subscription).await
    }

    pub async fn cancel_subscription(&self, user_id: &str) -> crate::Result<SubscriptionHistory> {
        let mut subscription = self
            .subscriptions
            .find_active_for_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no subscription for user {user_id}")))?;

        if let Some(gateway_id) = &subscription.gateway_subscription_id {
            if let Err(e) = self.gateway.cancel_subscription(gateway_id).await {
                warn!(error = %e, user_id, "failed to cancel gateway subscription, proceeding locally");
            }
        }

        subscription.status = SubscriptionStatus::Cancelled;
        subscription.auto_renewal = false;
        subscription = self.subscriptions.save(subscription).await?;

        if let Some(mut user) = self.users.find(user_id).await? {
            user.is_paid = false;
            user.current_tariff_id = None;
            self.users.save(user).await?;
        }

        Ok(subscription)
    }

    /// `handle_payment_notification` (§4.10): dispatches on gateway
    /// status, deduping on `TransactionId` first (§7 idempotency).
    pub async fn handle_payment_notification(&self, payload: WebhookPayload) -> crate::Result<()> {
        if let Some(transaction_id) = &payload.transaction_id {
            if self.payments.find_by_transaction_id(transaction_id).await?.is_some() {
                return Ok(());
            }
        }

        match payload.status.as_str() {
            "Completed" => self.handle_completed_webhook(payload).await,
            "Declined" => self.handle_declined_webhook(payload).await,
            other => {
                warn!(status = other, "unrecognized gateway webhook status, ignoring");
                Ok(())
            }
        }
    }

    async fn handle_completed_webhook(&self, payload: WebhookPayload) -> crate::Result<()> {
        let now = Utc::now();
        let existing_subscription = self.subscriptions.find_active_for_user(&payload.account_id).await?;

        match existing_subscription {
            None => {
                let tariff_id = payload
                    .tariff_id()
                    .ok_or_else(|| Error::validation("Completed webhook with no prior subscription carried no Data.tariff_id"))?;
                self.payments
                    .insert(Payment {
                        id: 0,
                        user_id: payload.account_id.clone(),
                        tariff_id,
                        amount: payload.amount,
                        currency: RECURRING_CURRENCY.to_string(),
                        payment_method: "card".to_string(),
                        status: PaymentStatus::Completed,
                        transaction_id: payload.transaction_id.clone(),
                        card_token: payload.token.clone(),
                        card_first_six: None,
                        card_last_four: None,
                        card_type: None,
                        is_recurrent: payload.token.is_some(),
                        subscription_id: None,
                        created_at: now,
                        paid_at: Some(now),
                    })
                    .await?;
                Ok(())
            }
            Some(mut subscription) if subscription.card_token.is_none() => {
                let tariff = self.require_tariff(subscription.billing_tariff_id()).await?;
                if let Some(token) = &payload.token {
                    subscription.card_token = Some(token.clone());
                    let start_date = if tariff.is_demo { now + Duration::hours(24) } else { now + Duration::days(RECURRING_PERIOD_DAYS) };
                    let gateway_response = self
                        .gateway
                        .create_subscription(&CreateSubscriptionRequest {
                            token: token.clone(),
                            account_id: subscription.user_id.clone(),
                            description: format!("{} recurring subscription", tariff.name),
                            amount: RECURRING_AMOUNT,
                            currency: RECURRING_CURRENCY.to_string(),
                            start_date,
                            interval: "Day".to_string(),
                            period: RECURRING_PERIOD_DAYS as u32,
                        })
                        .await?;
                    if gateway_response.success {
                        subscription.gateway_subscription_id = gateway_response.model.map(|m| m.id);
                        subscription.next_payment_date = Some(start_date);
                    }
                }
                self.subscriptions.save(subscription.clone()).await?;
                self.payments
                    .insert(Payment {
                        id: 0,
                        user_id: subscription.user_id.clone(),
                        tariff_id: tariff.id,
                        amount: payload.amount,
                        currency: RECURRING_CURRENCY.to_string(),
                        payment_method: "card".to_string(),
                        status: PaymentStatus::Completed,
                        transaction_id: payload.transaction_id.clone(),
                        card_token: payload.token.clone(),
                        card_first_six: None,
                        card_last_four: None,
                        card_type: None,
                        is_recurrent: true,
                        subscription_id: Some(subscription.id),
                        created_at: now,
                        paid_at: Some(now),
                    })
                    .await?;
                Ok(())
            }
            Some(mut subscription) => {
                let tariff = self.require_tariff(subscription.billing_tariff_id()).await?;
                self.payments
                    .insert(Payment {
                        id: 0,
                        user_id: subscription.user_id.clone(),
                        tariff_id: tariff.id,
                        amount: payload.amount,
                        currency: RECURRING_CURRENCY.to_string(),
                        payment_method: "card".to_string(),
                        status: PaymentStatus::Completed,
                        transaction_id: payload.transaction_id.clone(),
                        card_token: subscription.card_token.clone(),
                        card_first_six: None,
                        card_last_four: None,
                        card_type: None,
                        is_recurrent: true,
                        subscription_id: Some(subscription.id),
                        created_at: now,
                        paid_at: Some(now),
                    })
                    .await?;

                subscription.failed_attempts = 0;
                subscription.next_payment_date = Some(now + Duration::days(RECURRING_PERIOD_DAYS));
                self.subscriptions.save(subscription.clone()).await?;

                if let Some(mut user) = self.users.find(&subscription.user_id).await? {
                    let base = user.subscription_end.filter(|end| *end > now).unwrap_or(now);
                    user.subscription_end = Some(base + Duration::days(tariff.duration_days.unwrap_or(0)));
                    self.users.save(user).await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_declined_webhook(&self, payload: WebhookPayload) -> crate::Result<()> {
        let Some(mut subscription) = self.subscriptions.find_active_for_user(&payload.account_id).await? else {
            warn!(account_id = %payload.account_id, "declined webhook for a user with no subscription, ignoring");
            return Ok(());
        };

        let now = Utc::now();
        subscription.failed_attempts += 1;
        subscription.last_payment_attempt = Some(now);

        if subscription.failed_attempts >= 3 {
            self.downgrade_cascade(&subscription).await?;
        } else {
            subscription.next_payment_date = Some(now + Duration::days(1));
            self.subscriptions.save(subscription).await?;
        }
        Ok(())
    }

    /// Downgrade cascade (§4.10), shared with C11: moves the subscription
    /// to the next cheaper tariff in the closed downgrade map, or cancels
    /// terminally when the chain ends. Returns the saved subscription
    /// when a downgrade happened, `None` when it was cancelled instead.
    pub async fn downgrade_cascade(&self, subscription: &SubscriptionHistory) -> crate::Result<Option<SubscriptionHistory>> {
        let current_tariff = self.require_tariff(subscription.tariff_id).await?;
        let mut subscription = subscription.clone();

        match downgrade_target(&current_tariff.name) {
            Some(next_name) => {
                self.best_effort_cancel_gateway(&subscription).await;

                let next_tariff = self
                    .tariffs
                    .find_by_name(next_name)
                    .await?
                    .ok_or_else(|| Error::validation(format!("downgrade target tariff {next_name} is not configured")))?;
                let token = subscription
                    .card_token
                    .clone()
                    .ok_or_else(|| Error::validation("cannot downgrade a subscription with no card token"))?;

                let now = Utc::now();
                let start_date = now + Duration::days(1);
                let gateway_response = self
                    .gateway
                    .create_subscription(&CreateSubscriptionRequest {
                        token,
                        account_id: subscription.user_id.clone(),
                        description: format!("{} subscription", next_tariff.name),
                        amount: next_tariff.price,
                        currency: RECURRING_CURRENCY.to_string(),
                        start_date,
                        interval: "Day".to_string(),
                        period: RECURRING_PERIOD_DAYS as u32,
                    })
                    .await?;

                subscription.tariff_id = next_tariff.id;
                subscription.original_tariff_id = None;
                subscription.failed_attempts = 0;
                subscription.downgrade_attempts += 1;
                subscription.next_payment_date = Some(start_date);
                if gateway_response.success {
                    subscription.gateway_subscription_id = gateway_response.model.map(|m| m.id);
                }
                let subscription = self.subscriptions.save(subscription).await?;

                if let Some(mut user) = self.users.find(&subscription.user_id).await? {
                    user.current_tariff_id = Some(next_tariff.id);
                    self.users.save(user).await?;
                }

                Ok(Some(subscription))
            }
            None => {
                self.best_effort_cancel_gateway(&subscription).await;

                subscription.status = SubscriptionStatus::Cancelled;
                subscription.auto_renewal = false;
                let subscription = self.subscriptions.save(subscription).await?;

                if let Some(mut user) = self.users.find(&subscription.user_id).await? {
                    user.is_paid = false;
                    user.current_tariff_id = None;
                    self.users.save(user).await?;
                }

                Ok(None)
            }
        }
    }

    async fn best_effort_cancel_gateway(&self, subscription: &SubscriptionHistory) {
        if let Some(gateway_id) = &subscription.gateway_subscription_id {
            if let Err(e) = self.gateway.cancel_subscription(gateway_id).await {
                warn!(error = %e, subscription_id = subscription.id, "failed to cancel gateway subscription during downgrade");
            }
        }
    }

    async fn require_tariff(&self, tariff_id: i64) -> crate::Result<Tariff> {
        self.tariffs
            .find(tariff_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("tariff {tariff_id}")))
    }

    async fn require_user(&self, user_id: &str) -> crate::Result<crate::models::User> {
        self.users
            .find(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("user {user_id}")))
    }

    async fn require_auto_renewing_subscription(&self, user_id: &str) -> crate::Result<SubscriptionHistory> {
        let subscription = self
            .subscriptions
            .find_active_for_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("no subscription for user {user_id}")))?;
        if subscription.status != SubscriptionStatus::Active || !subscription.auto_renewal {
            return Err(Error::validation("subscription is not an active auto-renewing subscription"));
        }
        Ok(subscription)
    }
}

/// Charges `subscription`'s billing tariff once via the gateway. Exposed
/// so the recurring-payments scheduler (C11) can drive the same charge
/// path used by the webhook-completion flow.
pub async fn charge_recurrent(
    gateway: &PaymentGatewayClient,
    subscription: &SubscriptionHistory,
    tariff: &Tariff,
) -> crate::Result<bool> {
    let token = subscription
        .card_token
        .clone()
        .ok_or_else(|| Error::validation("subscription has no card token to charge"))?;
    let response = gateway
        .charge_token(&ChargeTokenRequest {
            amount: tariff.price,
            currency: RECURRING_CURRENCY.to_string(),
            account_id: subscription.user_id.clone(),
            token,
        })
        .await?;
    Ok(response.success)
}

pub fn recurring_period() -> Duration {
    Duration::days(RECURRING_PERIOD_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaymentGatewayConfig;
    use crate::models::{PaymentStatus as PStatus, User};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use wiremock::matchers::method as wm_method;
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
        async fn find_completed_with_token(&self, user_id: &str, tariff_id: i64) -> crate::Result<Option<Payment>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.user_id == user_id && p.tariff_id == tariff_id && p.card_token.is_some() && p.status == PStatus::Completed)
                .cloned())
        }
        async fn find_by_transaction_id(&self, transaction_id: &str) -> crate::Result<Option<Payment>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
                .cloned())
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
        async fn save(&self, mut subscription: SubscriptionHistory) -> crate::Result<SubscriptionHistory> {
            let mut guard = self.0.lock().unwrap();
            if subscription.id == 0 {
                subscription.id = guard.len() as i64 + 1;
            }
            if let Some(existing) = guard.iter_mut().find(|s| s.id == subscription.id) {
                *existing = subscription.clone();
            } else {
                guard.push(subscription.clone());
            }
            Ok(subscription)
        }
        async fn due_for_charge(&self, now: DateTime<Utc>) -> crate::Result<Vec<SubscriptionHistory>> {
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
        async fn due_for_pause_resume(&self, now: DateTime<Utc>) -> crate::Result<Vec<SubscriptionHistory>> {
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

    fn tariff(id: i64, name: &str, price: Decimal, duration_days: Option<i64>, is_demo: bool) -> Tariff {
        Tariff {
            id,
            name: name.to_string(),
            price,
            duration_days,
            requests_count: None,
            subtitle: None,
            features: None,
            is_active: true,
            is_demo,
            auto_renewal: is_demo,
            next_tariff_id: None,
        }
    }

    /// Builds a service wired to an in-process mock gateway: every POST
    /// succeeds with a generic subscription envelope, so tests exercise
    /// the service's own branching without reaching the real network.
    /// The returned `MockServer` must stay alive for the test's duration.
    async fn service(
        tariffs: Vec<Tariff>,
    ) -> (PaymentService, Arc<InMemoryUsers>, Arc<InMemorySubscriptions>, Arc<InMemoryPayments>, MockServer) {
        let mock_server = MockServer::start().await;
        Mock::given(wm_method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Success": true,
                "Message": null,
                "Model": { "Id": "gw-sub-1", "AccountId": "u1", "Status": "Active", "NextTransactionDate": null }
            })))
            .mount(&mock_server)
            .await;

        let users = Arc::new(InMemoryUsers(Mutex::new(vec![User::new("u1", Utc::now())])));
        let tariffs_repo = Arc::new(InMemoryTariffs(tariffs));
        let payments = Arc::new(InMemoryPayments(Mutex::new(vec![])));
        let subscriptions = Arc::new(InMemorySubscriptions(Mutex::new(vec![])));
        let mut gateway = PaymentGatewayClient::new(&PaymentGatewayConfig {
            test_mode: true,
            public_id: "pub".into(),
            api_secret: "secret".into(),
        });
        gateway.base_url = mock_server.uri();
        let service = PaymentService::new(
            users.clone(),
            tariffs_repo,
            payments.clone(),
            subscriptions.clone(),
            Arc::new(gateway),
        );
        (service, users, subscriptions, payments, mock_server)
    }

    #[tokio::test]
    async fn activate_simple_sets_user_and_subscription_fields() {
        let (service, users, subscriptions, _payments, _mock) =
            service(vec![tariff(1, "Daily", dec!(199), Some(30), false)]).await;
        let subscription = service
            .activate_subscription_simple("u1", 1, None, Some("tx-1".into()))
            .await
            .unwrap();

        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert!(!subscription.auto_renewal);
        let user = users.find("u1").await.unwrap().unwrap();
        assert!(user.is_paid);
        assert_eq!(user.current_tariff_id, Some(1));
        assert_eq!(subscriptions.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn activate_simple_twice_never_duplicates_a_token_payment() {
        let (service, _users, _subs, payments, _mock) = service(vec![tariff(1, "Daily", dec!(199), Some(30), false)]).await;
        service
            .activate_subscription_simple("u1", 1, Some("tok".into()), Some("tx-1".into()))
            .await
            .unwrap();
        service
            .activate_subscription_simple("u1", 1, Some("tok".into()), Some("tx-2".into()))
            .await
            .unwrap();
        assert_eq!(payments.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn demo_activation_with_token_schedules_upgrade_to_exclusive() {
        let (service, _users, _subs, _payments, _mock) = service(vec![
            tariff(1, "Demo", dec!(0), Some(3), true),
            tariff(2, "Exclusive", dec!(999), Some(30), false),
        ])
        .await;
        let subscription = service
            .activate_subscription_simple("u1", 1, Some("tok".into()), None)
            .await
            .unwrap();
        assert_eq!(subscription.original_tariff_id, Some(2));
        assert!(subscription.next_payment_date.is_some());
    }

    #[tokio::test]
    async fn downgrade_cascade_moves_to_next_cheaper_tariff() {
        let (service, users, subscriptions, _payments, _mock) = service(vec![
            tariff(1, "Exclusive", dec!(999), Some(30), false),
            tariff(2, "Daily", dec!(199), Some(30), false),
        ])
        .await;
        let subscription = service
            .activate_subscription_simple("u1", 1, Some("tok".into()), None)
            .await
            .unwrap();

        let downgraded = service.downgrade_cascade(&subscription).await.unwrap().unwrap();
        assert_eq!(downgraded.tariff_id, 2);
        assert_eq!(downgraded.downgrade_attempts, 1);
        assert_eq!(downgraded.failed_attempts, 0);

        let user = users.find("u1").await.unwrap().unwrap();
        assert_eq!(user.current_tariff_id, Some(2));
        assert_eq!(subscriptions.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn downgrade_cascade_at_chain_end_cancels_and_unpays_user() {
        let (service, users, _subs, _payments, _mock) = service(vec![tariff(1, "Demo", dec!(0), Some(3), true)]).await;
        let subscription = service
            .activate_subscription_simple("u1", 1, Some("tok".into()), None)
            .await
            .unwrap();

        let result = service.downgrade_cascade(&subscription).await.unwrap();
        assert!(result.is_none());
        let user = users.find("u1").await.unwrap().unwrap();
        assert!(!user.is_paid);
        assert_eq!(user.current_tariff_id, None);
    }

    #[tokio::test]
    async fn webhook_replay_by_transaction_id_is_a_no_op() {
        let (service, _users, _subs, payments, _mock) = service(vec![tariff(3, "Daily", dec!(199), Some(30), false)]).await;
        let payload = WebhookPayload {
            transaction_id: Some("tx-dup".into()),
            account_id: "u1".into(),
            amount: dec!(199),
            status: "Completed".into(),
            token: Some("tok".into()),
            data: Some(serde_json::json!({ "tariff_id": 3 })),
        };
        service.handle_payment_notification(payload.clone()).await.unwrap();
        service.handle_payment_notification(payload).await.unwrap();
        assert_eq!(payments.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_then_cancel_requires_an_existing_subscription() {
        let (service, _users, _subs, _payments, _mock) = service(vec![]).await;
        let err = service.pause_subscription("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
