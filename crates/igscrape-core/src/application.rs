//! Application & Configuration (C15): the top-level value a launcher
//! builds exactly once. Every long-lived service in the process — the
//! HTTP client, credential rotator, job queue and worker, payment
//! gateway client and service, the recurring-payments and notification
//! schedulers — is owned here and handed down by reference/`Arc`.
//! Nothing in this crate is a module-level singleton.

use std::path::PathBuf;
use std::sync::Arc;

use crate::blob_store::BlobStore;
use crate::cache::ProfileCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::credentials::CredentialRotator;
use crate::http_client::ResilientHttpClient;
use crate::jobs::JobQueue;
use crate::notifications::{NotificationScheduler, Notifier};
use crate::parser_config::ParserConfigStore;
use crate::payment::PaymentService;
use crate::payment_gateway::PaymentGatewayClient;
use crate::payment_scheduler::RecurringPaymentsScheduler;
use crate::persistence::{
    ActivityRepository, NotificationRepository, PaymentRepository, ProfileRepository, SubscriptionRepository,
    TariffRepository, UserRepository,
};
use crate::scrape::ScrapeOrchestrator;

/// Concrete storage adapters the launcher must supply. The core stays
/// storage-agnostic (§1 Non-goal: no database engine is bundled); this
/// bundle is the seam where a real deployment plugs one in.
pub struct RepositoryBundle {
    pub profiles: Arc<dyn ProfileRepository>,
    pub users: Arc<dyn UserRepository>,
    pub tariffs: Arc<dyn TariffRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub activity: Arc<dyn ActivityRepository>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Every long-lived service in the process, assembled once by a
/// launcher. Background loops (job worker, recurring-payments sweep,
/// notification delivery) are spawned during `bootstrap` and joined
/// during `shutdown`.
pub struct Application {
    pub http: Arc<ResilientHttpClient>,
    pub orchestrator: Arc<ScrapeOrchestrator>,
    pub cache: Arc<ProfileCache>,
    pub jobs: JobQueue,
    pub gateway: Arc<PaymentGatewayClient>,
    pub payments: Arc<PaymentService>,
    pub scheduler: Arc<RecurringPaymentsScheduler>,
    pub notifications: Arc<NotificationScheduler>,

    worker_handle: tokio::task::JoinHandle<()>,
    scheduler_handle: tokio::task::JoinHandle<()>,
    notification_handle: tokio::task::JoinHandle<()>,
}

impl Application {
    /// Validates `config`, wires every service, and spawns the
    /// background loops. The only async work here is building the
    /// HTTP client and starting the workers — there is no I/O to an
    /// external system during bootstrap itself.
    pub async fn bootstrap(
        config: &Config,
        parser_config_path: impl Into<PathBuf>,
        repos: RepositoryBundle,
        notifier: Arc<dyn Notifier>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let parser_config = ParserConfigStore::new(parser_config_path.into())?;
        let credentials = Arc::new(CredentialRotator::new(parser_config));

        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let http = Arc::new(ResilientHttpClient::new(
            config.http_client.clone(),
            config.rate_limiter.clone(),
            breaker,
            credentials,
        )?);

        let orchestrator = Arc::new(ScrapeOrchestrator::new(
            http.clone(),
            repos.blobs.clone(),
            config.rate_limiter.clone(),
        ));

        let cache = Arc::new(ProfileCache::new(
            repos.profiles.clone(),
            chrono::Duration::seconds(config.cache.freshness_ttl_secs),
        ));

        let (jobs, worker_handle) = JobQueue::spawn(
            orchestrator.clone(),
            repos.profiles.clone(),
            repos.blobs.clone(),
            chrono::Duration::seconds(config.tasks.status_ttl_secs),
            std::time::Duration::from_secs(config.tasks.sweep_interval_secs),
        );

        let gateway = Arc::new(PaymentGatewayClient::new(&config.payment_gateway));
        let payments = Arc::new(PaymentService::new(
            repos.users.clone(),
            repos.tariffs.clone(),
            repos.payments.clone(),
            repos.subscriptions.clone(),
            gateway.clone(),
        ));

        let scheduler = Arc::new(RecurringPaymentsScheduler::new(
            repos.subscriptions.clone(),
            repos.tariffs.clone(),
            repos.users.clone(),
            gateway.clone(),
            payments.clone(),
            std::time::Duration::from_secs(config.tasks.payment_scheduler_tick_secs),
        ));
        let scheduler_handle = scheduler.clone().spawn();

        let notifications = Arc::new(NotificationScheduler::new(
            repos.notifications.clone(),
            repos.activity.clone(),
            notifier,
            config.notifications.clone(),
        ));
        let notification_handle = notifications
            .clone()
            .spawn(std::time::Duration::from_secs(config.tasks.notification_tick_secs));

        Ok(Self {
            http,
            orchestrator,
            cache,
            jobs,
            gateway,
            payments,
            scheduler,
            notifications,
            worker_handle,
            scheduler_handle,
            notification_handle,
        })
    }

    /// Stops accepting new scrape jobs and waits for the background
    /// loops to finish their current iteration. The scheduler and
    /// notification loops have no graceful-stop signal of their own
    /// (they only ever sleep or do bounded work), so they're aborted
    /// rather than joined.
    pub async fn shutdown(self) {
        self.jobs.shutdown();
        let _ = self.worker_handle.await;
        self.scheduler_handle.abort();
        self.notification_handle.abort();
    }
}
