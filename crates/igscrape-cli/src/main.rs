use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use igscrape_core::blob_store::FilesystemBlobStore;
use igscrape_core::models::TaskState;
use igscrape_core::notifications::LoggingNotifier;
use igscrape_core::{Application, Config, RepositoryBundle};

mod store;

#[derive(Parser)]
#[command(name = "igscrape")]
#[command(about = "Instagram profile ingestion and recurring-payments engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Override the configured log level")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every background service (job worker, recurring-payments
    /// scheduler, notification delivery loop) and run until interrupted.
    Serve,

    /// Enqueue a single scrape job, wait for it to finish, and print
    /// the resulting followers/followings/mutuals counts.
    Scrape {
        username: String,

        #[arg(long, default_value = "cli-user", help = "Owning user id")]
        user_id: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", format!("fatal: {e}").red().bold());
        std::process::exit(1);
    }
}

async fn run() -> igscrape_core::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path.to_str().unwrap_or_default())?,
        None => Config::from_env()?,
    };

    init_logging(cli.log_level.as_deref().unwrap_or(config.logging.level.as_str()), config.logging.json);

    info!(version = env!("CARGO_PKG_VERSION"), "starting igscrape");

    let repos = RepositoryBundle {
        profiles: Arc::new(store::InMemoryProfiles::default()),
        users: Arc::new(store::InMemoryUsers::default()),
        tariffs: Arc::new(store::InMemoryTariffs::seeded()),
        payments: Arc::new(store::InMemoryPayments::default()),
        subscriptions: Arc::new(store::InMemorySubscriptions::default()),
        notifications: Arc::new(store::InMemoryNotifications::default()),
        activity: Arc::new(store::InMemoryActivity::default()),
        blobs: FilesystemBlobStore::shared("./blobs"),
    };

    let app = Application::bootstrap(
        &config,
        config.parser_config_path.path.clone(),
        repos,
        Arc::new(LoggingNotifier),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "application failed to start");
        e
    })?;

    match cli.command {
        Commands::Serve => {
            info!("all services started, waiting for shutdown signal");
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining background services");
            app.shutdown().await;
        }
        Commands::Scrape { username, user_id } => {
            let task_id = app.jobs.enqueue(username.clone(), user_id)?;
            println!("{}", format!("enqueued scrape for '{username}' as task {task_id}").cyan());

            loop {
                let status = app.jobs.status(&task_id);
                match status.status {
                    TaskState::Completed => {
                        println!("{}", "scrape completed".green().bold());
                        println!("  followers:  {}", status.followers.map(|f| f.len()).unwrap_or(0));
                        println!("  followings: {}", status.followings.map(|f| f.len()).unwrap_or(0));
                        println!("  mutuals:    {}", status.mutuals.map(|f| f.len()).unwrap_or(0));
                        break;
                    }
                    TaskState::Failed => {
                        eprintln!("{}", format!("scrape failed: {}", status.error.unwrap_or_default()).red());
                        break;
                    }
                    TaskState::NotFound => {
                        eprintln!("{}", "task vanished from the status map".red());
                        break;
                    }
                    TaskState::Pending | TaskState::Processing => {
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
            }

            app.shutdown().await;
        }
    }

    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let subscriber = tracing_subscriber::fmt().with_env_filter(level);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
