//! Job Queue & Worker (C6): an unbounded FIFO of scrape jobs drained by a
//! single background worker, plus a task-status map with TTL eviction.
//! Shutdown is a typed message on the same queue rather than a sentinel
//! `None`, since the channel is strongly typed end to end.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::blob_store::BlobStore;
use crate::models::{InstagramFollower, ParseStatus, TaskState, TaskStatusRecord};
use crate::persistence::ProfileRepository;
use crate::scrape::{normalize_username, ScrapeOrchestrator};

#[derive(Debug, ThisError)]
pub enum JobError {
    #[error("queue is closed")]
    QueueClosed,
}

impl From<JobError> for crate::Error {
    fn from(e: JobError) -> Self {
        crate::Error::Other(e.to_string())
    }
}

pub enum Job {
    Scrape { task_id: String, username: String, user_id: String },
    Shutdown,
}

pub fn make_task_id(username: &str, now: DateTime<Utc>) -> String {
    format!("{username}_{}", now.timestamp_millis())
}

pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
    statuses: Arc<DashMap<String, TaskStatusRecord>>,
    worker_alive: Arc<AtomicBool>,
}

impl JobQueue {
    /// Spawns the single background worker and the status-sweep task,
    /// returning a handle plus the join handle for the worker (so a
    /// launcher can await graceful shutdown).
    pub fn spawn(
        orchestrator: Arc<ScrapeOrchestrator>,
        profiles: Arc<dyn ProfileRepository>,
        blobs: Arc<dyn BlobStore>,
        status_ttl: chrono::Duration,
        sweep_interval: std::time::Duration,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let statuses = Arc::new(DashMap::new());
        let worker_alive = Arc::new(AtomicBool::new(true));

        let worker_statuses = statuses.clone();
        let worker_alive_flag = worker_alive.clone();
        let worker_handle = tokio::spawn(run_worker(
            receiver,
            orchestrator,
            profiles,
            blobs,
            worker_statuses,
            worker_alive_flag,
        ));

        let sweep_statuses = statuses.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                sweep_expired(&sweep_statuses, status_ttl);
            }
        });

        (
            Self {
                sender,
                statuses,
                worker_alive,
            },
            worker_handle,
        )
    }

    pub fn enqueue(&self, username: impl Into<String>, user_id: impl Into<String>) -> crate::Result<String> {
        let username = normalize_username(&username.into());
        let task_id = make_task_id(&username, Utc::now());
        self.statuses.insert(task_id.clone(), TaskStatusRecord::pending(Utc::now()));
        self.sender
            .send(Job::Scrape { task_id: task_id.clone(), username, user_id: user_id.into() })
            .map_err(|_| JobError::QueueClosed)?;
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> TaskStatusRecord {
        self.statuses
            .get(task_id)
            .map(|r| r.clone())
            .unwrap_or_else(|| TaskStatusRecord {
                status: TaskState::NotFound,
                created_at: Utc::now(),
                completed_at: None,
                error: None,
                followers: None,
                followings: None,
                mutuals: None,
                comments: None,
            })
    }

    pub fn queue_status(&self) -> QueueStatus {
        let mut pending = 0;
        let mut processing = 0;
        let mut completed = 0;
        let mut failed = 0;
        for entry in self.statuses.iter() {
            match entry.value().status {
                TaskState::Pending => pending += 1,
                TaskState::Processing => processing += 1,
                TaskState::Completed => completed += 1,
                TaskState::Failed => failed += 1,
                TaskState::NotFound => {}
            }
        }
        QueueStatus {
            pending,
            processing,
            completed,
            failed,
            worker_alive: self.worker_alive.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Job::Shutdown);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub worker_alive: bool,
}

fn sweep_expired(statuses: &DashMap<String, TaskStatusRecord>, ttl: chrono::Duration) {
    let now = Utc::now();
    statuses.retain(|_, record| now - record.created_at < ttl);
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Job>,
    orchestrator: Arc<ScrapeOrchestrator>,
    profiles: Arc<dyn ProfileRepository>,
    blobs: Arc<dyn BlobStore>,
    statuses: Arc<DashMap<String, TaskStatusRecord>>,
    worker_alive: Arc<AtomicBool>,
) {
    while let Some(job) = receiver.recv().await {
        match job {
            Job::Shutdown => {
                info!("scrape worker received shutdown, exiting");
                break;
            }
            Job::Scrape { task_id, username, user_id: _ } => {
                if let Some(mut entry) = statuses.get_mut(&task_id) {
                    entry.status = TaskState::Processing;
                }
                match process_scrape(&orchestrator, &*profiles, &*blobs, &username).await {
                    Ok(result) => {
                        if let Some(mut entry) = statuses.get_mut(&task_id) {
                            entry.status = TaskState::Completed;
                            entry.completed_at = Some(Utc::now());
                            entry.followers = Some(result.followers);
                            entry.followings = Some(result.followings);
                            entry.mutuals = Some(result.mutuals);
                            entry.comments = Some(result.comments);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, username, "scrape job failed");
                        if let Some(mut entry) = statuses.get_mut(&task_id) {
                            entry.status = TaskState::Failed;
                            entry.completed_at = Some(Utc::now());
                            entry.error = Some(e.to_string());
                        }
                    }
                }
            }
        }
    }
    worker_alive.store(false, Ordering::Relaxed);
}

struct ScrapeResult {
    followers: Vec<InstagramFollower>,
    followings: Vec<InstagramFollower>,
    mutuals: Vec<InstagramFollower>,
    comments: serde_json::Value,
}

async fn process_scrape(
    orchestrator: &ScrapeOrchestrator,
    profiles: &dyn ProfileRepository,
    blobs: &dyn BlobStore,
    username: &str,
) -> crate::Result<ScrapeResult> {
    let username = &normalize_username(username);
    let mut profile = profiles
        .find_by_username(username)
        .await?
        .unwrap_or_else(|| crate::models::InstagramProfile::new(username));
    profile.parsing_status = ParseStatus::Processing;
    profile.parse_task_id = Some(make_task_id(username, Utc::now()));
    profile = profiles.upsert(profile).await?;

    let profile_id_str = profile.id.to_string();

    let followers = orchestrator
        .get_user_list(&profile_id_str, crate::scrape::UserListKind::Followers, 50)
        .await
        .unwrap_or_default();
    small_random_sleep().await;
    let followings = orchestrator
        .get_user_list(&profile_id_str, crate::scrape::UserListKind::Followings, 50)
        .await
        .unwrap_or_default();
    small_random_sleep().await;

    let mutuals = orchestrator.find_mutual_followers(&followers, &followings);
    let comments = orchestrator.collect_comments(username).await.unwrap_or_default();

    let mut selected: Vec<InstagramFollower> = if !mutuals.is_empty() {
        mutuals.clone()
    } else {
        let pool = if !followings.is_empty() { &followings } else { &followers };
        pick_up_to(pool, 20)
    };

    let mut local_paths: std::collections::HashMap<String, Option<String>> = std::collections::HashMap::new();
    if !selected.is_empty() {
        let items: Vec<(String, String)> = selected
            .iter()
            .filter_map(|f| f.profile_pic_url.clone().map(|url| (f.username.clone(), url)))
            .collect();
        local_paths = blobs.save_follower_avatars_batch(&items).await;
    }

    for follower in selected.iter_mut() {
        if let Some(path) = local_paths.get(&follower.username) {
            follower.profile_pic_url_local = path.clone();
        }
    }
    profiles.replace_followers(profile.id, selected).await?;

    profile.parsing_status = ParseStatus::Completed;
    profile.followers_parsed_at = Some(Utc::now());
    profile.followings_parsed_at = Some(Utc::now());
    profile.comments_data = Some(serde_json::to_value(&comments).unwrap_or(serde_json::Value::Null));
    profiles.upsert(profile).await?;

    Ok(ScrapeResult {
        followers,
        followings,
        mutuals,
        comments: serde_json::to_value(&comments).unwrap_or(serde_json::Value::Null),
    })
}

fn pick_up_to(pool: &[InstagramFollower], n: usize) -> Vec<InstagramFollower> {
    if pool.len() <= n {
        return pool.to_vec();
    }
    let mut rng = rand::thread_rng();
    let mut indices: Vec<usize> = (0..pool.len()).collect();
    for i in (1..indices.len()).rev() {
        let j = rng.gen_range(0..=i);
        indices.swap(i, j);
    }
    indices.into_iter().take(n).map(|i| pool[i].clone()).collect()
}

async fn small_random_sleep() {
    let millis = rand::thread_rng().gen_range(200..800);
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}
