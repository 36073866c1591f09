//! Profile Cache Policy (C8): freshness semantics layered over the
//! abstract profile repository.

use chrono::Utc;
use std::sync::Arc;

use crate::models::{InstagramProfile, ParseStatus};
use crate::persistence::ProfileRepository;
use crate::scrape::normalize_username;

pub struct ProfileCache {
    repo: Arc<dyn ProfileRepository>,
    ttl: chrono::Duration,
}

impl ProfileCache {
    pub fn new(repo: Arc<dyn ProfileRepository>, ttl: chrono::Duration) -> Self {
        Self { repo, ttl }
    }

    /// `fresh = last_scraped ≠ null ∧ (now − last_scraped) < TTL`.
    pub async fn lookup(&self, username: &str) -> crate::Result<(Option<InstagramProfile>, bool)> {
        let username = &normalize_username(username);
        let profile = self.repo.find_by_username(username).await?;
        let fresh = profile
            .as_ref()
            .map(|p| p.is_fresh(Utc::now(), self.ttl))
            .unwrap_or(false);
        Ok((profile, fresh))
    }

    pub async fn upsert(&self, mut patch: InstagramProfile) -> crate::Result<InstagramProfile> {
        patch.username = normalize_username(&patch.username);
        let existing = self.repo.find_by_username(&patch.username).await?;
        let scrape_count = existing.as_ref().map(|p| p.scrape_count).unwrap_or(0);
        patch.last_scraped = Some(Utc::now());
        patch.scrape_count = scrape_count + 1;
        patch.is_data_fresh = true;
        self.repo.upsert(patch).await
    }

    pub async fn mark_stale(&self, username: &str) -> crate::Result<()> {
        let username = &normalize_username(username);
        if let Some(mut profile) = self.repo.find_by_username(username).await? {
            profile.is_data_fresh = false;
            self.repo.upsert(profile).await?;
        }
        Ok(())
    }

    pub async fn set_parse_status(
        &self,
        username: &str,
        status: ParseStatus,
        task_id: Option<String>,
    ) -> crate::Result<()> {
        let username = &normalize_username(username);
        if let Some(mut profile) = self.repo.find_by_username(username).await? {
            profile.parsing_status = status;
            if let Some(id) = task_id {
                profile.parse_task_id = Some(id);
            }
            if status == ParseStatus::Completed {
                let now = Utc::now();
                profile.followers_parsed_at = Some(now);
                profile.followings_parsed_at = Some(now);
            }
            self.repo.upsert(profile).await?;
        }
        Ok(())
    }
}
