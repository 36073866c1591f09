//! Scrape Orchestrator (C5): per-username workflows layered on top of the
//! resilient HTTP client (C1), credential rotation (C3), and the blob
//! store (C7). Every endpoint parse is tolerant: unexpected response
//! shapes are logged and degrade to an empty/default result rather than
//! propagating a parse error, since Instagram's private endpoints shift
//! shape without notice.

use reqwest::Method;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::blob_store::BlobStore;
use crate::config::RateLimiterConfig;
use crate::http_client::ResilientHttpClient;
use crate::models::InstagramFollower;
use crate::rate_limiter;

#[cfg(feature = "comments-fallback")]
use async_trait::async_trait;

/// Optional "session-id login" fallback for comment collection, enabled
/// only behind the `comments-fallback` feature. Absent by default; the
/// orchestrator never panics when no implementation is registered.
#[cfg(feature = "comments-fallback")]
#[async_trait]
pub trait CommentsFallback: Send + Sync {
    async fn fetch_comments(&self, shortcode: &str, limit: usize) -> crate::Result<Vec<Comment>>;
}

#[derive(Debug, Clone, Default)]
pub struct ProfileSummary {
    pub id: String,
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
    pub profile_pic_url: Option<String>,
    pub profile_pic_url_local: Option<String>,
    pub recent_media: Vec<MediaSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaSummary {
    pub shortcode: Option<String>,
    pub id: Option<String>,
    pub is_video: bool,
    pub taken_at: Option<i64>,
    pub comments_disabled: bool,
    pub comment_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MobileMediaSummary {
    pub pk: String,
    pub shortcode: Option<String>,
    pub comments_disabled: bool,
    pub comment_count: i64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub author_username: Option<String>,
    pub created_at: Option<i64>,
    pub post_url: Option<String>,
    pub post_image_url: Option<String>,
}

/// Usernames are lowercased and stripped of a leading `@` before any
/// lookup or cache key is derived from them (§4.5 edge-case policy).
pub fn normalize_username(username: &str) -> String {
    username.trim().trim_start_matches('@').to_lowercase()
}

pub enum UserListKind {
    Followers,
    Followings,
}

impl UserListKind {
    fn query_hash(&self) -> &'static str {
        match self {
            UserListKind::Followers => "c76146de99bb02f6415203be841dd25a",
            UserListKind::Followings => "d04b0a864b4b54837c0d870b0e77e076",
        }
    }

    fn edge_key(&self) -> &'static str {
        match self {
            UserListKind::Followers => "edge_followed_by",
            UserListKind::Followings => "edge_follow",
        }
    }
}

pub struct ScrapeOrchestrator {
    http: Arc<ResilientHttpClient>,
    blobs: Arc<dyn BlobStore>,
    rate_limiter_config: RateLimiterConfig,
    #[cfg(feature = "comments-fallback")]
    comments_fallback: Option<Arc<dyn CommentsFallback>>,
}

impl ScrapeOrchestrator {
    pub fn new(
        http: Arc<ResilientHttpClient>,
        blobs: Arc<dyn BlobStore>,
        rate_limiter_config: RateLimiterConfig,
    ) -> Self {
        Self {
            http,
            blobs,
            rate_limiter_config,
            #[cfg(feature = "comments-fallback")]
            comments_fallback: None,
        }
    }

    #[cfg(feature = "comments-fallback")]
    pub fn with_comments_fallback(mut self, fallback: Arc<dyn CommentsFallback>) -> Self {
        self.comments_fallback = Some(fallback);
        self
    }

    pub async fn get_profile(&self, username: &str) -> crate::Result<ProfileSummary> {
        let username = normalize_username(username);
        let url = format!(
            "https://i.instagram.com/api/v1/users/web_profile_info/?username={username}"
        );
        let headers = vec![("referer".to_string(), format!("https://www.instagram.com/{username}/"))];
        let body = self.http.request_with_headers(Method::GET, &url, &headers).await?;
        let json = body.into_json()?;

        let user = json.pointer("/data/user").cloned().unwrap_or(Value::Null);
        let mut profile = ProfileSummary {
            id: text(&user, "id").unwrap_or_default(),
            username: username.clone(),
            full_name: text(&user, "full_name"),
            biography: text(&user, "biography"),
            external_url: text(&user, "external_url"),
            followers_count: count(&user, "edge_followed_by"),
            following_count: count(&user, "edge_follow"),
            posts_count: count(&user, "edge_owner_to_timeline_media"),
            is_verified: boolean(&user, "is_verified"),
            is_private: boolean(&user, "is_private"),
            is_business: boolean(&user, "is_business_account"),
            profile_pic_url: text(&user, "profile_pic_url_hd").or_else(|| text(&user, "profile_pic_url")),
            profile_pic_url_local: None,
            recent_media: extract_recent_media(&user),
        };

        if let Some(avatar_url) = &profile.profile_pic_url {
            profile.profile_pic_url_local = self
                .blobs
                .save_profile_avatar(&profile.username, avatar_url)
                .await
                .unwrap_or(None);
        }

        Ok(profile)
    }

    pub async fn get_user_list(
        &self,
        user_id: &str,
        kind: UserListKind,
        max_count: usize,
    ) -> crate::Result<Vec<InstagramFollower>> {
        let max_count = max_count.max(1);
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        let page_size = 25u32;

        loop {
            let variables = serde_json::json!({
                "id": user_id,
                "first": page_size,
                "include_reel": true,
                "fetch_mutual": false,
                "after": after,
            });
            let url = format!(
                "https://www.instagram.com/graphql/query/?query_hash={}&variables={}",
                kind.query_hash(),
                urlencode(&variables.to_string())
            );

            let body = match self.http.request(Method::GET, &url).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "get_user_list request failed, stopping pagination");
                    break;
                }
            };
            let json = match body.into_json() {
                Ok(j) => j,
                Err(e) => {
                    warn!(error = %e, "get_user_list returned unexpected shape, stopping");
                    break;
                }
            };

            let edge_path = format!("/data/user/{}", kind.edge_key());
            let edge = match json.pointer(&edge_path) {
                Some(e) => e,
                None => {
                    debug!("get_user_list: edge not present, stopping");
                    break;
                }
            };

            let edges = edge.get("edges").and_then(|e| e.as_array()).cloned().unwrap_or_default();
            if edges.is_empty() {
                break;
            }

            for e in &edges {
                if let Some(node) = e.get("node") {
                    out.push(follower_from_node(node));
                    if out.len() >= max_count {
                        break;
                    }
                }
            }

            if out.len() >= max_count {
                break;
            }

            let has_next = edge
                .pointer("/page_info/has_next_page")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !has_next {
                break;
            }
            after = edge
                .pointer("/page_info/end_cursor")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if after.is_none() {
                break;
            }

            rate_limiter::throttle(&self.rate_limiter_config).await;
        }

        out.truncate(max_count);
        Ok(out)
    }

    pub fn find_mutual_followers(
        &self,
        followers: &[InstagramFollower],
        followings: &[InstagramFollower],
    ) -> Vec<InstagramFollower> {
        let following_pks: HashSet<&str> = followings.iter().map(|f| f.follower_pk.as_str()).collect();
        followers
            .iter()
            .filter(|f| following_pks.contains(f.follower_pk.as_str()))
            .cloned()
            .collect()
    }

    pub async fn get_recent_media_mobile(
        &self,
        user_id: &str,
        count: usize,
    ) -> crate::Result<Vec<MobileMediaSummary>> {
        let count = count.max(1);
        let url = format!("https://i.instagram.com/api/v1/feed/user/{user_id}/?count={count}");
        let body = match self.http.request(Method::GET, &url).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "mobile feed request failed");
                return Ok(Vec::new());
            }
        };
        let json = match body.into_json() {
            Ok(j) => j,
            Err(_) => return Ok(Vec::new()),
        };

        let items = json.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for item in items.into_iter().take(count) {
            // Carousel children are probed only when the root item carries no
            // image candidate of its own (§4.5 edge-case policy).
            let image_url = item
                .pointer("/image_versions2/candidates/0/url")
                .and_then(|v| v.as_str())
                .or_else(|| item.pointer("/carousel_media/0/image_versions2/candidates/0/url").and_then(|v| v.as_str()))
                .map(|s| s.to_string());

            out.push(MobileMediaSummary {
                pk: text(&item, "pk").unwrap_or_default(),
                shortcode: text(&item, "code"),
                comments_disabled: boolean(&item, "comments_disabled"),
                comment_count: count_number(&item, "comment_count"),
                image_url,
            });
        }
        Ok(out)
    }

    /// `ref_` is a numeric pk or a shortcode; shortcodes are resolved to a
    /// pk via a best-effort lookup before the mobile endpoint is tried.
    pub async fn get_comments_for_media(
        &self,
        ref_: &str,
        limit: usize,
        shortcode: Option<&str>,
    ) -> crate::Result<Vec<Comment>> {
        let limit = limit.max(1);
        let pk = if ref_.chars().all(|c| c.is_ascii_digit()) {
            ref_.to_string()
        } else {
            self.resolve_shortcode_to_pk(ref_).await.unwrap_or_else(|| ref_.to_string())
        };
        let shortcode = shortcode.map(|s| s.to_string()).or_else(|| {
            if !ref_.chars().all(|c| c.is_ascii_digit()) {
                Some(ref_.to_string())
            } else {
                None
            }
        });

        let mut comments = self.fetch_comments_mobile(&pk, limit).await;
        if comments.is_empty() {
            if let Some(code) = &shortcode {
                comments = self.fetch_comments_web(code, limit).await;
            }
        }

        if let Some(code) = &shortcode {
            let post_url = format!("https://www.instagram.com/p/{code}/");
            for c in &mut comments {
                c.post_url = Some(post_url.clone());
            }
        }

        if comments.is_empty() {
            comments = self.try_comments_fallback(shortcode.as_deref(), limit).await;
        }

        comments.truncate(limit);
        Ok(comments)
    }

    #[cfg(feature = "comments-fallback")]
    async fn try_comments_fallback(&self, shortcode: Option<&str>, limit: usize) -> Vec<Comment> {
        if let (Some(fallback), Some(code)) = (&self.comments_fallback, shortcode) {
            return fallback.fetch_comments(code, limit).await.unwrap_or_default();
        }
        Vec::new()
    }

    #[cfg(not(feature = "comments-fallback"))]
    async fn try_comments_fallback(&self, _shortcode: Option<&str>, _limit: usize) -> Vec<Comment> {
        Vec::new()
    }

    async fn resolve_shortcode_to_pk(&self, shortcode: &str) -> Option<String> {
        let url = format!("https://i.instagram.com/api/v1/oembed/?url=https://www.instagram.com/p/{shortcode}/");
        let body = self.http.request(Method::GET, &url).await.ok()?;
        let json = body.into_json().ok()?;
        text(&json, "media_id")
    }

    async fn fetch_comments_mobile(&self, pk: &str, limit: usize) -> Vec<Comment> {
        let url = format!("https://i.instagram.com/api/v1/media/{pk}/comments/");
        let Ok(body) = self.http.request(Method::GET, &url).await else {
            return Vec::new();
        };
        let Ok(json) = body.into_json() else {
            return Vec::new();
        };
        parse_comments(&json, "comments", limit)
    }

    async fn fetch_comments_web(&self, shortcode: &str, limit: usize) -> Vec<Comment> {
        let url = format!("https://www.instagram.com/p/{shortcode}/comments/");
        let headers = vec![("referer".to_string(), format!("https://www.instagram.com/p/{shortcode}/"))];
        let Ok(body) = self.http.request_with_headers(Method::GET, &url, &headers).await else {
            return Vec::new();
        };
        let Ok(json) = body.into_json() else {
            return Vec::new();
        };
        parse_comments(&json, "comments", limit)
    }

    /// Fetches the profile, then up to 12 recent media; for each media
    /// whose comments are enabled, requests up to `5 - already_collected`
    /// comments until 5 are accumulated across posts.
    pub async fn collect_comments(&self, username: &str) -> crate::Result<Vec<Comment>> {
        const TARGET: usize = 5;
        const MAX_MEDIA: usize = 12;

        let profile = self.get_profile(username).await?;
        let media = self.get_recent_media_mobile(&profile.id, MAX_MEDIA).await?;

        let mut collected = Vec::new();
        for item in media.into_iter().take(MAX_MEDIA) {
            if collected.len() >= TARGET {
                break;
            }
            if item.comments_disabled {
                continue;
            }
            let remaining = TARGET - collected.len();
            let mut comments = self
                .get_comments_for_media(&item.pk, remaining, item.shortcode.as_deref())
                .await
                .unwrap_or_default();
            for c in &mut comments {
                c.post_image_url = item.image_url.clone();
            }
            collected.extend(comments);
        }

        collected.truncate(TARGET);
        Ok(collected)
    }
}

fn extract_recent_media(user: &Value) -> Vec<MediaSummary> {
    let edges = user
        .pointer("/edge_owner_to_timeline_media/edges")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    edges
        .into_iter()
        .filter_map(|e| e.get("node").cloned())
        .map(|node| MediaSummary {
            shortcode: text(&node, "shortcode"),
            id: text(&node, "id"),
            is_video: boolean(&node, "is_video"),
            taken_at: node.get("taken_at_timestamp").and_then(|v| v.as_i64()),
            comments_disabled: boolean(&node, "comments_disabled"),
            comment_count: node.pointer("/edge_media_to_comment/count").and_then(|v| v.as_i64()).unwrap_or(0),
        })
        .collect()
}

fn follower_from_node(node: &Value) -> InstagramFollower {
    InstagramFollower {
        id: 0,
        profile_id: 0,
        follower_pk: text(node, "id").unwrap_or_default(),
        username: text(node, "username").unwrap_or_default(),
        full_name: text(node, "full_name"),
        profile_pic_url: text(node, "profile_pic_url"),
        profile_pic_url_local: None,
        is_verified: boolean(node, "is_verified"),
        is_private: boolean(node, "is_private"),
        has_anonymous_profile_picture: boolean(node, "has_anonymous_profile_picture"),
        fbid_v2: text(node, "fbid_v2"),
        third_party_downloads_enabled: boolean(node, "third_party_downloads_enabled"),
        latest_reel_media: node.get("latest_reel_media").map(|v| v.to_string()),
    }
}

fn parse_comments(json: &Value, key: &str, limit: usize) -> Vec<Comment> {
    json.get(key)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .take(limit)
        .map(|c| Comment {
            id: text(&c, "pk").or_else(|| text(&c, "id")).unwrap_or_default(),
            text: text(&c, "text").unwrap_or_default(),
            author_username: c.pointer("/user/username").and_then(|v| v.as_str()).map(|s| s.to_string()),
            created_at: c.get("created_at").and_then(|v| v.as_i64()),
            post_url: None,
            post_image_url: None,
        })
        .collect()
}

fn text(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| {
        if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else if v.is_number() {
            Some(v.to_string())
        } else {
            None
        }
    })
}

fn boolean(value: &Value, key: &str) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn count(value: &Value, edge_key: &str) -> i64 {
    value.pointer(&format!("/{edge_key}/count")).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn count_number(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
