//! Parser Config Store (C13): a JSON document on disk holding cookies,
//! user-agent bindings, and scrape timings, editable at runtime. Writes
//! are last-write-wins and rewritten atomically (write temp → rename);
//! reads go through an in-memory copy refreshed on every write, since
//! only this process ever mutates the file (§5).

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{info, warn};

#[derive(Debug, ThisError)]
pub enum ParserConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cookie index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("refusing to remove the last remaining cookie")]
    LastCookie,
    #[error("empty or invalid cookie value")]
    InvalidCookie,
}

impl From<ParserConfigError> for crate::Error {
    fn from(e: ParserConfigError) -> Self {
        match e {
            ParserConfigError::Io(io) => crate::Error::Io(io),
            ParserConfigError::Serde(err) => crate::Error::Serialization(err),
            other => crate::Error::validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAgentBinding {
    pub user_agent: String,
    pub ds_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timings {
    pub base_delay: f64,
    pub timeout: u64,
    pub max_retries: u32,
    pub page_size: u32,
    pub max_followers: u32,
    pub max_followings: u32,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub additional_delay_min: f64,
    pub additional_delay_max: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            base_delay: 15.0,
            timeout: 55,
            max_retries: 5,
            page_size: 25,
            max_followers: 50,
            max_followings: 50,
            jitter_min: 0.0,
            jitter_max: 7.5,
            additional_delay_min: 1.0,
            additional_delay_max: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParserConfigDocument {
    #[serde(default)]
    pub cookies: Vec<String>,
    #[serde(default)]
    pub user_agents: Vec<UserAgentBinding>,
    #[serde(default)]
    pub timings: Timings,
}

impl Default for ParserConfigDocument {
    fn default() -> Self {
        Self {
            cookies: vec!["placeholder-cookie".to_string()],
            user_agents: Vec::new(),
            timings: Timings::default(),
        }
    }
}

pub struct ParserConfigStore {
    path: PathBuf,
    current: ArcSwap<ParserConfigDocument>,
}

impl ParserConfigStore {
    /// Loads the document from `path`, writing out the defaults first if
    /// the file doesn't exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ParserConfigError> {
        let path = path.into();
        let document = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            info!(path = %path.display(), "parser config file not found, writing defaults");
            let defaults = ParserConfigDocument::default();
            write_atomic(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            current: ArcSwap::from_pointee(document),
        })
    }

    pub fn get_all(&self) -> Arc<ParserConfigDocument> {
        self.current.load_full()
    }

    pub fn get_cookies(&self) -> Vec<String> {
        self.current.load().cookies.clone()
    }

    pub fn get_timings(&self) -> Timings {
        self.current.load().timings.clone()
    }

    /// First user-agent bound to `cookie`, or a generic default if this
    /// cookie has never been bound yet.
    pub fn user_agent_for_cookie(&self, cookie: &str) -> String {
        self.current
            .load()
            .user_agents
            .iter()
            .find(|b| b.ds_user_id == cookie_identity(cookie))
            .map(|b| b.user_agent.clone())
            .unwrap_or_else(default_user_agent)
    }

    pub fn add_cookie(&self, cookie: String) -> Result<bool, ParserConfigError> {
        if cookie.trim().is_empty() {
            return Err(ParserConfigError::InvalidCookie);
        }
        self.mutate(|doc| {
            if doc.cookies.contains(&cookie) {
                return Ok(false);
            }
            doc.cookies.push(cookie.clone());
            Ok(true)
        })
    }

    pub fn remove_cookie(&self, index: usize) -> Result<bool, ParserConfigError> {
        self.mutate(|doc| {
            if index >= doc.cookies.len() {
                return Err(ParserConfigError::IndexOutOfRange(index));
            }
            if doc.cookies.len() <= 1 {
                return Err(ParserConfigError::LastCookie);
            }
            doc.cookies.remove(index);
            Ok(true)
        })
    }

    pub fn update_cookie(&self, index: usize, cookie: String) -> Result<bool, ParserConfigError> {
        if cookie.trim().is_empty() {
            return Err(ParserConfigError::InvalidCookie);
        }
        self.mutate(|doc| {
            if index >= doc.cookies.len() {
                return Err(ParserConfigError::IndexOutOfRange(index));
            }
            doc.cookies[index] = cookie.clone();
            Ok(true)
        })
    }

    pub fn update_user_agents(&self, bindings: Vec<UserAgentBinding>) -> Result<(), ParserConfigError> {
        self.mutate(|doc| {
            doc.user_agents = bindings.clone();
            Ok(())
        })
    }

    /// Partial merge: only the timing fields named in `patch` change.
    pub fn update_timings(&self, patch: serde_json::Value) -> Result<(), ParserConfigError> {
        self.mutate(|doc| {
            let mut current = serde_json::to_value(&doc.timings)?;
            merge_json(&mut current, &patch);
            doc.timings = serde_json::from_value(current)?;
            Ok(())
        })
    }

    pub fn reset_to_defaults(&self) -> Result<(), ParserConfigError> {
        let defaults = ParserConfigDocument::default();
        write_atomic(&self.path, &defaults)?;
        self.current.store(Arc::new(defaults));
        warn!("parser config reset to defaults");
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut ParserConfigDocument) -> Result<T, ParserConfigError>,
    ) -> Result<T, ParserConfigError> {
        let mut doc = (*self.current.load_full()).clone();
        let result = f(&mut doc)?;
        write_atomic(&self.path, &doc)?;
        self.current.store(Arc::new(doc));
        Ok(result)
    }
}

fn cookie_identity(cookie: &str) -> String {
    // Cookies carry a ds_user_id=<id> field; fall back to the whole
    // string so unrecognized shapes still bind consistently.
    cookie
        .split(';')
        .find_map(|part| part.trim().strip_prefix("ds_user_id="))
        .map(|s| s.to_string())
        .unwrap_or_else(|| cookie.to_string())
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; igscrape/1.0)".to_string()
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            base_map.insert(key.clone(), value.clone());
        }
    }
}

fn write_atomic(path: &Path, document: &ParserConfigDocument) -> Result<(), ParserConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    let contents = serde_json::to_string_pretty(document)?;
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("parser_config.json");
        let store = ParserConfigStore::new(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.get_cookies().len(), 1);
    }

    #[test]
    fn update_cookie_round_trips() {
        let dir = tempdir().unwrap();
        let store = ParserConfigStore::new(dir.path().join("c.json")).unwrap();
        store.update_cookie(0, "new-cookie".to_string()).unwrap();
        assert_eq!(store.get_cookies()[0], "new-cookie");
    }

    #[test]
    fn cannot_remove_last_cookie() {
        let dir = tempdir().unwrap();
        let store = ParserConfigStore::new(dir.path().join("c.json")).unwrap();
        let err = store.remove_cookie(0).unwrap_err();
        assert!(matches!(err, ParserConfigError::LastCookie));
    }

    #[test]
    fn remove_cookie_keeps_at_least_one() {
        let dir = tempdir().unwrap();
        let store = ParserConfigStore::new(dir.path().join("c.json")).unwrap();
        store.add_cookie("second".to_string()).unwrap();
        assert!(store.remove_cookie(0).unwrap());
        assert_eq!(store.get_cookies().len(), 1);
        assert!(store.remove_cookie(0).is_err());
    }

    #[test]
    fn update_timings_merges_partial_patch() {
        let dir = tempdir().unwrap();
        let store = ParserConfigStore::new(dir.path().join("c.json")).unwrap();
        store
            .update_timings(serde_json::json!({ "base_delay": 30.0 }))
            .unwrap();
        let timings = store.get_timings();
        assert_eq!(timings.base_delay, 30.0);
        assert_eq!(timings.page_size, 25);
    }

    #[test]
    fn reload_from_disk_sees_persisted_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        {
            let store = ParserConfigStore::new(&path).unwrap();
            store.add_cookie("persisted".to_string()).unwrap();
        }
        let reloaded = ParserConfigStore::new(&path).unwrap();
        assert!(reloaded.get_cookies().contains(&"persisted".to_string()));
    }
}
