//! Persistence boundary. The orchestrator needs four things from a store:
//! create a video record, read records back, update the final match fields and
//! know who the current user is. Every provider answers with `StoreResult`.

use crate::session::MatchType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("record {0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Fields written when a session starts persisting.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewVideo {
    pub user_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub video_uri: String,
    pub job_id: Option<String>,
    pub detected_objects: Vec<String>,
    pub simulated: bool,
}

/// The confirmed match written back onto an existing record.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FinalMatchUpdate {
    pub product_name: String,
    pub affiliate_link: Option<String>,
    pub match_type: MatchType,
    pub detected_object: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub video_uri: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub detected_objects: Vec<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub affiliate_link: Option<String>,
    #[serde(default)]
    pub match_type: Option<MatchType>,
    #[serde(default)]
    pub detected_object: Option<String>,
    #[serde(default)]
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn create_video(&self, video: &NewVideo) -> StoreResult<VideoRecord>;

    /// Records owned by `user_id`, newest first; all records when `None`.
    async fn list_videos(&self, user_id: Option<&str>) -> StoreResult<Vec<VideoRecord>>;

    async fn get_video(&self, id: &str) -> StoreResult<Option<VideoRecord>>;

    async fn update_final_match(&self, id: &str, update: &FinalMatchUpdate) -> StoreResult<VideoRecord>;

    async fn current_user(&self) -> StoreResult<Option<UserIdentity>>;

    async fn set_current_user(&self, user: Option<UserIdentity>) -> StoreResult<()>;
}

/// Process-local store used by tests, demos and the bridge when no database is
/// configured.
#[derive(Default)]
pub struct MemoryStore {
    videos: RwLock<Vec<VideoRecord>>,
    user: RwLock<Option<UserIdentity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VideoStore for MemoryStore {
    async fn create_video(&self, video: &NewVideo) -> StoreResult<VideoRecord> {
        let record = VideoRecord {
            id: Uuid::new_v4().to_string(),
            user_id: video.user_id.clone(),
            title: video.title.clone(),
            description: video.description.clone(),
            video_uri: video.video_uri.clone(),
            job_id: video.job_id.clone(),
            detected_objects: video.detected_objects.clone(),
            product_name: None,
            affiliate_link: None,
            match_type: None,
            detected_object: None,
            simulated: video.simulated,
            created_at: Utc::now(),
        };
        self.videos.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_videos(&self, user_id: Option<&str>) -> StoreResult<Vec<VideoRecord>> {
        let videos = self.videos.read().await;
        let mut out: Vec<VideoRecord> = videos
            .iter()
            .filter(|v| user_id.is_none_or(|uid| v.user_id.as_deref() == Some(uid)))
            .cloned()
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn get_video(&self, id: &str) -> StoreResult<Option<VideoRecord>> {
        Ok(self.videos.read().await.iter().find(|v| v.id == id).cloned())
    }

    async fn update_final_match(&self, id: &str, update: &FinalMatchUpdate) -> StoreResult<VideoRecord> {
        let mut videos = self.videos.write().await;
        let record = videos
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.product_name = Some(update.product_name.clone());
        record.affiliate_link = update.affiliate_link.clone();
        record.match_type = Some(update.match_type);
        record.detected_object = update.detected_object.clone();
        Ok(record.clone())
    }

    async fn current_user(&self) -> StoreResult<Option<UserIdentity>> {
        Ok(self.user.read().await.clone())
    }

    async fn set_current_user(&self, user: Option<UserIdentity>) -> StoreResult<()> {
        *self.user.write().await = user;
        Ok(())
    }
}

/// PostgREST adapter for a Supabase `videos` table.
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    table: String,
    http: Client,
    user: RwLock<Option<UserIdentity>>,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_key: &str, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            table: "videos".into(),
            http,
            user: RwLock::new(None),
        }
    }

    pub fn from_env(http: Client) -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let mut store = Self::new(&base_url, &service_key, http);
        if let Some(table) = std::env::var("SUPABASE_VIDEOS_TABLE")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
        {
            store.table = table;
        }
        Some(store)
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn rows(&self, builder: RequestBuilder) -> StoreResult<Vec<VideoRecord>> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(target = "shoppable.storage", status = status.as_u16(), body = %body, "postgrest_error");
            return Err(StoreError::Request(format!("HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl VideoStore for SupabaseStore {
    async fn create_video(&self, video: &NewVideo) -> StoreResult<VideoRecord> {
        let request = self
            .http
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .json(video);
        let mut rows = self.rows(request).await?;
        debug!(target = "shoppable.storage", rows = rows.len(), "video_created");
        rows.pop()
            .ok_or_else(|| StoreError::Deserialize("insert returned no rows".into()))
    }

    async fn list_videos(&self, user_id: Option<&str>) -> StoreResult<Vec<VideoRecord>> {
        let mut url = format!("{}?select=*&order=created_at.desc", self.table_url());
        if let Some(user_id) = user_id {
            url.push_str(&format!("&user_id=eq.{}", urlencoding::encode(user_id)));
        }
        self.rows(self.http.get(url)).await
    }

    async fn get_video(&self, id: &str) -> StoreResult<Option<VideoRecord>> {
        let url = format!(
            "{}?id=eq.{}&select=*&limit=1",
            self.table_url(),
            urlencoding::encode(id)
        );
        let mut rows = self.rows(self.http.get(url)).await?;
        Ok(rows.pop())
    }

    async fn update_final_match(&self, id: &str, update: &FinalMatchUpdate) -> StoreResult<VideoRecord> {
        let url = format!("{}?id=eq.{}", self.table_url(), urlencoding::encode(id));
        let request = self
            .http
            .patch(url)
            .header("Prefer", "return=representation")
            .json(update);
        let mut rows = self.rows(request).await?;
        rows.pop().ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    // Identity lives with the client session, PostgREST only sees the service key.
    async fn current_user(&self) -> StoreResult<Option<UserIdentity>> {
        Ok(self.user.read().await.clone())
    }

    async fn set_current_user(&self, user: Option<UserIdentity>) -> StoreResult<()> {
        *self.user.write().await = user;
        Ok(())
    }
}

/// Supabase when configured, otherwise in-memory.
pub fn store_from_env(http: Client) -> Arc<dyn VideoStore> {
    match SupabaseStore::from_env(http) {
        Some(store) => Arc::new(store),
        None => {
            debug!(target = "shoppable.storage", "supabase_not_configured");
            Arc::new(MemoryStore::new())
        }
    }
}
