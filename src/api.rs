use crate::models::{
    DetectResponse, Envelope, JobStatus, MatchRequest, MatchResponse, Product, StatusResponse,
    StatusSnapshot, UploadMetadata, UploadResponse,
};
use crate::request::{FilePayload, RequestClient, RequestError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use urlencoding::encode;

/// Typed calls against one resolved processing backend.
#[derive(Debug, Clone)]
pub struct BackendApi {
    client: RequestClient,
    base_url: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl BackendApi {
    pub fn new(
        client: RequestClient,
        base_url: impl Into<String>,
        request_timeout: Duration,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            upload_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Metadata-only upload (the video is already reachable at `uri`).
    pub async fn upload_metadata(
        &self,
        metadata: &UploadMetadata,
        cancel: &CancellationToken,
    ) -> Result<String, RequestError> {
        let url = format!("{}/videos/upload", self.base_url);
        let response: UploadResponse = self
            .client
            .post_json("upload", &url, metadata, self.request_timeout, cancel)
            .await?;
        video_id_from(accept(response)?)
    }

    pub async fn upload_file(
        &self,
        payload: &FilePayload,
        cancel: &CancellationToken,
    ) -> Result<String, RequestError> {
        let url = format!("{}/videos/upload-file", self.base_url);
        let response: UploadResponse = self
            .client
            .post_multipart("upload_file", &url, payload, self.upload_timeout, cancel)
            .await?;
        video_id_from(accept(response)?)
    }

    pub async fn detect_objects(
        &self,
        video_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RequestError> {
        let url = format!("{}/videos/{}/detect-objects", self.base_url, encode(video_id));
        let response: DetectResponse = self
            .client
            .post_json("detect_objects", &url, &serde_json::json!({}), self.request_timeout, cancel)
            .await?;
        Ok(accept(response)?.objects.unwrap_or_default())
    }

    /// A `success: false` status body is reported as an error marker rather than
    /// a request failure so the poller can stop on it.
    pub async fn status(
        &self,
        video_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StatusSnapshot, RequestError> {
        let url = format!("{}/videos/{}/status", self.base_url, encode(video_id));
        let response: StatusResponse = self
            .client
            .get_json("status", &url, self.request_timeout, cancel)
            .await?;
        let success = response.success;
        let mut snapshot = StatusSnapshot::from(response);
        if !success {
            snapshot.status = JobStatus::Error;
        }
        Ok(snapshot)
    }

    pub async fn match_products(
        &self,
        objects: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, RequestError> {
        let url = format!("{}/products/match", self.base_url);
        let response: MatchResponse = self
            .client
            .post_json(
                "match_products",
                &url,
                &MatchRequest { objects },
                self.request_timeout,
                cancel,
            )
            .await?;
        Ok(accept(response)?.products)
    }
}

fn accept<T: Envelope>(payload: T) -> Result<T, RequestError> {
    if payload.success() {
        Ok(payload)
    } else {
        Err(RequestError::Rejected(
            payload
                .error_message()
                .unwrap_or("unspecified backend error")
                .to_string(),
        ))
    }
}

fn video_id_from(response: UploadResponse) -> Result<String, RequestError> {
    response
        .video_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RequestError::Decode("upload response has no videoId".into()))
}
