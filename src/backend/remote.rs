use super::{BackendError, BackendKind, BackendStrategy, DetectionResult, ProgressFn, UploadRequest};
use crate::api::BackendApi;
use crate::config::PollPolicy;
use crate::models::{Product, UploadMetadata};
use crate::poller::{PollError, poll_until_terminal};
use crate::request::{FilePayload, RequestError};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct RemoteBackend {
    api: BackendApi,
    poll: PollPolicy,
    prefer_file_upload: bool,
}

impl RemoteBackend {
    pub fn new(api: BackendApi, poll: PollPolicy, prefer_file_upload: bool) -> Self {
        Self {
            api,
            poll,
            prefer_file_upload,
        }
    }

    async fn file_payload(request: &UploadRequest<'_>) -> Result<Option<FilePayload>, RequestError> {
        let Some(path) = request.video.local_path.as_ref() else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| RequestError::Invalid(format!("cannot read {}: {err}", path.display())))?;
        let mut fields = vec![
            ("title".to_string(), request.title.to_string()),
            ("durationSecs".to_string(), request.video.duration_secs.to_string()),
        ];
        if let Some(description) = request.description {
            fields.push(("description".to_string(), description.to_string()));
        }
        Ok(Some(FilePayload {
            field: "video",
            file_name: request.video.file_name.clone(),
            mime: request.format.mime().to_string(),
            bytes,
            fields,
        }))
    }
}

#[async_trait]
impl BackendStrategy for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn upload(
        &self,
        request: &UploadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let payload = if self.prefer_file_upload {
            Self::file_payload(request).await.map_err(BackendError::Upload)?
        } else {
            None
        };

        let uploaded = match payload {
            Some(payload) => {
                debug!(target = "shoppable.backend", bytes = payload.bytes.len(), "uploading_file");
                self.api.upload_file(&payload, cancel).await
            }
            None => {
                let metadata = UploadMetadata {
                    title: request.title.to_string(),
                    description: request.description.map(str::to_string),
                    uri: request.video.uri.clone(),
                    file_name: request.video.file_name.clone(),
                    size_bytes: request.video.size_bytes,
                    duration_secs: request.video.duration_secs,
                };
                self.api.upload_metadata(&metadata, cancel).await
            }
        };

        match uploaded {
            Ok(job_id) => {
                info!(target = "shoppable.backend", job_id = %job_id, base_url = %self.api.base_url(), "video_uploaded");
                Ok(job_id)
            }
            Err(RequestError::Cancelled) => Err(BackendError::Cancelled),
            Err(err) => Err(BackendError::Upload(err)),
        }
    }

    async fn detect(
        &self,
        job_id: &str,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, BackendError> {
        let outcome = match poll_until_terminal(&self.api, job_id, self.poll, cancel, on_progress).await {
            Ok(outcome) => outcome,
            Err(PollError::Cancelled) => return Err(BackendError::Cancelled),
            Err(err @ PollError::Timeout { .. }) => return Err(BackendError::PollTimeout(err)),
            Err(err) => return Err(BackendError::Detection(err.to_string())),
        };

        let objects = match outcome.snapshot.detected_objects {
            Some(objects) => objects,
            None => match self.api.detect_objects(job_id, cancel).await {
                Ok(objects) => objects,
                Err(RequestError::Cancelled) => return Err(BackendError::Cancelled),
                Err(err) => return Err(BackendError::Detection(err.to_string())),
            },
        };

        Ok(DetectionResult {
            objects,
            products: outcome.snapshot.matched_products.unwrap_or_default(),
            polls: outcome.polls,
        })
    }

    async fn match_products(
        &self,
        objects: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, BackendError> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        match self.api.match_products(objects, cancel).await {
            Ok(products) => Ok(products),
            Err(RequestError::Cancelled) => Err(BackendError::Cancelled),
            Err(err) => Err(BackendError::Match(err)),
        }
    }
}
