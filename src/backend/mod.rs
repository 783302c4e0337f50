//! The capability the orchestrator drives: upload, detect, match. Chosen once
//! per session, either against a live backend or fully local.

pub mod remote;
pub mod simulated;

pub use remote::RemoteBackend;
pub use simulated::SimulatedBackend;

use crate::models::Product;
use crate::poller::{PollError, ProgressUpdate};
use crate::request::RequestError;
use crate::session::{VideoFormat, VideoHandle};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    Simulated,
}

#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub video: &'a VideoHandle,
    pub format: VideoFormat,
    pub title: &'a str,
    pub description: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    pub objects: Vec<String>,
    /// Products the status endpoint already matched, if any.
    pub products: Vec<Product>,
    pub polls: u32,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("upload failed: {0}")]
    Upload(RequestError),
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("detection did not finish in time: {0}")]
    PollTimeout(PollError),
    #[error("matching failed: {0}")]
    Match(RequestError),
    #[error("cancelled")]
    Cancelled,
}

pub type ProgressFn<'a> = &'a mut (dyn FnMut(&ProgressUpdate) + Send);

#[async_trait]
pub trait BackendStrategy: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Uploads the video and returns the job identifier.
    async fn upload(
        &self,
        request: &UploadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError>;

    /// Waits for the job to finish and returns the detected object names.
    async fn detect(
        &self,
        job_id: &str,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, BackendError>;

    async fn match_products(
        &self,
        objects: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, BackendError>;
}
