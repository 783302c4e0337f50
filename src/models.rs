use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Every backend response carries a `success` flag and an optional error
/// message alongside its payload.
pub trait Envelope {
    fn success(&self) -> bool;
    fn error_message(&self) -> Option<&str>;
}

macro_rules! envelope {
    ($ty:ty) => {
        impl Envelope for $ty {
            fn success(&self) -> bool {
                self.success
            }

            fn error_message(&self) -> Option<&str> {
                self.error.as_deref()
            }
        }
    };
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub title: String,
    pub description: Option<String>,
    pub uri: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
envelope!(UploadResponse);

#[derive(Debug, Clone, Deserialize)]
pub struct DetectResponse {
    pub success: bool,
    #[serde(default)]
    pub objects: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}
envelope!(DetectResponse);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub detected_objects: Option<Vec<String>>,
    #[serde(default)]
    pub matched_products: Option<Vec<Product>>,
    #[serde(default)]
    pub error: Option<String>,
}
envelope!(StatusResponse);

#[derive(Debug, Clone, Serialize)]
pub struct MatchRequest<'a> {
    pub objects: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchResponse {
    pub success: bool,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub error: Option<String>,
}
envelope!(MatchResponse);

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub affiliate_link: Option<String>,
    /// Detected object this product was matched against, when the backend says.
    #[serde(default)]
    pub matched_object: Option<String>,
}

impl Product {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            brand: None,
            price: None,
            image_url: None,
            affiliate_link: None,
            matched_object: None,
        }
    }
}

/// Normalised job status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    /// Unknown labels are treated as still processing; only explicit markers end a poll.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "completed" | "complete" | "done" | "success" => JobStatus::Completed,
            "error" | "failed" | "failure" => JobStatus::Error,
            "pending" | "queued" | "uploaded" => JobStatus::Pending,
            _ => JobStatus::Processing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

/// One status observation, decoupled from the wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub label: String,
    pub progress: Option<f32>,
    pub detected_objects: Option<Vec<String>>,
    pub matched_products: Option<Vec<Product>>,
    pub error: Option<String>,
}

impl From<StatusResponse> for StatusSnapshot {
    fn from(value: StatusResponse) -> Self {
        Self {
            status: JobStatus::from_label(&value.status),
            label: value.status,
            progress: value.progress.map(|p| p.clamp(0.0, 100.0)),
            detected_objects: value.detected_objects,
            matched_products: value.matched_products,
            error: value.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
