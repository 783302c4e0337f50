use serde::Deserialize;
use std::{env, path::Path, time::Duration};
use thiserror::Error;
use tracing::warn;

const DEFAULT_FALLBACK_URLS: &[&str] = &[
    "http://localhost:3001",
    "http://127.0.0.1:3001",
    "http://10.0.2.2:3001",
];

/// Runtime knobs for the ingestion client. Built once per process and shared by
/// every session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Candidate backend addresses in preference order (production first).
    pub candidates: Vec<String>,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub upload_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    pub limits: VideoLimits,
    pub variant: VariantConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base_delay * n` before re-sending.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub budget: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoLimits {
    pub max_bytes: u64,
    pub max_duration_secs: f64,
}

impl Default for VideoLimits {
    fn default() -> Self {
        Self {
            max_bytes: 500 * 1024 * 1024,
            max_duration_secs: 300.0,
        }
    }
}

/// Per-screen behaviour of the orchestrator. Variants differ only in
/// configuration, never in code.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VariantConfig {
    pub name: String,
    pub include_tracking: bool,
    pub default_choice: DefaultChoice,
    pub prefer_file_upload: bool,
    /// Fixed seed for the simulated pipeline; per-session seeds otherwise.
    pub simulation_seed: Option<u64>,
    /// Pause between simulated processing steps, so demo progress is visible.
    pub simulated_step_ms: u64,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self {
            name: "standard".into(),
            include_tracking: true,
            default_choice: DefaultChoice::ManualFirst,
            prefer_file_upload: true,
            simulation_seed: None,
            simulated_step_ms: 400,
        }
    }
}

/// Which candidate source wins when a flow confirms without a user pick.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultChoice {
    #[default]
    ManualFirst,
    DirectFirst,
    SuggestionFirst,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read variant file {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid variant file {path}: {message}")]
    Parse { path: String, message: String },
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_FALLBACK_URLS.iter().map(|s| s.to_string()).collect(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            limits: VideoLimits::default(),
            variant: VariantConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut candidates = Vec::new();
        if let Some(primary) = env_string("SHOPPABLE_API_URL") {
            candidates.push(primary);
        }
        match env_string("SHOPPABLE_FALLBACK_URLS") {
            Some(raw) => candidates.extend(split_urls(&raw)),
            None => candidates.extend(DEFAULT_FALLBACK_URLS.iter().map(|s| s.to_string())),
        }
        let candidates = normalize_candidates(candidates);

        let variant = match env_string("SHOPPABLE_VARIANT_FILE") {
            Some(path) => VariantConfig::from_yaml_file(&path).unwrap_or_else(|err| {
                warn!(target = "shoppable.config", error = %err, "variant_file_ignored");
                VariantConfig::default()
            }),
            None => VariantConfig::default(),
        };

        Self {
            candidates,
            probe_timeout: Duration::from_secs(env_u64("PROBE_TIMEOUT_SECS", 5)),
            request_timeout: Duration::from_secs(env_u64("REQUEST_TIMEOUT_SECS", 30)),
            upload_timeout: Duration::from_secs(env_u64("UPLOAD_TIMEOUT_SECS", 120)),
            connect_timeout: Duration::from_secs(env_u64("HTTP_CONNECT_TIMEOUT_SECS", 5)),
            retry: RetryPolicy {
                max_retries: env::var("REQUEST_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(2),
                base_delay: Duration::from_millis(env_u64("RETRY_DELAY_MS", 1000)),
            },
            poll: PollPolicy {
                interval: Duration::from_secs(env_u64("POLL_INTERVAL_SECS", 2)),
                budget: Duration::from_secs(env_u64("POLL_BUDGET_SECS", 300)),
            },
            limits: VideoLimits {
                max_bytes: env_u64("MAX_VIDEO_BYTES", 500 * 1024 * 1024),
                max_duration_secs: env_u64("MAX_VIDEO_DURATION_SECS", 300) as f64,
            },
            variant,
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = normalize_candidates(candidates);
        self
    }
}

impl VariantConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\n', '\t'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_candidates(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
