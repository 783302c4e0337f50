//! Single logical requests with an enforced deadline and a bounded retry loop.
//!
//! Only timeout-class failures (deadline expiry, connection/transport errors)
//! are retried. Everything else, such as a non-2xx status or an undecodable
//! body, is returned on the first attempt.

use crate::config::RetryPolicy;
use crate::metrics;
use reqwest::{Client, RequestBuilder, multipart};
use serde::{Serialize, de::DeserializeOwned};
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RequestError>,
    },
}

impl RequestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RequestError::Timeout(_) | RequestError::Transport(_))
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            RequestError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            RequestError::Status(status.as_u16())
        } else {
            RequestError::Transport(err.to_string())
        }
    }
}

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// retry bound is exhausted. Each attempt is cut off after `deadline`.
pub async fn with_retry<T, F, Fut>(
    operation: &'static str,
    policy: RetryPolicy,
    deadline: Duration,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, RequestError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RequestError::Cancelled),
            res = timeout(deadline, call(attempt)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(RequestError::Timeout(deadline)),
            },
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(target = "shoppable.request", operation, attempt, "request_recovered");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(target = "shoppable.request", operation, attempts = attempt, error = %err, "request_exhausted");
            return Err(RequestError::Exhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        warn!(target = "shoppable.request", operation, attempt, error = %err, "request_retrying");
        metrics::request_retry(operation, attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RequestError::Cancelled),
            _ = sleep(policy.delay_for(attempt)) => {}
        }
    }
}

/// Binary payload for multipart uploads; rebuilt into a fresh form per attempt.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub field: &'static str,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RequestClient {
    http: Client,
    retry: RetryPolicy,
}

impl RequestClient {
    pub fn new(http: Client, retry: RetryPolicy) -> Self {
        Self { http, retry }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RequestError> {
        with_retry(operation, self.retry, deadline, cancel, |_| {
            execute(self.http.get(url))
        })
        .await
    }

    pub async fn post_json<B, T>(
        &self,
        operation: &'static str,
        url: &str,
        body: &B,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        with_retry(operation, self.retry, deadline, cancel, |_| {
            execute(self.http.post(url).json(body))
        })
        .await
    }

    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
        payload: &FilePayload,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RequestError> {
        with_retry(operation, self.retry, deadline, cancel, |_| async move {
            let part = multipart::Part::bytes(payload.bytes.clone())
                .file_name(payload.file_name.clone())
                .mime_str(&payload.mime)
                .map_err(|err| RequestError::Invalid(err.to_string()))?;
            let mut form = multipart::Form::new().part(payload.field, part);
            for (key, value) in &payload.fields {
                form = form.text(key.clone(), value.clone());
            }
            execute(self.http.post(url).multipart(form)).await
        })
        .await
    }
}

async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RequestError> {
    let response = request.send().await.map_err(RequestError::from_reqwest)?;
    let status = response.status();
    if !status.is_success() {
        return Err(RequestError::Status(status.as_u16()));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| RequestError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_server;
    use axum::{Json, Router, http::StatusCode, routing::get};
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_up_to_the_bound() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let result: Result<(), _> =
            with_retry("test", policy(), Duration::from_secs(1), &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            })
            .await;

        match result {
            Err(RequestError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RequestError::Timeout(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // three 1s deadlines plus 100ms and 200ms backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3300));
        assert!(elapsed < Duration::from_millis(3400));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> =
            with_retry("test", policy(), Duration::from_secs(1), &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RequestError::Status(500)) }
            })
            .await;
        assert_eq!(result, Err(RequestError::Status(500)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_then_success_recovers() {
        let cancel = CancellationToken::new();
        let result = with_retry("test", policy(), Duration::from_secs(1), &cancel, |attempt| async move {
            if attempt == 1 {
                Err(RequestError::Transport("connection reset".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_an_in_flight_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result: Result<(), _> =
            with_retry("test", policy(), Duration::from_secs(10), &cancel, |_| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(RequestError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn http_error_status_is_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/boom",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = spawn_server(app).await;
        let client = RequestClient::new(Client::new(), policy());
        let cancel = CancellationToken::new();
        let result: Result<serde_json::Value, _> = client
            .get_json("boom", &format!("{base}/boom"), Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(result, Err(RequestError::Status(500)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let app = Router::new().route("/bad", get(|| async { "not json" }));
        let base = spawn_server(app).await;
        let client = RequestClient::new(Client::new(), policy());
        let cancel = CancellationToken::new();
        let result: Result<serde_json::Value, _> = client
            .get_json("bad", &format!("{base}/bad"), Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(RequestError::Decode(_))));
    }

    #[tokio::test]
    async fn json_round_trip_against_live_server() {
        let app = Router::new().route(
            "/ok",
            get(|| async { Json(serde_json::json!({"success": true})) }),
        );
        let base = spawn_server(app).await;
        let client = RequestClient::new(Client::new(), policy());
        let cancel = CancellationToken::new();
        let value: serde_json::Value = client
            .get_json("ok", &format!("{base}/ok"), Duration::from_secs(5), &cancel)
            .await
            .expect("ok");
        assert_eq!(value["success"], serde_json::json!(true));
    }
}
