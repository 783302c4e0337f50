//! Fixed-interval status polling with a wall-clock budget.

use crate::api::BackendApi;
use crate::config::PollPolicy;
use crate::metrics;
use crate::models::{JobStatus, StatusSnapshot};
use crate::request::RequestError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn job_status(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StatusSnapshot, RequestError>;
}

#[async_trait]
impl StatusSource for BackendApi {
    async fn job_status(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StatusSnapshot, RequestError> {
        self.status(job_id, cancel).await
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub poll: u32,
    pub status: JobStatus,
    pub label: String,
    pub progress: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub snapshot: StatusSnapshot,
    pub polls: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollError {
    #[error("no terminal status after {polls} polls ({elapsed:?})")]
    Timeout { polls: u32, elapsed: Duration },
    #[error("job failed: {message}")]
    Failed { message: String, polls: u32 },
    #[error("status query failed: {0}")]
    Query(RequestError),
    #[error("polling cancelled")]
    Cancelled,
}

/// Polls `job_id` every `policy.interval` until a terminal status is seen or
/// `policy.budget` runs out. The first query happens one interval after the
/// call, so a job finishing on poll `n` costs exactly `n` queries.
///
/// Transient query failures are absorbed; the next tick simply asks again.
pub async fn poll_until_terminal<S, F>(
    source: &S,
    job_id: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<PollOutcome, PollError>
where
    S: StatusSource + ?Sized,
    F: FnMut(&ProgressUpdate),
{
    let started = Instant::now();
    let mut polls = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep(policy.interval) => {}
        }
        polls += 1;

        // A slow query may not push us past the budget by more than one interval.
        let query_limit = policy.budget.saturating_sub(started.elapsed()) + policy.interval;
        let queried = match timeout(query_limit, source.job_status(job_id, cancel)).await {
            Ok(inner) => inner,
            Err(_) => Err(RequestError::Timeout(query_limit)),
        };

        match queried {
            Ok(snapshot) => {
                let update = ProgressUpdate {
                    job_id: job_id.to_string(),
                    poll: polls,
                    status: snapshot.status,
                    label: snapshot.label.clone(),
                    progress: snapshot.progress,
                };
                metrics::poll_tick(job_id, polls, snapshot.progress);
                on_progress(&update);
                match snapshot.status {
                    JobStatus::Completed => {
                        let elapsed = started.elapsed();
                        info!(target = "shoppable.poller", job_id, polls, elapsed_ms = elapsed.as_millis() as u64, "job_completed");
                        return Ok(PollOutcome {
                            snapshot,
                            polls,
                            elapsed,
                        });
                    }
                    JobStatus::Error => {
                        let message = snapshot
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("job reported `{}`", snapshot.label));
                        warn!(target = "shoppable.poller", job_id, polls, error = %message, "job_failed");
                        return Err(PollError::Failed { message, polls });
                    }
                    JobStatus::Pending | JobStatus::Processing => {
                        debug!(target = "shoppable.poller", job_id, polls, label = %snapshot.label, "job_in_progress");
                    }
                }
            }
            Err(RequestError::Cancelled) => return Err(PollError::Cancelled),
            Err(err) if err.is_transient() || matches!(err, RequestError::Exhausted { .. }) => {
                warn!(target = "shoppable.poller", job_id, polls, error = %err, "status_query_absorbed");
            }
            Err(err) => return Err(PollError::Query(err)),
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.budget {
            warn!(target = "shoppable.poller", job_id, polls, elapsed_ms = elapsed.as_millis() as u64, "poll_budget_exhausted");
            return Err(PollError::Timeout { polls, elapsed });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    struct ScriptedSource {
        replies: Mutex<VecDeque<Result<StatusSnapshot, RequestError>>>,
        fallback: StatusSnapshot,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<StatusSnapshot, RequestError>>, fallback: StatusSnapshot) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn job_status(
            &self,
            _job_id: &str,
            _cancel: &CancellationToken,
        ) -> Result<StatusSnapshot, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().expect("lock").pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn snapshot(label: &str, progress: f32, objects: Option<&[&str]>) -> StatusSnapshot {
        StatusSnapshot {
            status: JobStatus::from_label(label),
            label: label.to_string(),
            progress: Some(progress),
            detected_objects: objects.map(|o| o.iter().map(|s| s.to_string()).collect()),
            matched_products: None,
            error: None,
        }
    }

    fn policy(budget_secs: u64) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(budget_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_processing_then_completed_takes_four_polls() {
        let source = ScriptedSource::new(
            vec![
                Ok(snapshot("processing", 10.0, None)),
                Ok(snapshot("processing", 40.0, None)),
                Ok(snapshot("processing", 70.0, None)),
            ],
            snapshot("completed", 100.0, Some(&["laptop", "mug"])),
        );
        let mut seen = Vec::new();
        let outcome = poll_until_terminal(&source, "vid-1", policy(60), &CancellationToken::new(), |u| {
            seen.push(u.progress)
        })
        .await
        .expect("completed");

        assert_eq!(outcome.polls, 4);
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.elapsed, Duration::from_secs(8));
        assert_eq!(
            outcome.snapshot.detected_objects,
            Some(vec!["laptop".to_string(), "mug".to_string()])
        );
        assert_eq!(seen, vec![Some(10.0), Some(40.0), Some(70.0), Some(100.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn error_marker_stops_with_failure() {
        let mut failed = snapshot("error", 30.0, None);
        failed.error = Some("corrupt container".into());
        let source = ScriptedSource::new(vec![Ok(snapshot("processing", 10.0, None))], failed);
        let err = poll_until_terminal(&source, "vid-1", policy(60), &CancellationToken::new(), |_| {})
            .await
            .expect_err("failed");
        assert_eq!(
            err,
            PollError::Failed {
                message: "corrupt container".into(),
                polls: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_is_a_timeout_bounded_by_one_interval() {
        let source = ScriptedSource::new(vec![], snapshot("processing", 50.0, None));
        let started = Instant::now();
        let err = poll_until_terminal(&source, "vid-1", policy(9), &CancellationToken::new(), |_| {})
            .await
            .expect_err("timeout");
        // ceil(9 / 2) polls
        assert!(matches!(err, PollError::Timeout { polls: 5, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() <= Duration::from_secs(9) + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_query_failures_are_absorbed() {
        let source = ScriptedSource::new(
            vec![Err(RequestError::Transport("connection reset".into()))],
            snapshot("completed", 100.0, Some(&[])),
        );
        let outcome = poll_until_terminal(&source, "vid-1", policy(60), &CancellationToken::new(), |_| {})
            .await
            .expect("completed");
        assert_eq!(outcome.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_query_failure_is_surfaced() {
        let source = ScriptedSource::new(
            vec![Err(RequestError::Status(404))],
            snapshot("completed", 100.0, None),
        );
        let err = poll_until_terminal(&source, "vid-1", policy(60), &CancellationToken::new(), |_| {})
            .await
            .expect_err("query");
        assert_eq!(err, PollError::Query(RequestError::Status(404)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_polling() {
        let source = ScriptedSource::new(vec![], snapshot("processing", 0.0, None));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let err = poll_until_terminal(&source, "vid-1", policy(60), &cancel, |_| {})
            .await
            .expect_err("cancelled");
        assert_eq!(err, PollError::Cancelled);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
