//! Backend discovery: probe every candidate address at once and remember the
//! first one that answers `/health`.

use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock},
    time::{Instant, timeout},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no endpoint reachable among {candidates} candidates")]
    Unreachable { candidates: usize },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointCacheEntry {
    pub base_url: String,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub resolved_at: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis() as u64)
}

/// Reachability check against one candidate base address.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, base_url: &str) -> Result<(), String>;
}

pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, base_url: &str) -> Result<(), String> {
        let response = self
            .http
            .get(format!("{base_url}/health"))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

/// Owns the process-wide endpoint cache. Construct once and share by `Arc`.
pub struct EndpointResolver {
    candidates: Vec<String>,
    probe_timeout: Duration,
    probe: Arc<dyn HealthProbe>,
    cache: RwLock<Option<EndpointCacheEntry>>,
    resolving: Mutex<()>,
}

impl EndpointResolver {
    pub fn new(candidates: Vec<String>, probe_timeout: Duration, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            candidates,
            probe_timeout,
            probe,
            cache: RwLock::new(None),
            resolving: Mutex::new(()),
        }
    }

    pub async fn cached(&self) -> Option<EndpointCacheEntry> {
        self.cache.read().await.clone()
    }

    /// Returns the cached endpoint, probing only when nothing is cached yet.
    pub async fn resolve(&self) -> Result<EndpointCacheEntry, ResolveError> {
        if let Some(entry) = self.cached().await {
            return Ok(entry);
        }
        let _guard = self.resolving.lock().await;
        // another caller may have finished resolving while we waited
        if let Some(entry) = self.cached().await {
            return Ok(entry);
        }
        self.probe_and_store().await
    }

    /// Drops the cached endpoint and probes again, e.g. after the cached
    /// address stopped answering.
    pub async fn force_resolve(&self) -> Result<EndpointCacheEntry, ResolveError> {
        let _guard = self.resolving.lock().await;
        self.invalidate().await;
        self.probe_and_store().await
    }

    pub async fn invalidate(&self) {
        if self.cache.write().await.take().is_some() {
            debug!(target = "shoppable.resolver", "endpoint_cache_invalidated");
        }
    }

    async fn probe_and_store(&self) -> Result<EndpointCacheEntry, ResolveError> {
        let entry = self.probe_all().await?;
        info!(
            target = "shoppable.resolver",
            base_url = %entry.base_url,
            latency_ms = entry.latency.as_millis() as u64,
            "endpoint_resolved"
        );
        *self.cache.write().await = Some(entry.clone());
        Ok(entry)
    }

    async fn probe_all(&self) -> Result<EndpointCacheEntry, ResolveError> {
        let started = Instant::now();
        let mut probes = self
            .candidates
            .iter()
            .map(|candidate| {
                let probe = self.probe.clone();
                let limit = self.probe_timeout;
                async move {
                    let outcome = match timeout(limit, probe.probe(candidate)).await {
                        Ok(inner) => inner,
                        Err(_) => Err(format!("no answer within {limit:?}")),
                    };
                    (candidate, started.elapsed(), outcome)
                }
            })
            .collect::<FuturesUnordered<_>>();

        // Probes start together, so the first success is also the fastest one.
        // Dropping `probes` abandons the rest.
        while let Some((candidate, latency, outcome)) = probes.next().await {
            metrics::probe_latency(candidate, latency.as_millis(), outcome.is_ok());
            match outcome {
                Ok(()) => {
                    return Ok(EndpointCacheEntry {
                        base_url: candidate.clone(),
                        latency,
                        resolved_at: Utc::now(),
                    });
                }
                Err(reason) => {
                    debug!(target = "shoppable.resolver", candidate = %candidate, reason = %reason, "probe_failed");
                }
            }
        }

        warn!(
            target = "shoppable.resolver",
            candidates = self.candidates.len(),
            "no_endpoint_reachable"
        );
        Err(ResolveError::Unreachable {
            candidates: self.candidates.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_server, unused_address};
    use axum::{Json, Router, routing::get};
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU32, Ordering},
    };
    use tokio::time::sleep;

    /// Each candidate either answers after a delay or hangs forever.
    struct ScriptedProbe {
        answers: HashMap<String, (Duration, bool)>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(answers: &[(&str, u64, bool)]) -> Arc<Self> {
            Arc::new(Self {
                answers: answers
                    .iter()
                    .map(|(url, ms, ok)| (url.to_string(), (Duration::from_millis(*ms), *ok)))
                    .collect(),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, base_url: &str) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(base_url) {
                Some((delay, ok)) => {
                    sleep(*delay).await;
                    if *ok { Ok(()) } else { Err("HTTP 503".into()) }
                }
                None => {
                    sleep(Duration::from_secs(3600)).await;
                    Err("hung".into())
                }
            }
        }
    }

    fn candidates(urls: &[&str]) -> Vec<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn picks_the_only_responsive_candidate_without_sequential_waits() {
        let probe = ScriptedProbe::new(&[("http://c", 120, true)]);
        let resolver = EndpointResolver::new(
            candidates(&["http://a", "http://b", "http://c", "http://d"]),
            Duration::from_secs(5),
            probe.clone(),
        );
        let started = Instant::now();
        let entry = resolver.resolve().await.expect("resolve");
        assert_eq!(entry.base_url, "http://c");
        assert_eq!(entry.latency, Duration::from_millis(120));
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_after_a_single_timeout_window() {
        let probe = ScriptedProbe::new(&[("http://b", 10, false)]);
        let resolver = EndpointResolver::new(
            candidates(&["http://a", "http://b", "http://c", "http://d"]),
            Duration::from_secs(5),
            probe,
        );
        let started = Instant::now();
        let err = resolver.resolve().await.expect_err("unreachable");
        assert_eq!(err, ResolveError::Unreachable { candidates: 4 });
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(resolver.cached().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_success_wins_over_failures_and_slower_successes() {
        let probe = ScriptedProbe::new(&[
            ("http://prod", 900, true),
            ("http://local", 40, false),
            ("http://lan", 300, true),
        ]);
        let resolver = EndpointResolver::new(
            candidates(&["http://prod", "http://local", "http://lan"]),
            Duration::from_secs(5),
            probe,
        );
        let entry = resolver.resolve().await.expect("resolve");
        assert_eq!(entry.base_url, "http://lan");
    }

    #[tokio::test(start_paused = true)]
    async fn cached_endpoint_is_reused_until_forced() {
        let probe = ScriptedProbe::new(&[("http://a", 50, true)]);
        let resolver = EndpointResolver::new(
            candidates(&["http://a"]),
            Duration::from_secs(5),
            probe.clone(),
        );
        let first = resolver.resolve().await.expect("first");
        let second = resolver.resolve().await.expect("second");
        assert_eq!(first, second);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        resolver.force_resolve().await.expect("forced");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn http_probe_accepts_2xx_and_rejects_closed_ports() {
        let app = Router::new().route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }));
        let live = spawn_server(app).await;
        let dead = unused_address().await;
        let resolver = EndpointResolver::new(
            vec![dead, live.clone()],
            Duration::from_secs(2),
            Arc::new(HttpProbe::new(Client::new())),
        );
        let entry = resolver.resolve().await.expect("resolve");
        assert_eq!(entry.base_url, live);
    }
}
