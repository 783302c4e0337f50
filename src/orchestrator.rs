//! The upload state machine. One orchestrator owns one session and runs its
//! stages strictly in sequence; `&mut self` on every action means a second
//! action cannot start while one is in flight.

use crate::api::BackendApi;
use crate::backend::{
    BackendError, BackendKind, BackendStrategy, RemoteBackend, SimulatedBackend, UploadRequest,
};
use crate::config::ClientConfig;
use crate::error::{StageError, StageErrorKind};
use crate::http::build_client;
use crate::matching::{Candidate, FeedbackSink, MatchCandidates, MatchingCoordinator};
use crate::metrics;
use crate::models::{Product, StageReport};
use crate::poller::ProgressUpdate;
use crate::request::{RequestClient, RequestError};
use crate::resolver::{EndpointResolver, HttpProbe};
use crate::session::{ConfirmOutcome, ProductMatch, Step, TrackedItem, UploadSession, VideoHandle};
use crate::storage::{FinalMatchUpdate, NewVideo, VideoStore};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Process-wide collaborators shared by every session.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<ClientConfig>,
    pub resolver: Arc<EndpointResolver>,
    pub http: Client,
    pub store: Arc<dyn VideoStore>,
    pub matching: MatchingCoordinator,
}

impl Services {
    pub fn new(config: ClientConfig, store: Arc<dyn VideoStore>, feedback: Arc<dyn FeedbackSink>) -> Self {
        let http = build_client(&config);
        let resolver = EndpointResolver::new(
            config.candidates.clone(),
            config.probe_timeout,
            Arc::new(HttpProbe::new(http.clone())),
        );
        Self {
            config: Arc::new(config),
            resolver: Arc::new(resolver),
            http,
            store,
            matching: MatchingCoordinator::new(feedback),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<EndpointResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Cancels whatever operation the session is currently running. Each action
/// arms a fresh token, so a cancel never leaks into the next action.
#[derive(Clone, Default)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }
}

/// Live view of a session, readable without waiting for the running action.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressView {
    pub step: Step,
    pub progress: f32,
    pub label: String,
    pub polls: u32,
    pub busy: bool,
}

impl ProgressView {
    fn idle(step: Step) -> Self {
        Self {
            step,
            progress: 0.0,
            label: "idle".into(),
            polls: 0,
            busy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: UploadSession,
    pub candidates: MatchCandidates,
    pub backend: Option<BackendKind>,
}

pub struct UploadOrchestrator {
    services: Services,
    session: UploadSession,
    backend: Option<Arc<dyn BackendStrategy>>,
    candidates: MatchCandidates,
    cancel: CancelHandle,
    progress: watch::Sender<ProgressView>,
}

impl UploadOrchestrator {
    pub fn new(services: Services) -> Self {
        Self::with_session(services, UploadSession::new())
    }

    pub fn with_session(services: Services, session: UploadSession) -> Self {
        let (progress, _) = watch::channel(ProgressView::idle(session.step()));
        Self {
            services,
            session,
            backend: None,
            candidates: MatchCandidates::default(),
            cancel: CancelHandle::default(),
            progress,
        }
    }

    /// Pins the backend instead of resolving one on first upload.
    pub fn with_backend(mut self, backend: Arc<dyn BackendStrategy>) -> Self {
        self.session.simulated = backend.kind() == BackendKind::Simulated;
        self.backend = Some(backend);
        self
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn candidates(&self) -> &MatchCandidates {
        &self.candidates
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session: self.session.clone(),
            candidates: self.candidates.clone(),
            backend: self.backend_kind(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressView> {
        self.progress.subscribe()
    }

    fn include_tracking(&self) -> bool {
        self.services.config.variant.include_tracking
    }

    fn expect_step(&self, allowed: &[Step], action: &str) -> Result<(), StageError> {
        if allowed.contains(&self.session.step()) {
            Ok(())
        } else {
            Err(StageError::invalid_transition(self.session.step(), action))
        }
    }

    fn move_to(&mut self, step: Step) {
        self.session.move_to(step);
        self.progress.send_modify(|view| view.step = step);
    }

    fn set_busy(&self, busy: bool, label: &str) {
        self.progress.send_modify(|view| {
            view.busy = busy;
            view.label = label.to_string();
        });
    }

    fn record_stage(&mut self, name: &'static str, started: Instant, output: Value) {
        let elapsed_ms = started.elapsed().as_millis();
        metrics::stage_elapsed(name, elapsed_ms);
        self.session.stages.push(StageReport::new(name, elapsed_ms, output));
    }

    /// Rolls back to the step before the failed one, keeping collected data.
    fn fail(&mut self, err: StageError) -> StageError {
        match err.kind() {
            StageErrorKind::InvalidTransition => return err,
            StageErrorKind::Validation => {}
            _ => {
                let stable = err
                    .step()
                    .previous(self.include_tracking())
                    .unwrap_or(Step::Select);
                if stable < self.session.step() {
                    self.move_to(stable);
                }
            }
        }
        warn!(
            target = "shoppable.orchestrator",
            session_id = %self.session.id,
            step = err.step().as_str(),
            kind = ?err.kind(),
            error = %err.detail(),
            "stage_failed"
        );
        self.session.last_error = Some(err.clone());
        self.set_busy(false, "failed");
        err
    }

    fn succeed(&mut self) {
        self.session.last_error = None;
        self.set_busy(false, "idle");
    }

    /// select → preview. Picking again from preview replaces the video, until
    /// it has been uploaded: a job belongs to one video.
    pub fn select_video(&mut self, video: VideoHandle) -> Result<(), StageError> {
        self.expect_step(&[Step::Select, Step::Preview], "select_video")?;
        if let Err(message) = video.validate(&self.services.config.limits) {
            return Err(self.fail(StageError::validation(Step::Select, message)));
        }
        let locked = match (self.session.job_id(), &self.session.video) {
            (Some(job_id), Some(current)) if current.uri != video.uri => Some(format!(
                "`{}` is already uploaded as job {job_id}; start over to use another video",
                current.file_name
            )),
            _ => None,
        };
        if let Some(message) = locked {
            return Err(self.fail(StageError::validation(Step::Select, message)));
        }
        info!(
            target = "shoppable.orchestrator",
            session_id = %self.session.id,
            file = %video.file_name,
            duration_secs = video.duration_secs,
            "video_selected"
        );
        self.session.video = Some(video);
        self.move_to(Step::Preview);
        self.succeed();
        Ok(())
    }

    /// preview → track (or upload when the variant skips tracking).
    pub fn set_details(&mut self, title: &str, description: Option<&str>) -> Result<(), StageError> {
        self.expect_step(&[Step::Preview], "set_details")?;
        let title = title.trim();
        if title.is_empty() {
            return Err(self.fail(StageError::validation(Step::Preview, "title is required")));
        }
        self.session.title = title.to_string();
        self.session.description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        self.seed_tracked_items();

        let next = Step::Preview.next(self.include_tracking()).unwrap_or(Step::Upload);
        self.move_to(next);
        self.succeed();
        Ok(())
    }

    /// Adds a tracked candidate for every known object not tracked yet.
    fn seed_tracked_items(&mut self) {
        let duration = self
            .session
            .video
            .as_ref()
            .map(|v| v.duration_secs)
            .unwrap_or_default();
        let known: HashSet<String> = self
            .session
            .tracked_items
            .iter()
            .map(|item| item.name.to_lowercase())
            .collect();
        let fresh: Vec<String> = self
            .session
            .detected_objects
            .iter()
            .filter(|object| !known.contains(&object.to_lowercase()))
            .cloned()
            .collect();
        for object in fresh {
            let index = self.session.tracked_items.len();
            self.session
                .tracked_items
                .push(TrackedItem::candidate(index, &object, duration));
        }
    }

    pub fn toggle_item(&mut self, item_id: &str) -> Result<bool, StageError> {
        self.expect_step(&[Step::Track], "toggle_item")?;
        let item = self
            .session
            .tracked_items
            .iter_mut()
            .find(|item| item.id == item_id)
            .ok_or_else(|| StageError::validation(Step::Track, format!("unknown tracked item `{item_id}`")))?;
        item.selected = !item.selected;
        Ok(item.selected)
    }

    /// Adds a user-placed item. The id is assigned here.
    pub fn add_item(&mut self, mut item: TrackedItem) -> Result<&TrackedItem, StageError> {
        self.expect_step(&[Step::Track], "add_item")?;
        if let Err(message) = item.validate() {
            return Err(self.fail(StageError::validation(Step::Track, message)));
        }
        item.id = format!("item-{}", self.session.tracked_items.len() + 1);
        self.session.tracked_items.push(item);
        self.succeed();
        Ok(&self.session.tracked_items[self.session.tracked_items.len() - 1])
    }

    /// track → upload.
    pub fn finish_tracking(&mut self) -> Result<(), StageError> {
        self.expect_step(&[Step::Track], "finish_tracking")?;
        if let Some(message) = self
            .session
            .tracked_items
            .iter()
            .find_map(|item| item.validate().err())
        {
            return Err(self.fail(StageError::validation(Step::Track, message)));
        }
        self.move_to(Step::Upload);
        self.succeed();
        Ok(())
    }

    /// Runs upload, detection and matching. Leaves the session at `match` with
    /// candidates ready for confirmation.
    pub async fn upload(&mut self) -> Result<(), StageError> {
        self.expect_step(&[Step::Upload], "upload")?;
        self.run_from(Step::Upload).await
    }

    /// Re-runs matching with the current object list. From verify this steps
    /// back to match and drops the confirmed product, which the refreshed
    /// candidates may no longer offer.
    pub async fn run_matching(&mut self) -> Result<(), StageError> {
        self.expect_step(&[Step::Match, Step::Verify], "run_matching")?;
        if self.session.step() == Step::Verify {
            self.back()?;
            self.session.clear_match();
        }
        self.run_from(Step::Match).await
    }

    async fn run_from(&mut self, from: Step) -> Result<(), StageError> {
        let cancel = self.cancel.arm();
        let mut action = InFlight::new(self);
        let result = action.orchestrator.run_stages(from, &cancel).await;
        action.settle(result)
    }

    async fn run_stages(&mut self, from: Step, cancel: &CancellationToken) -> Result<(), StageError> {
        let backend = self.ensure_backend().await;
        if from <= Step::Upload {
            self.stage_upload(&backend, cancel).await?;
        }
        if from <= Step::Detect {
            self.stage_detect(&backend, cancel).await?;
        }
        self.stage_match(&backend, cancel).await
    }

    /// Resolves the backend once per session; no reachable endpoint means the
    /// simulated pipeline.
    async fn ensure_backend(&mut self) -> Arc<dyn BackendStrategy> {
        if let Some(backend) = &self.backend {
            return backend.clone();
        }
        let started = Instant::now();
        self.set_busy(true, "resolving");
        let config = self.services.config.clone();
        let resolved = self.services.resolver.resolve().await;
        let backend: Arc<dyn BackendStrategy> = match resolved {
            Ok(entry) => {
                let client = RequestClient::new(self.services.http.clone(), config.retry);
                let api = BackendApi::new(
                    client,
                    entry.base_url.clone(),
                    config.request_timeout,
                    config.upload_timeout,
                );
                self.session.simulated = false;
                self.record_stage("resolve", started, json!({ "base_url": entry.base_url, "simulated": false }));
                Arc::new(RemoteBackend::new(api, config.poll, config.variant.prefer_file_upload))
            }
            Err(err) => {
                let seed = config
                    .variant
                    .simulation_seed
                    .unwrap_or_else(|| compute_seed(&self.session));
                warn!(
                    target = "shoppable.orchestrator",
                    session_id = %self.session.id,
                    error = %err,
                    "falling_back_to_simulation"
                );
                self.session.simulated = true;
                self.record_stage("resolve", started, json!({ "simulated": true, "seed": seed }));
                Arc::new(SimulatedBackend::new(
                    seed,
                    Duration::from_millis(config.variant.simulated_step_ms),
                ))
            }
        };
        self.backend = Some(backend.clone());
        backend
    }

    async fn stage_upload(
        &mut self,
        backend: &Arc<dyn BackendStrategy>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        self.move_to(Step::Upload);
        // a job already exists for this session, never upload twice
        if self.session.job_id().is_some() {
            return Ok(());
        }
        let started = Instant::now();
        self.set_busy(true, "uploading");
        let video = self
            .session
            .video
            .clone()
            .ok_or_else(|| StageError::validation(Step::Upload, "no video selected"))?;
        let format = video
            .validate(&self.services.config.limits)
            .map_err(|message| StageError::validation(Step::Upload, message))?;
        let request = UploadRequest {
            video: &video,
            format,
            title: &self.session.title,
            description: self.session.description.as_deref(),
        };
        let uploaded = backend.upload(&request, cancel).await;
        let job_id = match uploaded {
            Ok(job_id) => job_id,
            Err(err) => {
                if backend.kind() == BackendKind::Remote && unreachable_endpoint(&err) {
                    // the cached address stopped answering; resolve again on retry
                    self.services.resolver.invalidate().await;
                    self.backend = None;
                }
                return Err(stage_error(Step::Upload, err));
            }
        };
        self.session.assign_job_id(&job_id)?;
        info!(
            target = "shoppable.orchestrator",
            session_id = %self.session.id,
            job_id = %job_id,
            simulated = self.session.simulated,
            "upload_complete"
        );
        self.record_stage("upload", started, json!({ "job_id": job_id, "format": format }));
        Ok(())
    }

    async fn stage_detect(
        &mut self,
        backend: &Arc<dyn BackendStrategy>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        self.move_to(Step::Detect);
        let started = Instant::now();
        self.set_busy(true, "detecting");
        let job_id = self
            .session
            .job_id()
            .map(str::to_string)
            .ok_or_else(|| StageError::new(StageErrorKind::Detection, Step::Detect, "no job to poll"))?;

        let progress_tx = &self.progress;
        let session_progress = &mut self.session.progress;
        let mut on_progress = |update: &ProgressUpdate| {
            if let Some(progress) = update.progress {
                *session_progress = progress;
            }
            progress_tx.send_modify(|view| {
                view.progress = update.progress.unwrap_or(view.progress);
                view.label = update.label.clone();
                view.polls = update.poll;
            });
        };
        let detection = backend
            .detect(&job_id, &mut on_progress, cancel)
            .await
            .map_err(|err| stage_error(Step::Detect, err))?;

        self.session.progress = 100.0;
        self.progress.send_modify(|view| view.progress = 100.0);
        self.session.detected_objects = detection.objects;
        self.session.matched_products = detection.products;
        self.seed_tracked_items();
        info!(
            target = "shoppable.orchestrator",
            session_id = %self.session.id,
            job_id = %job_id,
            objects = self.session.detected_objects.len(),
            polls = detection.polls,
            "detection_complete"
        );
        self.record_stage(
            "detect",
            started,
            json!({ "objects": self.session.detected_objects, "polls": detection.polls }),
        );
        Ok(())
    }

    async fn stage_match(
        &mut self,
        backend: &Arc<dyn BackendStrategy>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        self.move_to(Step::Match);
        let started = Instant::now();
        self.set_busy(true, "matching");
        let fetched = backend
            .match_products(&self.session.detected_objects, cancel)
            .await
            .map_err(|err| stage_error(Step::Match, err))?;
        self.session.matched_products = merge_products(&self.session.matched_products, fetched);
        self.refresh_candidates();
        self.record_stage(
            "match",
            started,
            json!({
                "products": self.session.matched_products.len(),
                "suggestions": self.session.suggested_products,
            }),
        );
        Ok(())
    }

    fn refresh_candidates(&mut self) {
        self.candidates = self.services.matching.candidates(
            &self.session.detected_objects,
            &self.session.matched_products,
            self.session.manual_product_name.as_deref(),
            self.session.affiliate_link.as_deref(),
        );
        self.session.suggested_products = self.candidates.suggestions.clone();
    }

    /// Sets (or clears, with an empty name) the user-entered product.
    pub fn set_manual_product(&mut self, name: &str, affiliate_link: Option<&str>) -> Result<(), StageError> {
        self.expect_step(&[Step::Match, Step::Verify], "set_manual_product")?;
        let name = name.trim();
        let link = affiliate_link.map(str::trim).filter(|l| !l.is_empty());
        if let Some(link) = link {
            if !(link.starts_with("http://") || link.starts_with("https://")) {
                return Err(self.fail(StageError::validation(
                    Step::Match,
                    format!("affiliate link `{link}` must be an http(s) URL"),
                )));
            }
        }
        self.session.manual_product_name = (!name.is_empty()).then(|| name.to_string());
        self.session.affiliate_link = link.map(str::to_string);
        self.refresh_candidates();
        Ok(())
    }

    /// match → verify. Only an offered candidate can be confirmed; confirming
    /// the same one twice changes nothing.
    pub async fn confirm_match(&mut self, choice: &Candidate) -> Result<ConfirmOutcome, StageError> {
        self.expect_step(&[Step::Match, Step::Verify], "confirm_match")?;
        let Some(candidate) = self.candidates.offered(choice).cloned() else {
            return Err(self.fail(StageError::validation(
                Step::Match,
                format!("`{}` was not offered as a {} match", choice.name, choice.source.as_str()),
            )));
        };
        let outcome = self.services.matching.confirm(&mut self.session, &candidate).await;
        if let ConfirmOutcome::Recorded(recorded) = &outcome {
            info!(
                target = "shoppable.orchestrator",
                session_id = %self.session.id,
                match_type = recorded.match_type.as_str(),
                product = %recorded.product_name,
                "match_confirmed"
            );
        }
        self.move_to(Step::Verify);
        self.succeed();
        Ok(outcome)
    }

    /// verify → complete, persisting the record.
    pub async fn finalize(&mut self) -> Result<String, StageError> {
        self.expect_step(&[Step::Verify], "finalize")?;
        let mut action = InFlight::new(self).on_behalf_of(Step::Complete);
        let result = action.orchestrator.complete().await;
        action.settle(result)
    }

    async fn complete(&mut self) -> Result<String, StageError> {
        let started = Instant::now();
        self.set_busy(true, "saving");
        let record_id = self.persist().await?;
        self.record_stage("persist", started, json!({ "record_id": record_id }));
        self.move_to(Step::Complete);
        info!(
            target = "shoppable.orchestrator",
            session_id = %self.session.id,
            record_id = %record_id,
            "session_complete"
        );
        Ok(record_id)
    }

    async fn persist(&mut self) -> Result<String, StageError> {
        let persist_err = |err: crate::storage::StoreError| {
            StageError::new(StageErrorKind::Persist, Step::Complete, err.to_string())
        };
        let final_match: ProductMatch = self
            .session
            .final_match()
            .cloned()
            .ok_or_else(|| StageError::validation(Step::Verify, "confirm a product before finishing"))?;
        let store = self.services.store.clone();

        // created once; a retry after a failed update reuses the record
        let record_id = match &self.session.record_id {
            Some(id) => id.clone(),
            None => {
                let user = store.current_user().await.map_err(persist_err)?;
                let video = NewVideo {
                    user_id: user.map(|u| u.id),
                    title: self.session.title.clone(),
                    description: self.session.description.clone(),
                    video_uri: self
                        .session
                        .video
                        .as_ref()
                        .map(|v| v.uri.clone())
                        .unwrap_or_default(),
                    job_id: self.session.job_id().map(str::to_string),
                    detected_objects: self.session.detected_objects.clone(),
                    simulated: self.session.simulated,
                };
                let record = store.create_video(&video).await.map_err(persist_err)?;
                self.session.record_id = Some(record.id.clone());
                record.id
            }
        };

        store
            .update_final_match(
                &record_id,
                &FinalMatchUpdate {
                    product_name: final_match.product_name,
                    affiliate_link: final_match.affiliate_link,
                    match_type: final_match.match_type,
                    detected_object: final_match.detected_object,
                },
            )
            .await
            .map_err(persist_err)?;
        Ok(record_id)
    }

    /// Returns to the previous user-facing step. Detection is never a resting
    /// point, so going back from matching lands on upload.
    pub fn back(&mut self) -> Result<Step, StageError> {
        let current = self.session.step();
        if current == Step::Complete {
            return Err(StageError::invalid_transition(current, "back"));
        }
        let target = match current.previous(self.include_tracking()) {
            Some(Step::Detect) => Step::Upload,
            Some(step) => step,
            None => return Err(StageError::invalid_transition(current, "back")),
        };
        self.move_to(target);
        self.session.last_error = None;
        Ok(target)
    }

    /// Re-runs the operation that last failed, keeping everything collected so
    /// far. A failed detection re-polls the existing job.
    pub async fn retry(&mut self) -> Result<(), StageError> {
        let Some(last) = self.session.last_error.clone() else {
            return Err(StageError::invalid_transition(self.session.step(), "retry"));
        };
        if !last.is_retryable() {
            return Err(StageError::invalid_transition(self.session.step(), "retry"));
        }
        info!(
            target = "shoppable.orchestrator",
            session_id = %self.session.id,
            step = last.step().as_str(),
            "retrying_stage"
        );
        match last.step() {
            Step::Upload | Step::Detect | Step::Match => {
                let from = last.step();
                self.move_to(from);
                self.run_from(from).await
            }
            Step::Complete => {
                self.move_to(Step::Verify);
                self.finalize().await.map(|_| ())
            }
            other => Err(StageError::invalid_transition(other, "retry")),
        }
    }

    /// complete → select, the only way to clear a session. The id is kept.
    pub fn start_over(&mut self) -> Result<(), StageError> {
        self.expect_step(&[Step::Complete], "start_over")?;
        self.reset();
        Ok(())
    }

    /// Cancels in-flight work and wipes the session, wherever it is.
    pub(crate) fn reset(&mut self) {
        self.cancel.cancel();
        self.session.reset();
        self.backend = None;
        self.candidates = MatchCandidates::default();
        self.progress.send_replace(ProgressView::idle(Step::Select));
    }

    /// Drives a fresh session end to end with the configured default choice.
    /// Used by demo flows and smoke tests.
    pub async fn run_to_completion(
        &mut self,
        video: VideoHandle,
        title: &str,
        description: Option<&str>,
        manual: Option<(&str, Option<&str>)>,
    ) -> Result<ProductMatch, StageError> {
        self.select_video(video)?;
        self.set_details(title, description)?;
        if self.session.step() == Step::Track {
            self.finish_tracking()?;
        }
        self.upload().await?;
        if let Some((name, link)) = manual {
            self.set_manual_product(name, link)?;
        }
        let choice = self
            .candidates
            .default_choice(self.services.config.variant.default_choice)
            .ok_or_else(|| StageError::validation(Step::Match, "no candidate to confirm"))?;
        self.confirm_match(&choice).await?;
        self.finalize().await?;
        self.session
            .final_match()
            .cloned()
            .ok_or_else(|| StageError::validation(Step::Verify, "no confirmed match"))
    }
}

/// One running action. If its future is dropped before settling (a bridge
/// client hanging up mid-poll, say), the session is rolled back as if the
/// action had been cancelled, so `retry` can pick it up.
struct InFlight<'a> {
    orchestrator: &'a mut UploadOrchestrator,
    /// Step the interrupted operation belongs to; the session's current step
    /// when unset.
    step: Option<Step>,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(orchestrator: &'a mut UploadOrchestrator) -> Self {
        Self {
            orchestrator,
            step: None,
            settled: false,
        }
    }

    fn on_behalf_of(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    fn settle<T>(mut self, result: Result<T, StageError>) -> Result<T, StageError> {
        self.settled = true;
        match result {
            Ok(value) => {
                self.orchestrator.succeed();
                Ok(value)
            }
            Err(err) => Err(self.orchestrator.fail(err)),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let step = self.step.unwrap_or_else(|| self.orchestrator.session.step());
            self.orchestrator.fail(StageError::cancelled(step));
        }
    }
}

/// Seed for the simulated pipeline: stable for a given session and video.
pub fn compute_seed(session: &UploadSession) -> u64 {
    let mut hasher = DefaultHasher::new();
    session.id.hash(&mut hasher);
    session.title.hash(&mut hasher);
    if let Some(video) = &session.video {
        video.file_name.hash(&mut hasher);
        video.size_bytes.hash(&mut hasher);
    }
    hasher.finish()
}

fn stage_error(step: Step, err: BackendError) -> StageError {
    let kind = match &err {
        BackendError::Upload(_) => StageErrorKind::Upload,
        BackendError::Detection(_) => StageErrorKind::Detection,
        BackendError::PollTimeout(_) => StageErrorKind::PollTimeout,
        BackendError::Match(_) => StageErrorKind::Match,
        BackendError::Cancelled => return StageError::cancelled(step),
    };
    StageError::new(kind, step, err.to_string())
}

fn unreachable_endpoint(err: &BackendError) -> bool {
    match err {
        BackendError::Upload(RequestError::Exhausted { last, .. }) => last.is_transient(),
        BackendError::Upload(inner) => inner.is_transient(),
        _ => false,
    }
}

fn merge_products(existing: &[Product], fetched: Vec<Product>) -> Vec<Product> {
    let mut seen: HashSet<String> = existing.iter().map(|p| p.name.to_lowercase()).collect();
    let mut merged = existing.to_vec();
    merged.extend(fetched.into_iter().filter(|p| seen.insert(p.name.to_lowercase())));
    merged
}
