use super::{BackendError, BackendKind, BackendStrategy, DetectionResult, ProgressFn, UploadRequest};
use crate::models::{JobStatus, Product};
use crate::poller::ProgressUpdate;
use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everyday objects a phone video plausibly contains.
const OBJECT_POOL: &[&str] = &[
    "chair", "table", "laptop", "cell phone", "book", "cup", "bottle", "sneakers", "hat",
    "shirt", "pants", "handbag", "watch", "glasses", "couch", "tv", "lamp", "potted plant",
    "keyboard", "mouse", "backpack", "clock", "vase",
];

const PROGRESS_STEPS: [f32; 4] = [25.0, 50.0, 75.0, 100.0];

/// Local stand-in used when no backend is reachable. Never touches the network
/// and always detects at least three objects. Everything it produces derives
/// from the seed, so a fixed seed replays the same session. It offers no
/// direct product matches; only suggestions and the manual entry remain.
pub struct SimulatedBackend {
    seed: u64,
    step_delay: Duration,
}

impl SimulatedBackend {
    pub fn new(seed: u64, step_delay: Duration) -> Self {
        Self { seed, step_delay }
    }

    fn rng(&self, salt: &str) -> SmallRng {
        let salt = salt
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        SmallRng::seed_from_u64(self.seed ^ salt)
    }

    pub fn pick_objects(&self, job_id: &str) -> Vec<String> {
        let mut rng = self.rng(job_id);
        let count = rng.random_range(3..=6);
        OBJECT_POOL
            .choose_multiple(&mut rng, count)
            .map(|name| name.to_string())
            .collect()
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        if self.step_delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            _ = sleep(self.step_delay) => Ok(()),
        }
    }
}

#[async_trait]
impl BackendStrategy for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn upload(
        &self,
        request: &UploadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        self.pause(cancel).await?;
        let job_id = format!("sim-{:016x}", self.rng(&request.video.file_name).random::<u64>());
        info!(target = "shoppable.backend", job_id = %job_id, file = %request.video.file_name, "simulated_upload");
        Ok(job_id)
    }

    async fn detect(
        &self,
        job_id: &str,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult, BackendError> {
        let mut polls = 0;
        for progress in PROGRESS_STEPS {
            self.pause(cancel).await?;
            polls += 1;
            let status = if progress >= 100.0 {
                JobStatus::Completed
            } else {
                JobStatus::Processing
            };
            on_progress(&ProgressUpdate {
                job_id: job_id.to_string(),
                poll: polls,
                status,
                label: status.as_str().to_string(),
                progress: Some(progress),
            });
        }
        let objects = self.pick_objects(job_id);
        info!(target = "shoppable.backend", job_id, objects = ?objects, "simulated_detection");
        Ok(DetectionResult {
            objects,
            products: Vec::new(),
            polls,
        })
    }

    async fn match_products(
        &self,
        objects: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, BackendError> {
        self.pause(cancel).await?;
        info!(target = "shoppable.backend", objects = objects.len(), "simulated_match_skipped");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{VideoFormat, VideoHandle};

    #[test]
    fn picks_are_reproducible_and_plausible() {
        let backend = SimulatedBackend::new(7, Duration::ZERO);
        let first = backend.pick_objects("sim-a");
        let again = backend.pick_objects("sim-a");
        assert_eq!(first, again);
        assert!((3..=6).contains(&first.len()));
        assert!(first.iter().all(|o| OBJECT_POOL.contains(&o.as_str())));
    }

    #[tokio::test]
    async fn full_simulated_run_needs_no_network() {
        let backend = SimulatedBackend::new(11, Duration::ZERO);
        let cancel = CancellationToken::new();
        let video = VideoHandle {
            uri: "file:///clip.mov".into(),
            file_name: "clip.mov".into(),
            size_bytes: 1024,
            duration_secs: 4.0,
            local_path: None,
        };
        let request = UploadRequest {
            video: &video,
            format: VideoFormat::Mov,
            title: "Kitchen",
            description: None,
        };
        let job = backend.upload(&request, &cancel).await.expect("upload");
        assert!(job.starts_with("sim-"));
        let replay = SimulatedBackend::new(11, Duration::ZERO);
        assert_eq!(replay.upload(&request, &cancel).await.expect("upload"), job);

        let mut progress = Vec::new();
        let detection = backend
            .detect(&job, &mut |u| progress.push(u.progress), &cancel)
            .await
            .expect("detect");
        assert!(!detection.objects.is_empty());
        assert_eq!(progress.last(), Some(&Some(100.0)));

        let products = backend
            .match_products(&detection.objects, &cancel)
            .await
            .expect("match");
        assert!(products.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_simulated_delays() {
        let backend = SimulatedBackend::new(1, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend
            .detect("sim-x", &mut |_| {}, &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(err, BackendError::Cancelled);
    }
}
