use crate::config::VideoLimits;
use crate::error::StageError;
use crate::matching::{Candidate, category_for};
use crate::models::{Product, StageReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Orchestrator stages in canonical forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Select,
    Preview,
    Track,
    Upload,
    Detect,
    Match,
    Verify,
    Complete,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Select => "select",
            Step::Preview => "preview",
            Step::Track => "track",
            Step::Upload => "upload",
            Step::Detect => "detect",
            Step::Match => "match",
            Step::Verify => "verify",
            Step::Complete => "complete",
        }
    }

    /// Forward successor. `Track` is skipped by variants that go straight from
    /// preview to upload.
    pub fn next(self, include_tracking: bool) -> Option<Step> {
        match self {
            Step::Select => Some(Step::Preview),
            Step::Preview if include_tracking => Some(Step::Track),
            Step::Preview => Some(Step::Upload),
            Step::Track => Some(Step::Upload),
            Step::Upload => Some(Step::Detect),
            Step::Detect => Some(Step::Match),
            Step::Match => Some(Step::Verify),
            Step::Verify => Some(Step::Complete),
            Step::Complete => None,
        }
    }

    /// Previous user-facing step, used by "back" and by error rollback.
    pub fn previous(self, include_tracking: bool) -> Option<Step> {
        match self {
            Step::Select => None,
            Step::Preview => Some(Step::Select),
            Step::Track => Some(Step::Preview),
            Step::Upload if include_tracking => Some(Step::Track),
            Step::Upload => Some(Step::Preview),
            Step::Detect => Some(Step::Upload),
            Step::Match => Some(Step::Detect),
            Step::Verify => Some(Step::Match),
            Step::Complete => Some(Step::Verify),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Mp4,
    Mov,
    M4v,
    Webm,
}

impl VideoFormat {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_lowercase();
        match ext.as_str() {
            "mp4" => Some(VideoFormat::Mp4),
            "mov" | "qt" => Some(VideoFormat::Mov),
            "m4v" => Some(VideoFormat::M4v),
            "webm" => Some(VideoFormat::Webm),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "video/mp4",
            VideoFormat::Mov => "video/quicktime",
            VideoFormat::M4v => "video/x-m4v",
            VideoFormat::Webm => "video/webm",
        }
    }
}

/// A picked or recorded video. Duration is always in seconds; callers convert
/// before building the handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoHandle {
    pub uri: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub duration_secs: f64,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl VideoHandle {
    pub fn validate(&self, limits: &VideoLimits) -> Result<VideoFormat, String> {
        if self.uri.trim().is_empty() {
            return Err("video uri is empty".into());
        }
        let format = VideoFormat::from_file_name(&self.file_name)
            .ok_or_else(|| format!("unsupported video format: {}", self.file_name))?;
        if self.size_bytes == 0 {
            return Err("video file is empty".into());
        }
        if self.size_bytes > limits.max_bytes {
            return Err(format!(
                "video is {} bytes, limit is {}",
                self.size_bytes, limits.max_bytes
            ));
        }
        if !self.duration_secs.is_finite() || self.duration_secs <= 0.0 {
            return Err("video duration must be a positive number of seconds".into());
        }
        if self.duration_secs > limits.max_duration_secs {
            return Err(format!(
                "video is {:.1}s long, limit is {:.0}s",
                self.duration_secs, limits.max_duration_secs
            ));
        }
        Ok(format)
    }
}

/// An object instance the viewer can tap to shop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedItem {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub category: String,
    pub confidence: f32,
    /// Fractional screen position, both components in `[0, 1]`.
    pub x: f32,
    pub y: f32,
    pub start_secs: f64,
    pub end_secs: f64,
    pub selected: bool,
}

impl TrackedItem {
    /// Candidate for a known object: visible for the whole clip, spread across
    /// the frame so overlays don't stack.
    pub fn candidate(index: usize, name: &str, duration_secs: f64) -> Self {
        let column = (index % 3) as f32;
        let row = ((index / 3) % 3) as f32;
        Self {
            id: format!("item-{}", index + 1),
            name: name.to_string(),
            category: category_for(name).to_string(),
            confidence: 0.8,
            x: 0.25 + column * 0.25,
            y: 0.25 + row * 0.25,
            start_secs: 0.0,
            end_secs: duration_secs.max(0.0),
            selected: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("tracked item needs a name".into());
        }
        if !(0.0..=1.0).contains(&self.x) || !(0.0..=1.0).contains(&self.y) {
            return Err(format!(
                "position ({}, {}) of `{}` is outside the frame",
                self.x, self.y, self.name
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence of `{}` must be within [0, 1]", self.name));
        }
        if !self.start_secs.is_finite()
            || !self.end_secs.is_finite()
            || self.start_secs < 0.0
            || self.end_secs < self.start_secs
        {
            return Err(format!(
                "time window {}..{} of `{}` is invalid",
                self.start_secs, self.end_secs, self.name
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Manual,
    AiSuggestion,
    YoloDirect,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Manual => "manual",
            MatchType::AiSuggestion => "ai_suggestion",
            MatchType::YoloDirect => "yolo_direct",
        }
    }
}

/// The confirmed product association for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductMatch {
    pub detected_object: Option<String>,
    pub product_name: String,
    pub product: Option<Product>,
    pub affiliate_link: Option<String>,
    pub match_type: MatchType,
    pub confirmed: bool,
}

impl ProductMatch {
    fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            detected_object: candidate.detected_object.clone(),
            product_name: candidate.name.clone(),
            product: candidate.product.clone(),
            affiliate_link: candidate.affiliate_link.clone(),
            match_type: candidate.source,
            confirmed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Recorded(ProductMatch),
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub video: Option<VideoHandle>,
    pub title: String,
    pub description: Option<String>,
    step: Step,
    job_id: Option<String>,
    pub tracked_items: Vec<TrackedItem>,
    pub detected_objects: Vec<String>,
    pub matched_products: Vec<Product>,
    pub suggested_products: Vec<String>,
    pub manual_product_name: Option<String>,
    pub affiliate_link: Option<String>,
    pub progress: f32,
    pub last_error: Option<StageError>,
    pub simulated: bool,
    final_match: Option<ProductMatch>,
    history: Vec<Step>,
    pub stages: Vec<StageReport>,
    pub record_id: Option<String>,
}

impl UploadSession {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            video: None,
            title: String::new(),
            description: None,
            step: Step::Select,
            job_id: None,
            tracked_items: Vec::new(),
            detected_objects: Vec::new(),
            matched_products: Vec::new(),
            suggested_products: Vec::new(),
            manual_product_name: None,
            affiliate_link: None,
            progress: 0.0,
            last_error: None,
            simulated: false,
            final_match: None,
            history: vec![Step::Select],
            stages: Vec::new(),
            record_id: None,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Every step the session has been in, oldest first.
    pub fn history(&self) -> &[Step] {
        &self.history
    }

    pub fn final_match(&self) -> Option<&ProductMatch> {
        self.final_match.as_ref()
    }

    pub(crate) fn move_to(&mut self, next: Step) {
        if self.step != next {
            self.step = next;
            self.history.push(next);
        }
    }

    /// Sets the job identifier once; a different identifier later is refused.
    pub(crate) fn assign_job_id(&mut self, job_id: &str) -> Result<(), StageError> {
        match &self.job_id {
            None => {
                self.job_id = Some(job_id.to_string());
                Ok(())
            }
            Some(existing) if existing == job_id => Ok(()),
            Some(existing) => Err(StageError::new(
                crate::error::StageErrorKind::Upload,
                Step::Upload,
                format!("job id already assigned ({existing}), refusing {job_id}"),
            )),
        }
    }

    /// Records the chosen candidate as the final match. Confirming the same
    /// choice again leaves the session untouched.
    pub(crate) fn confirm(&mut self, candidate: &Candidate) -> ConfirmOutcome {
        let next = ProductMatch::from_candidate(candidate);
        if self.final_match.as_ref() == Some(&next) {
            return ConfirmOutcome::Unchanged;
        }
        self.final_match = Some(next.clone());
        ConfirmOutcome::Recorded(next)
    }

    pub(crate) fn clear_match(&mut self) {
        self.final_match = None;
    }

    /// Wipes everything but the session id ("start over").
    pub(crate) fn reset(&mut self) {
        let id = self.id;
        *self = Self::with_id(id);
    }
}

impl Default for UploadSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str, size: u64, duration: f64) -> VideoHandle {
        VideoHandle {
            uri: format!("file:///videos/{name}"),
            file_name: name.to_string(),
            size_bytes: size,
            duration_secs: duration,
            local_path: None,
        }
    }

    #[test]
    fn forward_order_honours_tracking_variant() {
        assert_eq!(Step::Preview.next(true), Some(Step::Track));
        assert_eq!(Step::Preview.next(false), Some(Step::Upload));
        assert_eq!(Step::Upload.previous(false), Some(Step::Preview));
        assert_eq!(Step::Complete.next(true), None);
        assert!(Step::Upload < Step::Detect && Step::Verify < Step::Complete);
    }

    #[test]
    fn video_validation_checks_format_size_and_duration() {
        let limits = VideoLimits {
            max_bytes: 1_000,
            max_duration_secs: 60.0,
        };
        assert_eq!(handle("clip.MP4", 10, 12.0).validate(&limits), Ok(VideoFormat::Mp4));
        assert!(handle("clip.gif", 10, 12.0).validate(&limits).is_err());
        assert!(handle("clip.mov", 0, 12.0).validate(&limits).is_err());
        assert!(handle("clip.mov", 5_000, 12.0).validate(&limits).is_err());
        assert!(handle("clip.mov", 10, 0.0).validate(&limits).is_err());
        assert!(handle("clip.mov", 10, 61.0).validate(&limits).is_err());
        assert!(handle("clip.mov", 10, f64::NAN).validate(&limits).is_err());
    }

    #[test]
    fn tracked_item_invariants() {
        let item = TrackedItem::candidate(4, "laptop", 12.5);
        assert!(item.validate().is_ok());
        assert_eq!(item.category, "electronics");
        assert_eq!(item.end_secs, 12.5);

        let mut off_screen = item.clone();
        off_screen.x = 1.2;
        assert!(off_screen.validate().is_err());

        let mut reversed = item.clone();
        reversed.start_secs = 5.0;
        reversed.end_secs = 2.0;
        assert!(reversed.validate().is_err());

        let mut open_ended = item;
        open_ended.end_secs = f64::NAN;
        assert!(open_ended.validate().is_err());
        open_ended.end_secs = f64::INFINITY;
        assert!(open_ended.validate().is_err());
    }

    #[test]
    fn job_id_is_set_once() {
        let mut session = UploadSession::new();
        session.assign_job_id("vid-1").expect("first");
        session.assign_job_id("vid-1").expect("same id again");
        assert!(session.assign_job_id("vid-2").is_err());
        assert_eq!(session.job_id(), Some("vid-1"));
    }

    #[test]
    fn reconfirming_the_same_candidate_is_a_no_op() {
        let mut session = UploadSession::new();
        let candidate = Candidate::manual("Blue Mug", None);
        assert!(matches!(session.confirm(&candidate), ConfirmOutcome::Recorded(_)));
        assert_eq!(session.confirm(&candidate), ConfirmOutcome::Unchanged);
        let recorded = session.final_match().expect("match");
        assert_eq!(recorded.match_type, MatchType::Manual);
        assert!(recorded.confirmed);
    }

    #[test]
    fn reset_keeps_only_the_id() {
        let mut session = UploadSession::new();
        let id = session.id;
        session.title = "Desk tour".into();
        session.move_to(Step::Preview);
        session.assign_job_id("vid-1").expect("assign");
        session.reset();
        assert_eq!(session.id, id);
        assert_eq!(session.step(), Step::Select);
        assert!(session.title.is_empty());
        assert_eq!(session.job_id(), None);
        assert_eq!(session.history(), &[Step::Select]);
    }

    #[test]
    fn match_type_wire_names() {
        assert_eq!(serde_json::to_value(MatchType::AiSuggestion).unwrap(), "ai_suggestion");
        assert_eq!(serde_json::to_value(MatchType::YoloDirect).unwrap(), "yolo_direct");
        assert_eq!(MatchType::Manual.as_str(), "manual");
    }
}
