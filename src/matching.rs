//! Hybrid matching: manual entry, backend direct matches and locally generated
//! suggestions are surfaced side by side; the user picks one.

use crate::config::DefaultChoice;
use crate::models::Product;
use crate::session::{ConfirmOutcome, MatchType, UploadSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

struct CatalogEntry {
    category: &'static str,
    suggestions: &'static [&'static str],
}

const fn entry(category: &'static str, suggestions: &'static [&'static str]) -> CatalogEntry {
    CatalogEntry {
        category,
        suggestions,
    }
}

static CATALOG: Lazy<HashMap<&'static str, CatalogEntry>> = Lazy::new(|| {
    HashMap::from([
        ("laptop", entry("electronics", &["laptop", "laptop stand"])),
        ("smartphone", entry("electronics", &["smartphone", "phone case"])),
        ("tv", entry("electronics", &["smart tv"])),
        ("keyboard", entry("electronics", &["mechanical keyboard"])),
        ("mouse", entry("electronics", &["wireless mouse"])),
        ("remote", entry("electronics", &["universal remote"])),
        ("headphones", entry("electronics", &["wireless headphones"])),
        ("camera", entry("electronics", &["mirrorless camera"])),
        ("watch", entry("accessories", &["wrist watch", "smartwatch"])),
        ("glasses", entry("accessories", &["sunglasses"])),
        ("umbrella", entry("accessories", &["compact umbrella"])),
        ("handbag", entry("bags", &["leather handbag"])),
        ("backpack", entry("bags", &["everyday backpack"])),
        ("suitcase", entry("bags", &["carry-on suitcase"])),
        ("hat", entry("clothing", &["baseball cap"])),
        ("shirt", entry("clothing", &["cotton t-shirt"])),
        ("pants", entry("clothing", &["chinos"])),
        ("tie", entry("clothing", &["silk tie"])),
        ("sneakers", entry("shoes", &["running sneakers"])),
        ("boots", entry("shoes", &["leather boots"])),
        ("sandals", entry("shoes", &["slide sandals"])),
        ("coffee mug", entry("kitchen", &["coffee mug"])),
        ("mug", entry("kitchen", &["ceramic mug", "travel mug"])),
        ("bottle", entry("kitchen", &["water bottle"])),
        ("wine glass", entry("kitchen", &["wine glasses"])),
        ("bowl", entry("kitchen", &["serving bowl"])),
        ("chair", entry("furniture", &["desk chair"])),
        ("couch", entry("furniture", &["sofa"])),
        ("table", entry("furniture", &["coffee table"])),
        ("bed", entry("furniture", &["bed frame"])),
        ("lamp", entry("home", &["table lamp"])),
        ("plant", entry("home", &["indoor plant", "planter"])),
        ("vase", entry("home", &["ceramic vase"])),
        ("clock", entry("home", &["wall clock"])),
        ("book", entry("books", &["hardcover book"])),
        ("skateboard", entry("sports", &["complete skateboard"])),
        ("bicycle", entry("sports", &["city bike"])),
        ("sports ball", entry("sports", &["soccer ball"])),
        ("tennis racket", entry("sports", &["tennis racket"])),
        ("teddy bear", entry("toys", &["plush teddy bear"])),
        ("hair drier", entry("beauty", &["hair dryer"])),
        ("toothbrush", entry("beauty", &["electric toothbrush"])),
    ])
});

/// Detector class names mapped to the shopper-facing name used by the catalog.
static ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("cell phone", "smartphone"),
        ("phone", "smartphone"),
        ("cup", "coffee mug"),
        ("shoe", "sneakers"),
        ("sneaker", "sneakers"),
        ("footwear", "sneakers"),
        ("boot", "boots"),
        ("sandal", "sandals"),
        ("potted plant", "plant"),
        ("dining table", "table"),
        ("sofa", "couch"),
        ("tv monitor", "tv"),
    ])
});

/// Classes the detector reports that nobody can buy.
const NON_SHOPPABLE: &[&str] = &[
    "person", "dog", "cat", "bird", "horse", "sheep", "cow", "elephant", "bear", "zebra",
    "giraffe", "car", "truck", "bus", "train", "airplane", "boat", "traffic light",
    "fire hydrant", "stop sign", "parking meter", "bench",
];

fn canonical_name(object: &str) -> String {
    let lowered = object.trim().to_lowercase();
    ALIASES
        .get(lowered.as_str())
        .map(|alias| alias.to_string())
        .unwrap_or(lowered)
}

pub fn is_shoppable(object: &str) -> bool {
    let name = canonical_name(object);
    !name.is_empty() && !NON_SHOPPABLE.contains(&name.as_str())
}

pub fn category_for(object: &str) -> &'static str {
    CATALOG
        .get(canonical_name(object).as_str())
        .map(|entry| entry.category)
        .unwrap_or("other")
}

/// Suggestion names for detected objects, in detection order, without
/// duplicates. Unknown but shoppable objects suggest themselves.
pub fn generate_suggestions(objects: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for object in objects {
        if !is_shoppable(object) {
            continue;
        }
        let name = canonical_name(object);
        let names: Vec<String> = match CATALOG.get(name.as_str()) {
            Some(entry) => entry.suggestions.iter().map(|s| s.to_string()).collect(),
            None => vec![name],
        };
        for suggestion in names {
            if seen.insert(suggestion.clone()) {
                out.push(suggestion);
            }
        }
    }
    out
}

/// One selectable option for the final product association.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub source: MatchType,
    pub name: String,
    #[serde(default)]
    pub product: Option<Product>,
    #[serde(default)]
    pub detected_object: Option<String>,
    #[serde(default)]
    pub affiliate_link: Option<String>,
}

impl Candidate {
    pub fn manual(name: &str, affiliate_link: Option<&str>) -> Self {
        Self {
            source: MatchType::Manual,
            name: name.trim().to_string(),
            product: None,
            detected_object: None,
            affiliate_link: affiliate_link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
        }
    }

    pub fn suggestion(name: &str, detected_object: Option<&str>) -> Self {
        Self {
            source: MatchType::AiSuggestion,
            name: name.to_string(),
            product: None,
            detected_object: detected_object.map(str::to_string),
            affiliate_link: None,
        }
    }

    pub fn direct(product: &Product) -> Self {
        Self {
            source: MatchType::YoloDirect,
            name: product.name.clone(),
            product: Some(product.clone()),
            detected_object: product.matched_object.clone(),
            affiliate_link: product.affiliate_link.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct MatchCandidates {
    pub manual: Option<Candidate>,
    pub suggestions: Vec<String>,
    pub direct: Vec<Product>,
    /// Manual entry first, then direct matches, then suggestions that no direct
    /// match already covers.
    pub combined: Vec<Candidate>,
}

impl MatchCandidates {
    pub fn is_empty(&self) -> bool {
        self.combined.is_empty()
    }

    /// Deterministic pick for flows that confirm without a user.
    pub fn default_choice(&self, policy: DefaultChoice) -> Option<Candidate> {
        let first_of = |source: MatchType| {
            self.combined
                .iter()
                .find(|candidate| candidate.source == source)
                .cloned()
        };
        let order = match policy {
            DefaultChoice::ManualFirst => [MatchType::Manual, MatchType::YoloDirect, MatchType::AiSuggestion],
            DefaultChoice::DirectFirst => [MatchType::YoloDirect, MatchType::Manual, MatchType::AiSuggestion],
            DefaultChoice::SuggestionFirst => [MatchType::AiSuggestion, MatchType::Manual, MatchType::YoloDirect],
        };
        order.into_iter().find_map(first_of)
    }

    /// The offered option matching `candidate` by source and name, if any.
    pub fn offered(&self, candidate: &Candidate) -> Option<&Candidate> {
        self.combined
            .iter()
            .find(|c| c.source == candidate.source && c.name.eq_ignore_ascii_case(&candidate.name))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeedbackEvent {
    pub session_id: Uuid,
    pub match_type: MatchType,
    pub product_name: String,
    pub detected_object: Option<String>,
    pub detected_objects: Vec<String>,
    pub suggestions_offered: Vec<String>,
    pub simulated: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Receives which source won each confirmed match, for suggestion learning.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record(&self, event: &FeedbackEvent);
}

pub struct TracingFeedback;

#[async_trait]
impl FeedbackSink for TracingFeedback {
    async fn record(&self, event: &FeedbackEvent) {
        info!(
            target = "shoppable.matching",
            session_id = %event.session_id,
            match_type = event.match_type.as_str(),
            product = %event.product_name,
            simulated = event.simulated,
            "match_feedback"
        );
    }
}

#[derive(Clone)]
pub struct MatchingCoordinator {
    feedback: Arc<dyn FeedbackSink>,
}

impl MatchingCoordinator {
    pub fn new(feedback: Arc<dyn FeedbackSink>) -> Self {
        Self { feedback }
    }

    pub fn candidates(
        &self,
        objects: &[String],
        direct: &[Product],
        manual_name: Option<&str>,
        affiliate_link: Option<&str>,
    ) -> MatchCandidates {
        let manual = manual_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Candidate::manual(name, affiliate_link));

        let mut direct_seen = HashSet::new();
        let direct: Vec<Product> = direct
            .iter()
            .filter(|p| !p.name.trim().is_empty())
            .filter(|p| direct_seen.insert(p.name.trim().to_lowercase()))
            .cloned()
            .collect();

        let suggestions = generate_suggestions(objects);

        let mut combined = Vec::new();
        if let Some(manual) = &manual {
            combined.push(manual.clone());
        }
        combined.extend(direct.iter().map(Candidate::direct));
        for suggestion in &suggestions {
            if direct_seen.contains(&suggestion.to_lowercase()) {
                continue;
            }
            let origin = objects.iter().find(|object| {
                generate_suggestions(std::slice::from_ref(*object)).contains(suggestion)
            });
            combined.push(Candidate::suggestion(suggestion, origin.map(String::as_str)));
        }

        MatchCandidates {
            manual,
            suggestions,
            direct,
            combined,
        }
    }

    /// Records `candidate` on the session and forwards one feedback event per
    /// distinct confirmation.
    pub async fn confirm(&self, session: &mut UploadSession, candidate: &Candidate) -> ConfirmOutcome {
        let outcome = session.confirm(candidate);
        if let ConfirmOutcome::Recorded(recorded) = &outcome {
            let event = FeedbackEvent {
                session_id: session.id,
                match_type: recorded.match_type,
                product_name: recorded.product_name.clone(),
                detected_object: recorded.detected_object.clone(),
                detected_objects: session.detected_objects.clone(),
                suggestions_offered: session.suggested_products.clone(),
                simulated: session.simulated,
                recorded_at: Utc::now(),
            };
            self.feedback.record(&event).await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryFeedback;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn suggestions_map_detector_classes_and_skip_people() {
        let suggestions = generate_suggestions(&names(&["person", "cell phone", "cup", "Mug", "drone"]));
        assert_eq!(
            suggestions,
            vec!["smartphone", "phone case", "coffee mug", "ceramic mug", "travel mug", "drone"]
        );
        assert!(generate_suggestions(&names(&["dog", "stop sign"])).is_empty());
    }

    #[test]
    fn categories_follow_aliases() {
        assert_eq!(category_for("sneaker"), "shoes");
        assert_eq!(category_for("potted plant"), "home");
        assert_eq!(category_for("spaceship"), "other");
    }

    #[test]
    fn all_three_sources_are_exposed_in_rank_order() {
        let coordinator = MatchingCoordinator::new(Arc::new(MemoryFeedback::default()));
        let candidates = coordinator.candidates(
            &names(&["mug"]),
            &[Product::named("Mug Co. 12oz")],
            Some("Blue Mug"),
            Some("https://shop.example/blue-mug"),
        );
        assert_eq!(candidates.manual.as_ref().map(|c| c.name.as_str()), Some("Blue Mug"));
        assert!(candidates.suggestions.contains(&"ceramic mug".to_string()));
        assert_eq!(candidates.direct, vec![Product::named("Mug Co. 12oz")]);

        let sources: Vec<MatchType> = candidates.combined.iter().map(|c| c.source).collect();
        assert_eq!(sources[0], MatchType::Manual);
        assert_eq!(sources[1], MatchType::YoloDirect);
        assert!(sources[2..].iter().all(|s| *s == MatchType::AiSuggestion));
        let ceramic = candidates
            .combined
            .iter()
            .find(|c| c.name == "ceramic mug")
            .expect("ceramic mug offered");
        assert_eq!(ceramic.detected_object.as_deref(), Some("mug"));
    }

    #[test]
    fn empty_inputs_produce_no_candidates() {
        let coordinator = MatchingCoordinator::new(Arc::new(MemoryFeedback::default()));
        let candidates = coordinator.candidates(&[], &[], Some("   "), None);
        assert!(candidates.is_empty());
        assert_eq!(candidates.default_choice(DefaultChoice::ManualFirst), None);
    }

    #[test]
    fn default_choice_follows_policy() {
        let coordinator = MatchingCoordinator::new(Arc::new(MemoryFeedback::default()));
        let candidates = coordinator.candidates(
            &names(&["laptop"]),
            &[Product::named("ThinkBook 14")],
            Some("My Laptop"),
            None,
        );
        let pick = |p| candidates.default_choice(p).map(|c| c.source);
        assert_eq!(pick(DefaultChoice::ManualFirst), Some(MatchType::Manual));
        assert_eq!(pick(DefaultChoice::DirectFirst), Some(MatchType::YoloDirect));
        assert_eq!(pick(DefaultChoice::SuggestionFirst), Some(MatchType::AiSuggestion));
    }

    #[tokio::test]
    async fn confirming_manual_entry_emits_one_feedback_event() {
        let feedback = Arc::new(MemoryFeedback::default());
        let coordinator = MatchingCoordinator::new(feedback.clone());
        let mut session = UploadSession::new();
        session.detected_objects = names(&["mug"]);
        let candidates = coordinator.candidates(
            &session.detected_objects,
            &[Product::named("Mug Co. 12oz")],
            Some("Blue Mug"),
            None,
        );
        let manual = candidates.manual.clone().expect("manual");

        let first = coordinator.confirm(&mut session, &manual).await;
        let second = coordinator.confirm(&mut session, &manual).await;
        assert!(matches!(first, ConfirmOutcome::Recorded(ref m) if m.match_type == MatchType::Manual));
        assert_eq!(second, ConfirmOutcome::Unchanged);

        let events = feedback.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].match_type, MatchType::Manual);
        assert_eq!(events[0].product_name, "Blue Mug");
    }
}
