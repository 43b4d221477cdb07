//! Domain types shared by the detector, rule index, judgment engine and aggregator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type FragmentId = String;

/// Coarse object category attached to every detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectCategory {
    Furniture,
    Appliance,
    Substance,
    SafetyHazard,
    Decoration,
    Other,
}

impl ObjectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Furniture => "furniture",
            Self::Appliance => "appliance",
            Self::Substance => "substance",
            Self::SafetyHazard => "safety-hazard",
            Self::Decoration => "decoration",
            Self::Other => "other",
        }
    }

    /// Plain words for use inside free-text queries and prompts.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::SafetyHazard => "safety hazard",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A labeled, confidence-scored object hypothesis produced from an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub category: ObjectCategory,
    pub confidence: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, category: ObjectCategory, confidence: f32) -> Self {
        Self { label: label.into(), category, confidence: confidence.clamp(0.0, 1.0) }
    }
}

/// Policy area a rule fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    FireSafety,
    Alcohol,
    Pet,
    Appliance,
    Guest,
    Noise,
    Other,
}

impl RuleType {
    pub const ALL: [RuleType; 7] = [
        Self::FireSafety,
        Self::Alcohol,
        Self::Pet,
        Self::Appliance,
        Self::Guest,
        Self::Noise,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FireSafety => "fire-safety",
            Self::Alcohol => "alcohol",
            Self::Pet => "pet",
            Self::Appliance => "appliance",
            Self::Guest => "guest",
            Self::Noise => "noise",
            Self::Other => "other",
        }
    }

    /// Keyword categorization of a fragment. First matching group wins.
    pub fn classify(text: &str) -> Self {
        const GROUPS: &[(RuleType, &[&str])] = &[
            (RuleType::FireSafety, &["fire", "flame", "candle", "burning", "smoke", "incense"]),
            (RuleType::Pet, &["pet", "animal", "dog", "cat", "aquarium"]),
            (RuleType::Alcohol, &["alcohol", "drinking", "beer", "wine", "liquor"]),
            (RuleType::FireSafety, &["smoking", "tobacco", "vape", "cigarette"]),
            (RuleType::Appliance, &["appliance", "microwave", "toaster", "heater", "hot plate"]),
            (RuleType::Noise, &["noise", "quiet", "loud", "disturbance"]),
            (RuleType::Guest, &["guest", "visitor", "overnight"]),
        ];
        let lower = text.to_lowercase();
        GROUPS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map(|(rule_type, _)| *rule_type)
            .unwrap_or(RuleType::Other)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown rule type '{s}'"))
    }
}

/// Where a fragment came from in the source document.
///
/// `ordinal` is the position among surviving fragments and is used to break
/// ranking ties; `start`/`end` are byte offsets into the decoded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOffset {
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
}

/// An atomic, independently retrievable unit of policy text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFragment {
    pub id: FragmentId,
    pub text: String,
    /// Kept out of serialized reports; the index and store carry vectors.
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub rule_type: RuleType,
    pub source_offset: SourceOffset,
}

/// A fragment returned for one query with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedRule {
    pub fragment: RuleFragment,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Action suggested when a verdict does not name one itself.
    pub fn default_action(&self) -> &'static str {
        match self {
            Self::None => NO_ACTION,
            Self::Low => "Notify the resident and document the item",
            Self::Medium => "Remove the item and schedule a follow-up inspection",
            Self::High => "Immediate removal required; escalate to residence life staff",
        }
    }
}

pub const NO_ACTION: &str = "No action required";
pub const MANUAL_REVIEW: &str = "Manual review required";

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// The judgment for one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub subject: Detection,
    pub violation_found: bool,
    pub matched_rule_ids: BTreeSet<FragmentId>,
    pub severity: Severity,
    pub confidence: f32,
    pub rationale: String,
    pub recommended_action: String,
}

impl Verdict {
    /// Conservative no-violation verdict used whenever a judgment cannot be trusted.
    pub fn conservative(subject: Detection, rationale: impl Into<String>) -> Self {
        Self {
            subject,
            violation_found: false,
            matched_rule_ids: BTreeSet::new(),
            severity: Severity::None,
            confidence: 0.0,
            rationale: rationale.into(),
            recommended_action: MANUAL_REVIEW.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
}

/// The aggregate verdict for an entire analyzed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentAssessment {
    pub violation_found: bool,
    pub dominant_severity: Severity,
    pub verdicts: Vec<Verdict>,
    pub consolidated_rules: BTreeSet<FragmentId>,
    pub recommended_action: String,
}

impl IncidentAssessment {
    pub fn compliance_status(&self) -> ComplianceStatus {
        if self.violation_found { ComplianceStatus::NonCompliant } else { ComplianceStatus::Compliant }
    }

    pub fn violations(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| v.violation_found)
    }

    /// Short human-readable summary for notification collaborators.
    pub fn summary(&self) -> String {
        if !self.violation_found {
            return format!("No policy violations detected ({} objects assessed).", self.verdicts.len());
        }
        let objects: Vec<&str> = self.violations().map(|v| v.subject.label.as_str()).collect();
        let top_confidence = self.violations().map(|v| v.confidence).fold(0.0f32, f32::max);
        [
            "POLICY VIOLATION DETECTED".to_string(),
            format!("Violating objects: {}", objects.join(", ")),
            format!("Policy rules matched: {}", self.consolidated_rules.len()),
            format!("Severity: {}", self.dominant_severity.as_str().to_uppercase()),
            format!("Confidence: {:.1}%", top_confidence * 100.0),
            format!("Recommended action: {}", self.recommended_action),
        ]
        .join("\n")
    }
}

/// Fragment counts of a built index, per policy area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    pub total_fragments: usize,
    pub by_rule_type: BTreeMap<RuleType, usize>,
}

/// Detections grouped by category, with the most confident one singled out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub total: usize,
    pub by_category: BTreeMap<ObjectCategory, Vec<Detection>>,
    pub primary: Option<Detection>,
}

impl DetectionSummary {
    /// Ties for `primary` go to the earlier detection.
    pub fn from_detections(detections: &[Detection]) -> Self {
        let mut by_category: BTreeMap<ObjectCategory, Vec<Detection>> = BTreeMap::new();
        let mut primary: Option<&Detection> = None;
        for d in detections {
            by_category.entry(d.category).or_default().push(d.clone());
            if primary.map_or(true, |p| d.confidence > p.confidence) {
                primary = Some(d);
            }
        }
        Self { total: detections.len(), by_category, primary: primary.cloned() }
    }

    pub fn message(&self) -> String {
        match &self.primary {
            None => "No objects detected in the image.".to_string(),
            Some(d) => format!("Detected {} (confidence: {:.1}%)", d.label, d.confidence * 100.0),
        }
    }
}

/// Rough scene type guessed from the photo's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomType {
    HallwayOrCorridor,
    TallRoomOrStairwell,
    StandardRoom,
}

impl RoomType {
    /// Wider than 1.5:1 reads as a corridor, narrower than 0.7:1 as a stairwell.
    pub fn from_aspect_ratio(ratio: f32) -> Self {
        if ratio > 1.5 {
            Self::HallwayOrCorridor
        } else if ratio < 0.7 {
            Self::TallRoomOrStairwell
        } else {
            Self::StandardRoom
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HallwayOrCorridor => "hallway or corridor",
            Self::TallRoomOrStairwell => "tall room or stairwell",
            Self::StandardRoom => "standard room",
        }
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageContext {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f32,
    pub room_type: RoomType,
}

impl ImageContext {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        let aspect_ratio = width as f32 / height.max(1) as f32;
        Self { width, height, aspect_ratio, room_type: RoomType::from_aspect_ratio(aspect_ratio) }
    }
}
