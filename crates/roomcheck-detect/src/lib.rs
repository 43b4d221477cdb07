//! Image -> ranked detections over a closed label vocabulary.

use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, info};

use roomcheck_core::config::DetectorConfig;
use roomcheck_core::types::{Detection, ImageContext};
use roomcheck_core::{CancellationToken, Error, Result};

mod clip;
pub mod vocabulary;

pub use clip::{resolve_clip_dir, ClipClassifier};
pub use vocabulary::LabelVocabulary;

/// Zero-shot image scorer. Returns one probability in [0,1] per prompt, in prompt order.
pub trait ImageClassifier: Send + Sync {
    fn model_id(&self) -> &str;
    fn score(&self, image: &RgbImage, prompts: &[String]) -> anyhow::Result<Vec<f32>>;
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Detections plus what the photo itself says about the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub detections: Vec<Detection>,
    pub context: ImageContext,
}

#[derive(Clone)]
pub struct Detector {
    classifier: Arc<dyn ImageClassifier>,
    vocabulary: LabelVocabulary,
}

impl Detector {
    pub fn new(classifier: Arc<dyn ImageClassifier>, vocabulary: LabelVocabulary) -> Self {
        Self { classifier, vocabulary }
    }

    pub fn vocabulary(&self) -> LabelVocabulary { self.vocabulary }

    pub fn detect(&self, image_bytes: &[u8], confidence_threshold: f32) -> Result<Vec<Detection>> {
        self.detect_with_cancel(image_bytes, confidence_threshold, &CancellationToken::new())
    }

    /// Labels scoring at or above `confidence_threshold`, highest first, one entry per label.
    pub fn detect_with_cancel(
        &self,
        image_bytes: &[u8],
        confidence_threshold: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Detection>> {
        self.inspect(image_bytes, confidence_threshold, cancel).map(|i| i.detections)
    }

    /// Like [`Detector::detect_with_cancel`], also reporting image size and the room type it suggests.
    pub fn inspect(&self, image_bytes: &[u8], confidence_threshold: f32, cancel: &CancellationToken) -> Result<Inspection> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(Error::InvalidInput(format!("confidence threshold {confidence_threshold} outside [0,1]")));
        }
        let image = decode_image(image_bytes)?;
        let context = ImageContext::from_dimensions(image.width(), image.height());
        cancel.check()?;
        let prompts = self.vocabulary.prompts();
        let scores = self
            .classifier
            .score(&image, &prompts)
            .map_err(|e| Error::ModelUnavailable(format!("{}: {e:#}", self.classifier.model_id())))?;
        cancel.check()?;
        if scores.len() != prompts.len() {
            return Err(Error::ModelUnavailable(format!(
                "{} returned {} scores for {} labels",
                self.classifier.model_id(),
                scores.len(),
                prompts.len()
            )));
        }
        let detections = rank(self.vocabulary, &scores, confidence_threshold);
        info!(
            vocabulary = self.vocabulary.version(),
            threshold = confidence_threshold,
            found = detections.len(),
            room = %context.room_type,
            "detection complete"
        );
        Ok(Inspection { detections, context })
    }
}

/// Keep the best score per label, filter by threshold, order by score then vocabulary position.
fn rank(vocabulary: LabelVocabulary, scores: &[f32], threshold: f32) -> Vec<Detection> {
    let mut best: Vec<(usize, f32)> = Vec::new();
    for (idx, ((label, _), &score)) in vocabulary.entries().iter().zip(scores).enumerate() {
        if !score.is_finite() { continue; }
        match best.iter_mut().find(|(i, _)| vocabulary.entries()[*i].0 == *label) {
            Some(entry) => { if score > entry.1 { entry.1 = score; } }
            None => best.push((idx, score)),
        }
    }
    best.retain(|(_, score)| *score >= threshold);
    best.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    for (idx, score) in best.iter().take(10) {
        debug!(label = vocabulary.entries()[*idx].0, score, "detection");
    }
    best.into_iter()
        .map(|(idx, score)| {
            let (label, category) = vocabulary.entries()[idx];
            Detection::new(label, category, score)
        })
        .collect()
}

/// Build a detector backed by the CLIP model named in `config`.
pub fn load_detector(config: &DetectorConfig) -> anyhow::Result<Detector> {
    let vocabulary: LabelVocabulary = config.vocabulary.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let dir = resolve_clip_dir(config.model_dir.as_deref())?;
    let classifier = ClipClassifier::load(&dir, config.device)?;
    Ok(Detector::new(Arc::new(classifier), vocabulary))
}
