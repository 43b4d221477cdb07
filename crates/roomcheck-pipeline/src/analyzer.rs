use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use roomcheck_core::config::{expand_path, AppConfig};
use roomcheck_core::types::{Detection, DetectionSummary, ImageContext, IncidentAssessment, PolicySummary, RetrievedRule};
use roomcheck_core::{CancellationToken, Error};
use roomcheck_index::{IndexOptions, IndexRegistry, LanceRuleStore, RuleIndex};
use roomcheck_judge::JudgmentEngine;

use crate::aggregate::aggregate;
use crate::backends::Backends;
use crate::retriever::RuleRetriever;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Detection,
    Indexing,
    Retrieval,
    Judgment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Detection => "detection",
            Self::Indexing => "indexing",
            Self::Retrieval => "retrieval",
            Self::Judgment => "judgment",
        })
    }
}

/// A failed analysis: which stage stopped it and why.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct AnalyzeError {
    pub stage: Stage,
    pub source: Error,
}

impl AnalyzeError {
    fn at(stage: Stage) -> impl FnOnce(Error) -> Self { move |source| Self { stage, source } }

    pub fn is_retryable(&self) -> bool { self.source.is_retryable() }
}

/// Everything a report or notification collaborator receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub assessment: IncidentAssessment,
    pub detections: Vec<Detection>,
    pub detection_summary: DetectionSummary,
    pub image: ImageContext,
    pub retrieved: BTreeMap<String, Vec<RetrievedRule>>,
    pub policy: PolicySummary,
    pub vocabulary: String,
}

pub struct Analyzer {
    backends: Backends,
    registry: Arc<IndexRegistry>,
    judge: JudgmentEngine,
    use_category_hint: bool,
}

impl Analyzer {
    /// In-memory indexes only.
    pub fn new(backends: Backends, config: &AppConfig) -> Self {
        let registry = IndexRegistry::new(backends.embedder.clone(), IndexOptions::from(&config.index));
        Self::with_registry(backends, Arc::new(registry), config)
    }

    /// Like [`Analyzer::new`], persisting indexes under `store.lancedb_dir` when it is set.
    pub async fn open(backends: Backends, config: &AppConfig) -> anyhow::Result<Self> {
        let mut registry = IndexRegistry::new(backends.embedder.clone(), IndexOptions::from(&config.index));
        if let Some(dir) = &config.store.lancedb_dir {
            let store = LanceRuleStore::open(&expand_path(dir)).await?;
            registry = registry.with_store(Arc::new(store));
        }
        Ok(Self::with_registry(backends, Arc::new(registry), config))
    }

    pub fn with_registry(backends: Backends, registry: Arc<IndexRegistry>, config: &AppConfig) -> Self {
        let judge = JudgmentEngine::from_config(backends.reasoning.clone(), &config.judge);
        Self { backends, registry, judge, use_category_hint: config.retrieval.use_category_hint }
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> { &self.registry }

    pub async fn index_policy(&self, policy_bytes: &[u8], cancel: &CancellationToken) -> Result<Arc<RuleIndex>, AnalyzeError> {
        self.registry.get_or_build_bytes(policy_bytes, cancel).await.map_err(AnalyzeError::at(Stage::Indexing))
    }

    pub async fn analyze(
        &self,
        image_bytes: &[u8],
        policy_bytes: &[u8],
        confidence_threshold: f32,
        k_per_label: usize,
        cancel: &CancellationToken,
    ) -> Result<IncidentAssessment, AnalyzeError> {
        self.analyze_with_context(image_bytes, policy_bytes, confidence_threshold, k_per_label, cancel)
            .await
            .map(|report| report.assessment)
    }

    /// Detect and index concurrently, retrieve per label, judge every detection, aggregate.
    ///
    /// A failed detection does not abandon a policy build already under way; the
    /// registry finishes it for the next request.
    pub async fn analyze_with_context(
        &self,
        image_bytes: &[u8],
        policy_bytes: &[u8],
        confidence_threshold: f32,
        k_per_label: usize,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReport, AnalyzeError> {
        let detect = {
            let detector = self.backends.detector.clone();
            let image = image_bytes.to_vec();
            let cancel = cancel.clone();
            async move {
                tokio::task::spawn_blocking(move || detector.inspect(&image, confidence_threshold, &cancel))
                    .await
                    .map_err(|e| Error::ModelUnavailable(format!("detection task failed: {e}")))
                    .and_then(|r| r)
                    .map_err(AnalyzeError::at(Stage::Detection))
            }
        };
        let (inspection, index) =
            tokio::try_join!(detect.instrument(info_span!("detect")), self.index_policy(policy_bytes, cancel))?;
        let detections = inspection.detections;
        let context = inspection.context;

        let retrieved = {
            let retriever = RuleRetriever::new(index.clone(), self.use_category_hint);
            let labels = detections.clone();
            tokio::task::spawn_blocking(move || retriever.retrieve_for(&labels, k_per_label))
                .await
                .map_err(|e| Error::ModelUnavailable(format!("retrieval task failed: {e}")))
                .and_then(|r| r)
                .map_err(AnalyzeError::at(Stage::Retrieval))?
        };
        cancel.check().map_err(AnalyzeError::at(Stage::Retrieval))?;

        let judgments = detections.iter().map(|d| {
            let rules = retrieved.get(&d.label).map(Vec::as_slice).unwrap_or(&[]);
            self.judge.assess_in_context(d, rules, Some(&context), cancel)
        });
        let verdicts = join_all(judgments).await;
        cancel.check().map_err(AnalyzeError::at(Stage::Judgment))?;

        let assessment = aggregate(verdicts);
        info!(
            detections = detections.len(),
            room = %context.room_type,
            violation = assessment.violation_found,
            severity = %assessment.dominant_severity,
            rules = assessment.consolidated_rules.len(),
            "analysis complete"
        );
        Ok(AnalysisReport {
            assessment,
            detection_summary: DetectionSummary::from_detections(&detections),
            detections,
            image: context,
            retrieved,
            policy: index.summary(),
            vocabulary: self.backends.detector.vocabulary().version().to_string(),
        })
    }
}
