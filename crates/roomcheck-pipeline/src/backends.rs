use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use roomcheck_core::config::AppConfig;
use roomcheck_core::traits::Embedder;
use roomcheck_detect::{load_detector, Detector};
use roomcheck_embed::load_embedder;
use roomcheck_judge::{HttpReasoningBackend, ReasoningBackend};

/// Process-wide model and client handles, created once and passed to the components that need them.
#[derive(Clone)]
pub struct Backends {
    pub embedder: Arc<dyn Embedder>,
    pub detector: Detector,
    pub reasoning: Arc<dyn ReasoningBackend>,
}

impl Backends {
    pub fn new(embedder: Arc<dyn Embedder>, detector: Detector, reasoning: Arc<dyn ReasoningBackend>) -> Self {
        Self { embedder, detector, reasoning }
    }

    /// Load every model named in `config`. Blocking; call once at startup.
    pub fn init(config: &AppConfig) -> anyhow::Result<Self> {
        let embedder = load_embedder(&config.embedding).context("loading text embedder")?;
        let detector = load_detector(&config.detector).context("loading image classifier")?;
        let reasoning: Arc<dyn ReasoningBackend> =
            Arc::new(HttpReasoningBackend::new(&config.judge).context("creating reasoning client")?);
        info!(
            embedder = embedder.embedder_id(),
            vocabulary = detector.vocabulary().version(),
            reasoning = reasoning.backend_id(),
            "backends initialized"
        );
        Ok(Self::new(embedder, detector, reasoning))
    }

    /// Release the handles. Models are freed once the last clone is gone.
    pub fn shutdown(self) {
        let outstanding = Arc::strong_count(&self.embedder).saturating_sub(1);
        info!(outstanding, "backends shut down");
    }
}
