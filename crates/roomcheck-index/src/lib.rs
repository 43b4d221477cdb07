//! Semantically searchable rule fragments built from one policy document.
//!
//! A [`RuleIndex`] is built once from document bytes, then shared read-only as
//! `Arc<RuleIndex>`. Queries embed the text with the same embedder the index was
//! built with and rank every fragment by cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use roomcheck_core::config::IndexConfig;
use roomcheck_core::policy::{DocumentId, PolicyDocument, PolicyProcessor, SplitOptions};
use roomcheck_core::traits::Embedder;
use roomcheck_core::types::{PolicySummary, RetrievedRule, RuleFragment};
use roomcheck_core::{CancellationToken, Error, Result};

mod registry;
pub mod schema;
mod store;

pub use registry::IndexRegistry;
pub use store::LanceRuleStore;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub min_fragment_chars: usize,
    pub embed_batch_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self { Self { min_fragment_chars: 20, embed_batch_size: 32 } }
}

impl IndexOptions {
    /// The options that decide which fragments exist. Batch size only affects speed.
    pub fn split(&self) -> SplitOptions { SplitOptions { min_fragment_chars: self.min_fragment_chars } }
}

impl From<&IndexConfig> for IndexOptions {
    fn from(c: &IndexConfig) -> Self {
        Self { min_fragment_chars: c.min_fragment_chars, embed_batch_size: c.embed_batch_size.max(1) }
    }
}

pub struct RuleIndex {
    document_id: DocumentId,
    fragments: Vec<RuleFragment>,
    positions: HashMap<String, usize>,
    embedder: Arc<dyn Embedder>,
    split: SplitOptions,
}

impl std::fmt::Debug for RuleIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleIndex")
            .field("document_id", &self.document_id)
            .field("fragments", &self.fragments.len())
            .field("embedder", &self.embedder.embedder_id())
            .field("split", &self.split)
            .finish()
    }
}

impl RuleIndex {
    pub fn build_from_bytes(
        bytes: &[u8],
        embedder: Arc<dyn Embedder>,
        options: &IndexOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        Self::build(&PolicyDocument::from_bytes(bytes)?, embedder, options, cancel)
    }

    /// Split, embed and assemble. Nothing is returned unless every fragment was embedded.
    pub fn build(
        document: &PolicyDocument,
        embedder: Arc<dyn Embedder>,
        options: &IndexOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        cancel.check()?;
        let processor = PolicyProcessor::new(options.split());
        let clauses = processor.split(document);
        if clauses.is_empty() {
            return Err(Error::EmptyDocument);
        }
        let texts: Vec<String> = clauses.iter().map(|c| c.text.clone()).collect();
        let mut embeddings = Vec::with_capacity(texts.len());
        for (batch_no, batch) in texts.chunks(options.embed_batch_size.max(1)).enumerate() {
            cancel.check()?;
            let vectors = embed_checked(embedder.as_ref(), batch)?;
            debug!(batch = batch_no, size = batch.len(), "embedded rule fragments");
            embeddings.extend(vectors);
        }
        cancel.check()?;
        let fragments = clauses
            .into_iter()
            .zip(embeddings)
            .map(|(clause, embedding)| RuleFragment {
                id: clause.id,
                text: clause.text,
                embedding,
                rule_type: clause.rule_type,
                source_offset: clause.source_offset,
            })
            .collect();
        let index = Self::from_parts(document.id.clone(), fragments, embedder, options.split())?;
        info!(document = %short(&index.document_id), fragments = index.len(), "rule index built");
        Ok(index)
    }

    /// Assemble an index from already embedded fragments, e.g. ones loaded from a store.
    /// `split` records the options the fragments were cut with.
    pub fn from_parts(
        document_id: DocumentId,
        mut fragments: Vec<RuleFragment>,
        embedder: Arc<dyn Embedder>,
        split: SplitOptions,
    ) -> Result<Self> {
        if fragments.is_empty() {
            return Err(Error::EmptyDocument);
        }
        let dim = embedder.dim();
        if let Some(bad) = fragments.iter().find(|f| f.embedding.len() != dim) {
            return Err(Error::InvalidInput(format!(
                "fragment {} has embedding length {}, expected {dim}",
                bad.id,
                bad.embedding.len()
            )));
        }
        fragments.sort_by_key(|f| f.source_offset.ordinal);
        let positions = fragments.iter().enumerate().map(|(i, f)| (f.id.clone(), i)).collect();
        Ok(Self { document_id, fragments, positions, embedder, split })
    }

    pub fn document_id(&self) -> &str { &self.document_id }

    pub fn embedder_id(&self) -> &str { self.embedder.embedder_id() }

    pub fn dim(&self) -> usize { self.embedder.dim() }

    pub fn split_options(&self) -> &SplitOptions { &self.split }

    pub fn fragments(&self) -> &[RuleFragment] { &self.fragments }

    pub fn len(&self) -> usize { self.fragments.len() }

    pub fn is_empty(&self) -> bool { self.fragments.is_empty() }

    pub fn get(&self, id: &str) -> Option<&RuleFragment> { self.positions.get(id).map(|&i| &self.fragments[i]) }

    pub fn contains(&self, id: &str) -> bool { self.positions.contains_key(id) }

    pub fn summary(&self) -> PolicySummary {
        let mut by_rule_type = BTreeMap::new();
        for f in &self.fragments {
            *by_rule_type.entry(f.rule_type).or_insert(0) += 1;
        }
        PolicySummary { total_fragments: self.fragments.len(), by_rule_type }
    }

    /// Top `min(k, len)` fragments by cosine similarity; ties go to the earlier fragment.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedRule>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut vectors = embed_checked(self.embedder.as_ref(), &[text.to_string()])?;
        let q = vectors.pop().ok_or_else(|| Error::ModelUnavailable("embedder returned no query vector".into()))?;
        let mut scored: Vec<(usize, f32)> =
            self.fragments.iter().enumerate().map(|(i, f)| (i, cosine(&q, &f.embedding))).collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        debug!(query = text, k, returned = scored.len(), "rule query");
        Ok(scored
            .into_iter()
            .map(|(i, relevance_score)| RetrievedRule { fragment: self.fragments[i].clone(), relevance_score })
            .collect())
    }
}

fn embed_checked(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder
        .embed_batch(texts)
        .map_err(|e| Error::ModelUnavailable(format!("{}: {e:#}", embedder.embedder_id())))?;
    if vectors.len() != texts.len() || vectors.iter().any(|v| v.len() != embedder.dim()) {
        return Err(Error::ModelUnavailable(format!(
            "{} returned malformed embeddings for {} texts",
            embedder.embedder_id(),
            texts.len()
        )));
    }
    Ok(vectors)
}

/// Cosine similarity; zero vectors score 0 and NaN never escapes.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0f32, 0f32, 0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom <= f32::EPSILON || !dot.is_finite() { 0.0 } else { dot / denom }
}

pub(crate) fn short(id: &str) -> &str { &id[..id.len().min(16)] }

#[cfg(test)]
mod tests {
    use super::cosine;

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
