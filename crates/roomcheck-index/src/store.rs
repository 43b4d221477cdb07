//! LanceDB persistence for built rule indexes.
//!
//! One table per (document, embedder, split options) triple. Fragments are
//! content-addressed and the split options decide which fragments exist, so an
//! existing table for the triple already holds exactly what a rebuild would
//! produce and is never rewritten.

use anyhow::{anyhow, Context};
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use futures::TryStreamExt;
use lancedb::query::ExecutableQuery;
use lancedb::{connect, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use roomcheck_core::policy::SplitOptions;
use roomcheck_core::traits::Embedder;
use roomcheck_core::types::{RuleFragment, SourceOffset};
use roomcheck_core::{Error, Result};

use crate::schema::build_rules_schema;
use crate::{short, RuleIndex};

pub struct LanceRuleStore {
    db: Connection,
}

impl LanceRuleStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        let db = connect(dir.to_string_lossy().as_ref())
            .execute()
            .await
            .map_err(|e| Error::Store(format!("opening {}: {e}", dir.display())))?;
        Ok(Self { db })
    }

    /// Table holding `document_id` split with `split` and embedded by `embedder_id`.
    pub fn table_name(document_id: &str, embedder_id: &str, split: &SplitOptions) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(embedder_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(split.fingerprint().as_bytes());
        let tag = hasher.finalize().to_hex();
        format!("rules_{}_{}", short(document_id), &tag[..8])
    }

    pub async fn save(&self, index: &RuleIndex) -> Result<()> {
        self.save_inner(index).await.map_err(|e| Error::Store(format!("{e:#}")))
    }

    /// `Ok(None)` when nothing was stored for this document, embedder and split.
    pub async fn load(
        &self,
        document_id: &str,
        embedder: Arc<dyn Embedder>,
        split: &SplitOptions,
    ) -> Result<Option<RuleIndex>> {
        let name = Self::table_name(document_id, embedder.embedder_id(), split);
        let fragments = self.load_fragments(&name).await.map_err(|e| Error::Store(format!("{e:#}")))?;
        match fragments {
            None => Ok(None),
            Some(fragments) => RuleIndex::from_parts(document_id.to_string(), fragments, embedder, split.clone()).map(Some),
        }
    }

    async fn table_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.db.table_names().execute().await?.iter().any(|n| n == name))
    }

    async fn save_inner(&self, index: &RuleIndex) -> anyhow::Result<()> {
        let name = Self::table_name(index.document_id(), index.embedder_id(), index.split_options());
        if self.table_exists(&name).await? {
            debug!(table = %name, "rule table already stored");
            return Ok(());
        }
        let dim = i32::try_from(index.dim()).context("embedding dimension exceeds i32")?;
        let batch = fragments_to_record_batch(index.fragments(), dim)?;
        let schema = batch.schema();
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
        self.db.create_table(&name, reader).execute().await?;
        info!(table = %name, fragments = index.len(), "rule index stored");
        Ok(())
    }

    async fn load_fragments(&self, name: &str) -> anyhow::Result<Option<Vec<RuleFragment>>> {
        if !self.table_exists(name).await? {
            return Ok(None);
        }
        let table = self.db.open_table(name).execute().await?;
        let mut stream = table.query().execute().await?;
        let mut fragments = Vec::new();
        while let Some(batch) = stream.try_next().await? {
            fragments.extend(record_batch_to_fragments(&batch)?);
        }
        if fragments.is_empty() {
            return Ok(None);
        }
        debug!(table = %name, fragments = fragments.len(), "rule index loaded");
        Ok(Some(fragments))
    }
}

fn fragments_to_record_batch(fragments: &[RuleFragment], dim: i32) -> anyhow::Result<RecordBatch> {
    let as_i64 = |v: usize| i64::try_from(v).map_err(|_| anyhow!("offset {v} exceeds i64"));
    let mut ids = Vec::new();
    let mut texts = Vec::new();
    let mut rule_types = Vec::new();
    let mut ordinals = Vec::new();
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::new();
    for f in fragments {
        ids.push(f.id.clone());
        texts.push(f.text.clone());
        rule_types.push(f.rule_type.as_str());
        ordinals.push(as_i64(f.source_offset.ordinal)?);
        starts.push(as_i64(f.source_offset.start)?);
        ends.push(as_i64(f.source_offset.end)?);
        vectors.push(Some(f.embedding.iter().map(|&x| Some(x)).collect()));
    }
    let batch = RecordBatch::try_new(
        build_rules_schema(dim),
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(rule_types)),
            Arc::new(Int64Array::from(ordinals)),
            Arc::new(Int64Array::from(starts)),
            Arc::new(Int64Array::from(ends)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors.into_iter(), dim)),
        ],
    )?;
    Ok(batch)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| anyhow!("rules.{name} column missing or mistyped"))
}

fn record_batch_to_fragments(batch: &RecordBatch) -> anyhow::Result<Vec<RuleFragment>> {
    let ids = column::<StringArray>(batch, "id")?;
    let texts = column::<StringArray>(batch, "text")?;
    let rule_types = column::<StringArray>(batch, "rule_type")?;
    let ordinals = column::<Int64Array>(batch, "ordinal")?;
    let starts = column::<Int64Array>(batch, "start")?;
    let ends = column::<Int64Array>(batch, "end")?;
    let vectors = column::<FixedSizeListArray>(batch, "vector")?;
    let as_usize = |v: i64| usize::try_from(v).map_err(|_| anyhow!("negative offset {v} in rule table"));
    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if vectors.is_null(i) {
            return Err(anyhow!("fragment {} stored without a vector", ids.value(i)));
        }
        let embedding = vectors.value(i).as_primitive::<Float32Type>().values().to_vec();
        out.push(RuleFragment {
            id: ids.value(i).to_string(),
            text: texts.value(i).to_string(),
            embedding,
            rule_type: rule_types.value(i).parse().map_err(|e: String| anyhow!(e))?,
            source_offset: SourceOffset {
                ordinal: as_usize(ordinals.value(i))?,
                start: as_usize(starts.value(i))?,
                end: as_usize(ends.value(i))?,
            },
        });
    }
    Ok(out)
}
