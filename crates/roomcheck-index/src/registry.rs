use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use roomcheck_core::policy::{DocumentId, PolicyDocument};
use roomcheck_core::traits::Embedder;
use roomcheck_core::{CancellationToken, Error, Result};

use crate::{short, IndexOptions, LanceRuleStore, RuleIndex};

type Slot = Arc<OnceCell<Arc<RuleIndex>>>;
type Slots = Arc<Mutex<HashMap<DocumentId, Slot>>>;

/// Built indexes keyed by document id.
///
/// Concurrent requests for the same document wait on a single build. The build
/// runs on its own task, so it finishes and fills the slot even when the request
/// that started it is dropped. A failed or cancelled build removes the slot once
/// nobody else is waiting on it, and the next request builds again.
pub struct IndexRegistry {
    builder: Builder,
    slots: Slots,
}

/// Everything a build needs, cloned into the task that runs it.
#[derive(Clone)]
struct Builder {
    embedder: Arc<dyn Embedder>,
    options: IndexOptions,
    store: Option<Arc<LanceRuleStore>>,
}

impl IndexRegistry {
    pub fn new(embedder: Arc<dyn Embedder>, options: IndexOptions) -> Self {
        Self { builder: Builder { embedder, options, store: None }, slots: Slots::default() }
    }

    pub fn with_store(mut self, store: Arc<LanceRuleStore>) -> Self {
        self.builder.store = Some(store);
        self
    }

    /// Index already built for `document_id`, if any.
    pub fn cached(&self, document_id: &str) -> Option<Arc<RuleIndex>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(document_id).and_then(|slot| slot.get().cloned())
    }

    /// Documents with a built or in-flight index.
    pub fn tracked(&self) -> usize { self.slots.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub async fn get_or_build_bytes(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<Arc<RuleIndex>> {
        self.get_or_build(PolicyDocument::from_bytes(bytes)?, cancel).await
    }

    pub async fn get_or_build(&self, document: PolicyDocument, cancel: &CancellationToken) -> Result<Arc<RuleIndex>> {
        let id = document.id.clone();
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(id.clone()).or_default().clone()
        };
        if let Some(index) = slot.get() {
            return Ok(index.clone());
        }
        let builder = self.builder.clone();
        let slots = self.slots.clone();
        let cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = slot.get_or_try_init(|| builder.load_or_build(document, &cancel)).await.cloned();
            if result.is_err() {
                evict_if_idle(&slots, &id, &slot);
            }
            result
        });
        task.await.map_err(|e| Error::ModelUnavailable(format!("index build task failed: {e}")))?
    }
}

/// Drop a slot whose build failed unless another request is still waiting on it.
fn evict_if_idle(slots: &Mutex<HashMap<DocumentId, Slot>>, id: &str, slot: &Slot) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    let ours = slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot));
    // one reference in the map, one held by this task
    if ours && !slot.initialized() && Arc::strong_count(slot) == 2 {
        slots.remove(id);
        debug!(document = %short(id), tracked = slots.len(), "evicted failed index slot");
    }
}

impl Builder {
    async fn load_or_build(&self, document: PolicyDocument, cancel: &CancellationToken) -> Result<Arc<RuleIndex>> {
        cancel.check()?;
        let split = self.options.split();
        if let Some(store) = &self.store {
            match store.load(&document.id, self.embedder.clone(), &split).await {
                Ok(Some(index)) => {
                    info!(document = %short(&document.id), fragments = index.len(), "rule index loaded from store");
                    return Ok(Arc::new(index));
                }
                Ok(None) => {}
                Err(e) => warn!(document = %short(&document.id), error = %e, "stored rule index unreadable, rebuilding"),
            }
        }
        let embedder = self.embedder.clone();
        let options = self.options.clone();
        let build_cancel = cancel.clone();
        let index = tokio::task::spawn_blocking(move || RuleIndex::build(&document, embedder, &options, &build_cancel))
            .await
            .map_err(|e| Error::ModelUnavailable(format!("index build task failed: {e}")))??;
        cancel.check()?;
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&index).await {
                warn!(document = %short(index.document_id()), error = %e, "failed to persist rule index");
            }
        }
        Ok(Arc::new(index))
    }
}
