use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roomcheck_core::policy::{document_id, SplitOptions};
use roomcheck_core::traits::Embedder;
use roomcheck_core::{CancellationToken, Error};
use roomcheck_embed::FakeEmbedder;
use roomcheck_index::{IndexOptions, IndexRegistry, LanceRuleStore, RuleIndex};

const POLICY: &[u8] = b"\
1. Candles, incense and any open flame are prohibited in student rooms.
2. Alcohol and alcohol containers are not permitted for residents under 21.
3. Space heaters and other heating appliances are not allowed.
";

/// Counts embedded texts and overlapping calls, and can be told to fail.
struct CountingEmbedder {
    inner: FakeEmbedder,
    texts: AtomicUsize,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl CountingEmbedder {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: FakeEmbedder::new(64),
            texts: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay,
        })
    }
}

impl Embedder for CountingEmbedder {
    fn dim(&self) -> usize { self.inner.dim() }
    fn max_len(&self) -> usize { self.inner.max_len() }
    fn embedder_id(&self) -> &str { self.inner.embedder_id() }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("backend offline");
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_build() {
    let embedder = CountingEmbedder::new(Duration::from_millis(50));
    let registry = Arc::new(IndexRegistry::new(embedder.clone(), IndexOptions::default()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.get_or_build_bytes(POLICY, &CancellationToken::new()).await }));
    }
    let mut built = Vec::new();
    for h in handles {
        built.push(h.await.unwrap().unwrap());
    }
    assert!(built.iter().all(|i| Arc::ptr_eq(i, &built[0])));
    assert_eq!(embedder.texts.load(Ordering::SeqCst), built[0].len());
    assert!(registry.cached(&document_id(POLICY)).is_some());
}

#[tokio::test]
async fn failed_build_leaves_no_entry_and_is_retried() {
    let embedder = CountingEmbedder::new(Duration::ZERO);
    let registry = IndexRegistry::new(embedder.clone(), IndexOptions::default());
    embedder.fail.store(true, Ordering::SeqCst);
    let err = registry.get_or_build_bytes(POLICY, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::ModelUnavailable(_)));
    assert!(registry.cached(&document_id(POLICY)).is_none());
    assert_eq!(registry.tracked(), 0);

    embedder.fail.store(false, Ordering::SeqCst);
    let index = registry.get_or_build_bytes(POLICY, &CancellationToken::new()).await.unwrap();
    assert_eq!(index.len(), 3);
}

#[tokio::test]
async fn cancelled_request_commits_nothing() {
    let registry = IndexRegistry::new(CountingEmbedder::new(Duration::ZERO), IndexOptions::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = registry.get_or_build_bytes(POLICY, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(registry.cached(&document_id(POLICY)).is_none());
    assert_eq!(registry.tracked(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_request_still_completes_the_shared_build() {
    let embedder = CountingEmbedder::new(Duration::from_millis(200));
    let registry = IndexRegistry::new(embedder.clone(), IndexOptions::default());
    let abandoned =
        tokio::time::timeout(Duration::from_millis(30), registry.get_or_build_bytes(POLICY, &CancellationToken::new())).await;
    assert!(abandoned.is_err());

    let index = registry.get_or_build_bytes(POLICY, &CancellationToken::new()).await.unwrap();
    assert_eq!(index.len(), 3);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(embedder.peak.load(Ordering::SeqCst), 1);
    assert_eq!(registry.tracked(), 1);
}

#[tokio::test]
async fn unparseable_pdf_policy_is_rejected_before_building() {
    let registry = IndexRegistry::new(CountingEmbedder::new(Duration::ZERO), IndexOptions::default());
    let err = registry.get_or_build_bytes(b"%PDF-1.4\n%%EOF\n", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_) | Error::EmptyDocument), "got {err:?}");
    assert_eq!(registry.tracked(), 0);
}

#[tokio::test]
async fn store_round_trip_keeps_ids_and_order() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = LanceRuleStore::open(tmp.path()).await?;
    let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(64));
    let built = RuleIndex::build_from_bytes(POLICY, embedder.clone(), &IndexOptions::default(), &CancellationToken::new())?;
    store.save(&built).await?;
    // second save of the same content is a no-op
    store.save(&built).await?;

    let split = SplitOptions::default();
    let loaded = store.load(built.document_id(), embedder.clone(), &split).await?.expect("stored index");
    assert_eq!(loaded.fragments(), built.fragments());

    assert!(store.load(&document_id(b"other policy"), embedder.clone(), &split).await?.is_none());
    let other: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(32));
    assert!(store.load(built.document_id(), other, &split).await?.is_none());
    let stricter = SplitOptions { min_fragment_chars: 70 };
    assert!(store.load(built.document_id(), embedder, &stricter).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn changed_split_options_rebuild_instead_of_reusing_store() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(LanceRuleStore::open(tmp.path()).await?);
    let lenient = IndexOptions { min_fragment_chars: 20, ..IndexOptions::default() };
    let strict = IndexOptions { min_fragment_chars: 70, ..IndexOptions::default() };

    let first = IndexRegistry::new(CountingEmbedder::new(Duration::ZERO), lenient).with_store(store.clone());
    assert_eq!(first.get_or_build_bytes(POLICY, &CancellationToken::new()).await?.len(), 3);

    let embedder = CountingEmbedder::new(Duration::ZERO);
    let second = IndexRegistry::new(embedder.clone(), strict.clone()).with_store(store);
    let reloaded = second.get_or_build_bytes(POLICY, &CancellationToken::new()).await?;
    let fresh = RuleIndex::build_from_bytes(POLICY, Arc::new(FakeEmbedder::new(64)), &strict, &CancellationToken::new())?;
    assert_eq!(reloaded.fragments(), fresh.fragments());
    assert_eq!(reloaded.len(), 2);
    assert!(embedder.texts.load(Ordering::SeqCst) > 0);
    Ok(())
}

#[tokio::test]
async fn registry_prefers_stored_index_over_rebuilding() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(LanceRuleStore::open(tmp.path()).await?);

    let first = CountingEmbedder::new(Duration::ZERO);
    let registry = IndexRegistry::new(first.clone(), IndexOptions::default()).with_store(store.clone());
    let built = registry.get_or_build_bytes(POLICY, &CancellationToken::new()).await?;
    assert_eq!(first.texts.load(Ordering::SeqCst), 3);

    let second = CountingEmbedder::new(Duration::ZERO);
    let fresh = IndexRegistry::new(second.clone(), IndexOptions::default()).with_store(store);
    let loaded = fresh.get_or_build_bytes(POLICY, &CancellationToken::new()).await?;
    assert_eq!(second.texts.load(Ordering::SeqCst), 0);
    assert_eq!(loaded.fragments(), built.fragments());
    Ok(())
}
