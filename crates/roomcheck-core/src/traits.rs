/// Text embedding backend shared by index build and query.
///
/// Implementations must return L2-normalized vectors of length `dim()`.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    /// Stable identifier for the model (e.g. `bge-m3:d1024`), stored alongside persisted indexes.
    fn embedder_id(&self) -> &str;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}
