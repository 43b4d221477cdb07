//! Text embedding backends for the rule index.
//!
//! `EmbeddingModel` runs BGE-M3 (XLM-RoBERTa) through candle with masked mean
//! pooling. `FakeEmbedder` hashes tokens into a fixed-size vector; it is
//! deterministic, fast and shares vocabulary overlap as similarity, which is
//! enough for tests and offline development.

use anyhow::{Context, Result, anyhow, ensure};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use roomcheck_core::config::{DeviceKind, EmbeddingConfig, expand_path};
use roomcheck_core::traits::Embedder;

mod tokenize;

pub use tokenize::tokenize_batch_on_device;

const XLM_ROBERTA_PAD_ID: u32 = 1;

pub struct EmbeddingModel {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
    dim: usize,
    max_len: usize,
    id: String,
}

impl EmbeddingModel {
    pub fn load(model_dir: &Path, max_len: usize, device: DeviceKind) -> Result<Self> {
        let device = select_device(device)?;
        info!(dir = %model_dir.display(), "loading BGE-M3 embedding model");
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;
        let config_path = model_dir.join("config.json");
        let config: XLMRobertaConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path).with_context(|| format!("reading {}", config_path.display()))?,
        )?;
        let weights = load_weights(model_dir, &device)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = XLMRobertaModel::new(&config, vb)?;
        let dim = config.hidden_size;
        info!(dim, "embedding model loaded");
        Ok(Self { model, tokenizer, device, dim, max_len, id: format!("bge-m3:d{dim}") })
    }

    fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let (input_ids, attention_mask) =
            tokenize_batch_on_device(&self.tokenizer, texts, self.max_len, XLM_ROBERTA_PAD_ID, &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self.model.forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)?;
        let pooled = mean_pool_l2(&hidden, &attention_mask)?;
        let vectors: Vec<Vec<f32>> = pooled.to_device(&Device::Cpu)?.to_vec2()?;
        let elapsed = start.elapsed().as_millis();
        if elapsed > 100 * texts.len() as u128 { warn!(batch = texts.len(), elapsed_ms = elapsed as u64, "slow embedding batch"); }
        Ok(vectors)
    }
}

impl Embedder for EmbeddingModel {
    fn dim(&self) -> usize { self.dim }
    fn max_len(&self) -> usize { self.max_len }
    fn embedder_id(&self) -> &str { &self.id }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(16) { out.extend(self.embed_chunk(chunk)?); }
        Ok(out)
    }
}

/// Resolve the configured device. An explicit `metal` request fails instead of falling back.
pub fn select_device(kind: DeviceKind) -> Result<Device> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Metal => metal_device().context("metal device requested")?,
        DeviceKind::Auto => metal_device().unwrap_or_else(|e| {
            debug!(error = %e, "metal unavailable");
            Device::Cpu
        }),
    };
    info!(requested = ?kind, metal = device.is_metal(), "compute device selected");
    Ok(device)
}

#[cfg(feature = "metal")]
fn metal_device() -> Result<Device> { Ok(Device::new_metal(0)?) }

#[cfg(not(feature = "metal"))]
fn metal_device() -> Result<Device> { Err(anyhow!("built without the metal feature")) }

/// Masked mean over tokens, then L2 norm per row: `[B,T,H]` with a `[B,T]` mask gives `[B,H]`.
/// A row with every token masked pools to zeros rather than NaN.
pub fn mean_pool_l2(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, _tokens, hidden_dim) = hidden.dims3()?;
    let mask = attention_mask.to_device(hidden.device())?.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1f64, f64::MAX)?;
    let mean = summed.broadcast_div(&counts)?;
    let eps = if hidden.dtype() == DType::F16 { 1e-6 } else { 1e-12 };
    let norms = mean.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(eps, f64::MAX)?;
    let pooled = mean.broadcast_div(&norms)?;
    ensure!(pooled.dims() == [batch, hidden_dim].as_slice(), "pooled shape {:?}, expected [{batch}, {hidden_dim}]", pooled.dims());
    Ok(pooled)
}

fn load_weights(model_dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        debug!(path = %safetensors.display(), "loading safetensors weights");
        return Ok(candle_core::safetensors::load(&safetensors, device)?);
    }
    let pickle = model_dir.join("pytorch_model.bin");
    debug!(path = %pickle.display(), "loading pickle weights");
    let weights = candle_core::pickle::read_all(&pickle)?;
    weights
        .into_iter()
        .map(|(name, t)| -> Result<(String, Tensor)> { Ok((name, t.to_device(device)?)) })
        .collect()
}

/// Hashing embedder: each lowercase alphanumeric token adds weight to one bucket.
pub struct FakeEmbedder { dim: usize, id: String }

impl FakeEmbedder {
    pub fn new(dim: usize) -> Self { Self { dim, id: format!("fake:d{dim}") } }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;
        let mut v = vec![0f32; self.dim];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            v[idx] += 0.5 + (((h >> 32) as u32) as f32) / (u32::MAX as f32);
        }
        let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt().max(1e-6);
        for x in &mut v { *x /= norm; }
        v
    }
}

impl Embedder for FakeEmbedder {
    fn dim(&self) -> usize { self.dim }
    fn max_len(&self) -> usize { usize::MAX }
    fn embedder_id(&self) -> &str { &self.id }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Build the configured embedder. `APP_USE_FAKE_EMBEDDINGS=1` forces the fake one.
pub fn load_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let env_fake = std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if config.use_fake || env_fake {
        info!("using FakeEmbedder");
        return Ok(Arc::new(FakeEmbedder::new(1024)));
    }
    let dir = resolve_model_dir(config.model_dir.as_deref())?;
    Ok(Arc::new(EmbeddingModel::load(&dir, config.max_len, config.device)?))
}

fn resolve_model_dir(configured: Option<&str>) -> Result<PathBuf> {
    let candidates = std::env::var("APP_MODEL_DIR")
        .ok()
        .into_iter()
        .chain(configured.map(str::to_string))
        .chain(["models/bge-m3".to_string()]);
    for candidate in candidates {
        let p = expand_path(&candidate);
        if p.exists() { info!(dir = %p.display(), "using embedding model dir"); return Ok(p); }
    }
    Err(anyhow!("Could not locate BGE-M3 model directory"))
}
