//! CLIP ViT-B/32 zero-shot scorer run through candle.

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::imageops::FilterType;
use image::RgbImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use roomcheck_core::config::{expand_path, DeviceKind};
use roomcheck_embed::select_device;

use crate::ImageClassifier;

pub struct ClipClassifier {
    model: ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    image_size: usize,
    pad_id: u32,
    id: String,
}

impl ClipClassifier {
    /// Load `model.safetensors` and `tokenizer.json` from an openai/clip-vit-base-patch32 export.
    pub fn load(model_dir: &Path, device: DeviceKind) -> Result<Self> {
        let device = select_device(device)?;
        info!(dir = %model_dir.display(), "loading CLIP model");
        let config = ClipConfig::vit_base_patch32();
        let weights_path = model_dir.join("model.safetensors");
        let weights = candle_core::safetensors::load(&weights_path, &device)
            .with_context(|| format!("reading {}", weights_path.display()))?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = ClipModel::new(vb, &config)?;
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;
        let pad_id = *tokenizer
            .get_vocab(true)
            .get("<|endoftext|>")
            .ok_or_else(|| anyhow!("tokenizer has no <|endoftext|> token"))?;
        info!("CLIP model loaded");
        Ok(Self { model, tokenizer, device, image_size: config.image_size, pad_id, id: "clip-vit-base-patch32".to_string() })
    }

    fn pixel_values(&self, image: &RgbImage) -> Result<Tensor> {
        let size = self.image_size as u32;
        let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
        let raw = resized.into_raw();
        let tensor = Tensor::from_vec(raw, (self.image_size, self.image_size, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2. / 255., -1.)?
            .unsqueeze(0)?;
        Ok(tensor)
    }

    fn input_ids(&self, prompts: &[String]) -> Result<Tensor> {
        let mut rows = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let enc = self.tokenizer.encode(prompt.as_str(), true).map_err(|e| anyhow!("Tokenization failed: {}", e))?;
            rows.push(enc.get_ids().to_vec());
        }
        let longest = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut flat = Vec::with_capacity(rows.len() * longest);
        for mut row in rows {
            row.resize(longest, self.pad_id);
            flat.extend(row);
        }
        Ok(Tensor::from_vec(flat, (prompts.len(), longest), &self.device)?)
    }
}

impl ImageClassifier for ClipClassifier {
    fn model_id(&self) -> &str { &self.id }

    fn score(&self, image: &RgbImage, prompts: &[String]) -> Result<Vec<f32>> {
        if prompts.is_empty() { return Ok(Vec::new()); }
        let pixels = self.pixel_values(image)?;
        let input_ids = self.input_ids(prompts)?;
        let (_logits_per_text, logits_per_image) = self.model.forward(&pixels, &input_ids)?;
        let probs = candle_nn::ops::softmax(&logits_per_image, 1)?;
        let probs: Vec<f32> = probs.squeeze(0)?.to_device(&Device::Cpu)?.to_vec1()?;
        debug!(prompts = prompts.len(), "scored image against vocabulary");
        Ok(probs)
    }
}

/// Locate the CLIP export: `APP_CLIP_MODEL_DIR`, then the configured dir, then `models/clip-vit-base-patch32`.
pub fn resolve_clip_dir(configured: Option<&str>) -> Result<PathBuf> {
    let candidates = std::env::var("APP_CLIP_MODEL_DIR")
        .ok()
        .into_iter()
        .chain(configured.map(str::to_string))
        .chain(["models/clip-vit-base-patch32".to_string()]);
    for candidate in candidates {
        let p = expand_path(&candidate);
        if p.exists() { return Ok(p); }
    }
    Err(anyhow!("Could not locate CLIP model directory"))
}
