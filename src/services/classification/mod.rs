use crate::core::config::Config;
use crate::core::errors::{ClassificationError, ClassificationResult};
use crate::services::onnx_builder;
use anyhow::Result;
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::Value;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info, trace};

// Channel normalization constants the CLIP encoders were trained with
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Zero-shot subcategory classifier built on a CLIP-style dual encoder.
///
/// Two ONNX sessions (image encoder, text encoder) plus the matching
/// tokenizer. Each encoder lives behind its own async Mutex; the pool used
/// by detection is overkill here because classification only runs on small
/// crops after detection has already gated the request.
pub struct ClassificationService {
    vision_session: tokio::sync::Mutex<Session>,
    text_session: tokio::sync::Mutex<Session>,
    tokenizer: Tokenizer,
    config: Arc<Config>,
    device_type: String,
}

impl ClassificationService {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let backend = config.detection.inference_backend.as_deref();

        let (device_type, vision_session) = onnx_builder::build_session_from_file(
            &config.classification.vision_model_path,
            "CLIP vision encoder",
            backend,
        )?;
        let (_, text_session) = onnx_builder::build_session_from_file(
            &config.classification.text_model_path,
            "CLIP text encoder",
            backend,
        )?;

        let tokenizer = Tokenizer::from_file(&config.classification.tokenizer_path)
            .map_err(|e| anyhow::anyhow!(
                "Failed to load CLIP tokenizer from {}: {}",
                config.classification.tokenizer_path, e
            ))?;

        info!("✓ Classification: {} (vision + text encoders)", device_type);

        Ok(Self {
            vision_session: tokio::sync::Mutex::new(vision_session),
            text_session: tokio::sync::Mutex::new(text_session),
            tokenizer,
            config,
            device_type,
        })
    }

    #[allow(dead_code)]
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    fn preprocess_image(&self, img: &DynamicImage) -> Array4<f32> {
        let size = self.config.classification.image_size;
        trace!("Preprocessing crop: {}x{} → {}x{}", img.width(), img.height(), size, size);

        let resized = img.resize_exact(size, size, image::imageops::FilterType::CatmullRom);
        let rgb_img = resized.to_rgb8();

        let side = size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, side, side));

        for y in 0..side {
            for x in 0..side {
                let pixel = rgb_img.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    array[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
                }
            }
        }

        array
    }

    /// Embed a single image crop into the joint space.
    pub async fn embed_image(&self, img: &DynamicImage) -> ClassificationResult<Vec<f32>> {
        let pixel_values = Value::from_array(self.preprocess_image(img))?;

        let (shape, data) = {
            let mut session = self.vision_session.lock().await;
            let outputs = session.run(ort::inputs!["pixel_values" => pixel_values])?;

            // Index [0] instead of a name: exports differ on the output label
            let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };

        if shape.len() != 2 || shape[0] != 1 {
            return Err(ClassificationError::MalformedOutput(format!(
                "expected [1, dim] image embedding, got {:?}",
                shape
            )));
        }

        Ok(data)
    }

    /// Embed a batch of prompts in one pass, padded to the longest sequence
    /// with attention masks covering the real tokens.
    pub async fn embed_texts(&self, prompts: &[String]) -> ClassificationResult<Vec<Vec<f32>>> {
        if prompts.is_empty() {
            return Err(ClassificationError::EmptyPromptBatch);
        }

        let encodings = prompts
            .iter()
            .map(|p| {
                self.tokenizer
                    .encode(p.as_str(), true)
                    .map_err(|e| ClassificationError::TokenizationFailed(e.to_string()))
            })
            .collect::<ClassificationResult<Vec<_>>>()?;

        let max_len = encodings
            .iter()
            .map(|enc| enc.get_ids().len())
            .max()
            .unwrap_or(0);

        let mut input_ids = Vec::with_capacity(prompts.len() * max_len);
        let mut attention_mask = Vec::with_capacity(prompts.len() * max_len);

        for encoding in &encodings {
            let ids = encoding.get_ids();
            input_ids.extend(ids.iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));

            let padding = max_len - ids.len();
            input_ids.extend(std::iter::repeat(0i64).take(padding));
            attention_mask.extend(std::iter::repeat(0i64).take(padding));
        }

        let ids_array = Array2::from_shape_vec((prompts.len(), max_len), input_ids).unwrap();
        let mask_array =
            Array2::from_shape_vec((prompts.len(), max_len), attention_mask).unwrap();

        let ids_value = Value::from_array(ids_array)?;
        let mask_value = Value::from_array(mask_array)?;

        let (shape, data) = {
            let mut session = self.text_session.lock().await;
            let outputs = session.run(ort::inputs![
                "input_ids" => ids_value,
                "attention_mask" => mask_value
            ])?;

            let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };

        if shape.len() != 2 || shape[0] as usize != prompts.len() {
            return Err(ClassificationError::MalformedOutput(format!(
                "expected [{}, dim] text embeddings, got {:?}",
                prompts.len(),
                shape
            )));
        }

        let dim = shape[1] as usize;
        Ok(data.chunks(dim).map(|chunk| chunk.to_vec()).collect())
    }

    /// Pick the best-matching candidate label for an image crop.
    ///
    /// Builds "a photo of {candidate}" prompts, embeds both sides, scores
    /// cosine similarity over temperature, softmaxes, and returns the
    /// argmax candidate. Exact ties go to the earliest candidate.
    pub async fn classify(
        &self,
        crop: &DynamicImage,
        candidates: &[String],
    ) -> ClassificationResult<String> {
        if candidates.is_empty() {
            return Err(ClassificationError::EmptyPromptBatch);
        }

        let prompts: Vec<String> = candidates.iter().map(|c| build_prompt(c)).collect();
        trace!("Zero-shot classify over {} candidates", candidates.len());

        let image_embedding = self.embed_image(crop).await?;
        let text_embeddings = self.embed_texts(&prompts).await?;

        let logits = similarity_scores(
            &image_embedding,
            &text_embeddings,
            self.config.classification.temperature,
        );
        let probs = softmax(&logits);
        let winner = argmax(&probs).ok_or_else(|| {
            ClassificationError::MalformedOutput("empty similarity vector".to_string())
        })?;

        debug!("✓ Zero-shot winner: '{}' (p={:.3})", candidates[winner], probs[winner]);
        Ok(candidates[winner].clone())
    }
}

fn build_prompt(subcategory: &str) -> String {
    format!("a photo of {}", subcategory)
}

/// Similarity logits: L2-normalize both sides, dot product, divide by
/// temperature. Matches the usual CLIP scoring up to the learned scale.
fn similarity_scores(
    image_embedding: &[f32],
    text_embeddings: &[Vec<f32>],
    temperature: f32,
) -> Vec<f32> {
    let image = l2_normalize(image_embedding);
    text_embeddings
        .iter()
        .map(|text| {
            let text = l2_normalize(text);
            let dot: f32 = image.iter().zip(text.iter()).map(|(a, b)| a * b).sum();
            dot / temperature
        })
        .collect()
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Numerically stable softmax (max-subtracted before exponentiation).
fn softmax(logits: &[f32]) -> Vec<f32> {
    if logits.is_empty() {
        return vec![];
    }
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// First index holding the maximum value; later equal values never win.
fn argmax(values: &[f32]) -> Option<usize> {
    let mut best_idx = None;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = Some(i);
        }
    }
    best_idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prompt() {
        assert_eq!(build_prompt("gaming laptop"), "a photo of gaming laptop");
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_stable_for_large_logits() {
        let probs = softmax(&[1000.0, 1001.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_empty() {
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn test_argmax_first_index_wins_ties() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), Some(1));
        assert_eq!(argmax(&[0.7, 0.1]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        // Zero vector passes through untouched
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_similarity_scores_prefer_aligned_embedding() {
        let image = vec![1.0, 0.0];
        let texts = vec![vec![2.0, 0.0], vec![0.0, 5.0]];

        let scores = similarity_scores(&image, &texts, 0.07);
        assert!(scores[0] > scores[1]);
        // Aligned unit vectors score exactly 1/temperature
        assert!((scores[0] - 1.0 / 0.07).abs() < 1e-3);
        assert!(scores[1].abs() < 1e-3);
    }

    const VISION_PATH: &str = "models/clip_vision.onnx";
    const TEXT_PATH: &str = "models/clip_text.onnx";

    #[tokio::test]
    #[ignore] // Only run when the CLIP model files are present
    async fn test_classify_with_real_models() {
        if !std::path::Path::new(VISION_PATH).exists()
            || !std::path::Path::new(TEXT_PATH).exists()
        {
            return;
        }

        let config = Arc::new(Config::new().unwrap());
        let service = ClassificationService::new(config).await.unwrap();

        let crop = DynamicImage::new_rgb8(64, 64);
        let candidates = vec!["laptop".to_string(), "dog".to_string()];
        let winner = service.classify(&crop, &candidates).await.unwrap();
        assert!(candidates.contains(&winner));
    }
}
