// Region-aware enhancement: a full-frame upscale runs alongside subject
// detection, then the subject gets its own upscale pass and is feathered
// back onto the full-frame canvas.

use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{DetectionBox, EnhancementOutcome};
use crate::services::{DetectionService, UpscaleModel, UpscaleService};
use crate::utils::image_ops::{
    blend_region, clamp_box, crop_image_async, encode_jpeg_async, encode_png_async, feather_mask,
};
use crate::utils::Metrics;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const SUBJECT_CROP_JPEG_QUALITY: u8 = 95;

pub struct EnhancementPipeline {
    detection: Arc<DetectionService>,
    upscaler: Arc<UpscaleService>,
    config: Arc<Config>,
    metrics: Metrics,
}

impl EnhancementPipeline {
    pub fn new(
        detection: Arc<DetectionService>,
        upscaler: Arc<UpscaleService>,
        config: Arc<Config>,
        metrics: Metrics,
    ) -> Self {
        Self {
            detection,
            upscaler,
            config,
            metrics,
        }
    }

    /// Enhance one uploaded image, writing the final PNG plus intermediates.
    ///
    /// `original` is the decoded upload, `upload_path` the file it was saved
    /// to. The returned outcome keeps the full-frame upscale dimensions even
    /// when a subject was composited, and lists every intermediate artifact
    /// so the caller can clean them up.
    pub async fn enhance(
        &self,
        original: &DynamicImage,
        upload_path: &Path,
        request_id: &str,
    ) -> PipelineResult<EnhancementOutcome> {
        let output_dir = Path::new(self.config.output_dir()).to_path_buf();

        // The full-frame upscale and subject detection are independent.
        let (full_sr_path, subject) = tokio::join!(
            self.upscale_timed(upload_path, &output_dir, UpscaleModel::General),
            self.detect_subject(original),
        );
        let full_sr_path = full_sr_path?;
        let subject = subject?;

        let mut intermediate_paths = vec![full_sr_path.clone()];
        let full_sr = self.decode_image_file(&full_sr_path).await?;

        let (final_image, composited) = match &subject {
            Some(detection) => {
                self.composite_subject(
                    original,
                    detection,
                    full_sr,
                    request_id,
                    &output_dir,
                    &mut intermediate_paths,
                )
                .await?
            }
            None => {
                debug!(
                    "No {} detected; keeping the full-frame upscale as-is",
                    self.config.subject_class()
                );
                (full_sr, false)
            }
        };

        // The final artifact is always an RGB PNG regardless of source format.
        let final_image = match final_image {
            DynamicImage::ImageRgb8(_) => final_image,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };
        let final_width = final_image.width();
        let final_height = final_image.height();

        let final_path = output_dir.join(final_filename(request_id));
        let png_bytes = encode_png_async(final_image)
            .await
            .map_err(|e| PipelineError::ImageOpFailed(e.to_string()))?;
        tokio::fs::write(&final_path, &png_bytes).await.map_err(|e| {
            PipelineError::ArtifactIoFailed {
                path: final_path.display().to_string(),
                source: e,
            }
        })?;

        info!(
            "✓ Enhanced {}: {}x{} -> {}x{} ({})",
            request_id,
            original.width(),
            original.height(),
            final_width,
            final_height,
            if composited {
                "subject composited"
            } else {
                "full-frame only"
            }
        );

        Ok(EnhancementOutcome {
            final_path,
            final_width,
            final_height,
            subject: if composited { subject } else { None },
            intermediate_paths,
        })
    }

    async fn upscale_timed(
        &self,
        input: &Path,
        output_dir: &Path,
        model: UpscaleModel,
    ) -> PipelineResult<PathBuf> {
        let started = Instant::now();
        let path = self
            .upscaler
            .upscale(input, output_dir, model)
            .await
            .map_err(PipelineError::EnhancementFailed)?;
        self.metrics.record_upscale_duration(started.elapsed());
        Ok(path)
    }

    async fn detect_subject(&self, img: &DynamicImage) -> PipelineResult<Option<DetectionBox>> {
        let started = Instant::now();
        let detections = self.detection.detect(img).await?;
        self.metrics.record_detection_duration(started.elapsed());
        Ok(select_subject(detections, self.config.subject_class()))
    }

    /// Crop the subject, upscale it with the subject model, and feather it
    /// onto the full-frame canvas. Returns the canvas untouched when the box
    /// degenerates after clamping.
    async fn composite_subject(
        &self,
        original: &DynamicImage,
        detection: &DetectionBox,
        full_sr: DynamicImage,
        request_id: &str,
        output_dir: &Path,
        intermediate_paths: &mut Vec<PathBuf>,
    ) -> PipelineResult<(DynamicImage, bool)> {
        let (x, y, w, h) = clamp_box(&detection.bbox, original.width(), original.height());
        if w == 0 || h == 0 {
            debug!("Subject box degenerate after clamping; skipping composite");
            return Ok((full_sr, false));
        }

        let crop = crop_image_async(original.clone(), x, y, w, h)
            .await
            .map_err(|e| PipelineError::ImageOpFailed(e.to_string()))?;
        let jpeg_bytes = encode_jpeg_async(crop, SUBJECT_CROP_JPEG_QUALITY)
            .await
            .map_err(|e| PipelineError::ImageOpFailed(e.to_string()))?;

        let crop_path = Path::new(self.config.upload_dir()).join(subject_crop_filename(
            request_id,
            self.config.subject_class(),
        ));
        tokio::fs::write(&crop_path, &jpeg_bytes).await.map_err(|e| {
            PipelineError::ArtifactIoFailed {
                path: crop_path.display().to_string(),
                source: e,
            }
        })?;
        intermediate_paths.push(crop_path.clone());

        let subject_sr_path = self
            .upscale_timed(&crop_path, output_dir, UpscaleModel::Subject)
            .await?;
        intermediate_paths.push(subject_sr_path.clone());
        let subject_sr = self.decode_image_file(&subject_sr_path).await?;

        // Detection coordinates live in original space; the canvas is scaled.
        let scale = self.config.upscale.scale;
        let offset_x = x * scale;
        let offset_y = y * scale;
        let margin = self.config.feather_margin();

        let started = Instant::now();
        let composited = tokio::task::spawn_blocking(move || {
            let mut canvas = full_sr.to_rgba8();
            let subject_rgba = subject_sr.to_rgba8();
            let mask = feather_mask(subject_rgba.width(), subject_rgba.height(), margin);
            blend_region(&mut canvas, &subject_rgba, &mask, offset_x, offset_y);
            DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8())
        })
        .await
        .map_err(|e| PipelineError::ImageOpFailed(e.to_string()))?;

        let elapsed = started.elapsed();
        self.metrics.record_composite_duration(elapsed);
        self.metrics.record_subject_composited();
        debug!(
            "✓ Composited {}x{} subject at ({}, {}) in {:.2}ms",
            w * scale,
            h * scale,
            offset_x,
            offset_y,
            elapsed.as_secs_f64() * 1000.0
        );

        Ok((composited, true))
    }

    async fn decode_image_file(&self, path: &Path) -> PipelineResult<DynamicImage> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::ArtifactIoFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        let path_str = path.display().to_string();
        tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| PipelineError::ImageOpFailed(e.to_string()))?
            .map_err(|e| PipelineError::ImageLoadFailed {
                path: path_str,
                source: e,
            })
    }
}

/// Pick the subject to composite. Detections arrive sorted by confidence,
/// so the first label containing the subject class wins.
fn select_subject(detections: Vec<DetectionBox>, subject_class: &str) -> Option<DetectionBox> {
    detections
        .into_iter()
        .find(|d| d.class_label.to_lowercase().contains(subject_class))
}

fn subject_crop_filename(request_id: &str, subject_class: &str) -> String {
    format!("{}_{}.jpg", request_id, subject_class)
}

fn final_filename(request_id: &str) -> String {
    format!("{}_final.png", request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, confidence: f32) -> DetectionBox {
        DetectionBox {
            class_label: label.to_string(),
            confidence,
            bbox: [0, 0, 10, 10],
        }
    }

    #[test]
    fn test_select_subject_takes_first_match() {
        let detections = vec![det("person", 0.9), det("laptop", 0.8), det("laptop", 0.4)];
        let subject = select_subject(detections, "laptop").unwrap();
        assert_eq!(subject.confidence, 0.8);
    }

    #[test]
    fn test_select_subject_matches_substring() {
        let detections = vec![det("cell phone", 0.7)];
        assert!(select_subject(detections, "phone").is_some());
    }

    #[test]
    fn test_select_subject_is_case_insensitive() {
        let detections = vec![det("Laptop", 0.7)];
        assert!(select_subject(detections, "laptop").is_some());
    }

    #[test]
    fn test_select_subject_none_without_match() {
        let detections = vec![det("person", 0.9), det("dog", 0.8)];
        assert!(select_subject(detections, "laptop").is_none());
    }

    #[test]
    fn test_artifact_filenames() {
        assert_eq!(
            subject_crop_filename("abc123", "laptop"),
            "abc123_laptop.jpg"
        );
        assert_eq!(final_filename("abc123"), "abc123_final.png");
    }
}
