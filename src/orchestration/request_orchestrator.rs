// Request orchestrator: one upload in, enhanced image plus tags out

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::categories::CategoryCatalog;
use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{ProcessRequest, ProcessResponse, SuggestedTagsResponse};
use crate::pipeline::tagging::validate_max_tags;
use crate::pipeline::{EnhancementPipeline, TagGenerator};
use crate::services::{ClassificationService, DetectionService, UpscaleService};
use crate::utils::Metrics;

pub struct RequestOrchestrator {
    config: Arc<Config>,
    catalog: CategoryCatalog,
    enhancement: EnhancementPipeline,
    tagger: TagGenerator,
    metrics: Metrics,
    backend_type: String,
}

impl RequestOrchestrator {
    /// Load every model once and wire up the per-request pipelines.
    #[instrument(skip(config, metrics))]
    pub async fn new(config: Arc<Config>, metrics: Metrics) -> Result<Self> {
        info!("Initializing services...");

        tokio::fs::create_dir_all(config.upload_dir()).await?;
        tokio::fs::create_dir_all(config.output_dir()).await?;

        let detector = Arc::new(DetectionService::new(config.clone()).await?);
        let classifier = Arc::new(ClassificationService::new(config.clone()).await?);
        let upscaler = Arc::new(UpscaleService::new(config.clone()));

        // Stored for the health endpoint
        let backend_type = detector.device_type().to_string();

        let enhancement = EnhancementPipeline::new(
            Arc::clone(&detector),
            upscaler,
            config.clone(),
            metrics.clone(),
        );
        let tagger = TagGenerator::new(detector, classifier);
        let catalog = CategoryCatalog::builtin();

        info!(
            "✓ Ready (ONNX pool: {} sessions, subject class: '{}')",
            config.onnx_pool_size(),
            config.subject_class()
        );

        Ok(Self {
            config,
            catalog,
            enhancement,
            tagger,
            metrics,
            backend_type,
        })
    }

    /// Get the backend type (e.g., "CUDA", "TensorRT", "CPU")
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn suggested_tags(&self, raw_category: &str) -> SuggestedTagsResponse {
        let category = CategoryCatalog::normalize(raw_category);
        let suggested_tags = self.catalog.suggested_tags(&category).to_vec();
        SuggestedTagsResponse {
            category,
            suggested_tags,
        }
    }

    /// Run one request end to end.
    ///
    /// All-or-nothing: any stage failure aborts the request. Tagging runs on
    /// the enhanced final image, so it never starts when enhancement fails.
    /// `base_url` feeds the absolute URL in the response.
    #[instrument(skip(self, request, base_url), fields(category = %request.category, bytes = request.image_bytes.len()))]
    pub async fn process(
        &self,
        request: ProcessRequest,
        base_url: &str,
    ) -> PipelineResult<ProcessResponse> {
        let start_time = Instant::now();
        let ProcessRequest {
            image_bytes,
            name,
            category,
            config_override,
        } = request;

        // ===== VALIDATE & PERSIST =====
        let category = CategoryCatalog::normalize(&category);
        let effective = self
            .catalog
            .effective_config(&category, config_override.as_ref());
        validate_max_tags(&effective)?;

        let request_id = Uuid::new_v4().simple().to_string();
        let upload_path =
            Path::new(self.config.upload_dir()).join(format!("{}.jpg", request_id));
        tokio::fs::write(&upload_path, &image_bytes)
            .await
            .map_err(|e| PipelineError::UploadSaveFailed {
                path: upload_path.display().to_string(),
                source: e,
            })?;

        let original = self.decode_bytes(image_bytes, &upload_path).await?;
        info!(
            "Processing {} ({}x{}, category '{}')",
            request_id,
            original.width(),
            original.height(),
            category
        );

        // ===== ENHANCE =====
        let outcome = self
            .enhancement
            .enhance(&original, &upload_path, &request_id)
            .await?;

        // ===== TAG (on the enhanced output) =====
        let final_image = self.decode_artifact(&outcome.final_path).await?;
        let tag_start = Instant::now();
        let tags = self.tagger.generate_tags(&final_image, &effective).await?;
        self.metrics.record_tagging_duration(tag_start.elapsed());
        self.metrics.record_tags_generated(tags.len());

        // ===== CLEANUP & RESPOND =====
        if self.config.cleanup_intermediates() {
            self.remove_intermediates(&outcome.intermediate_paths).await;
        }

        let original_rel = format!("/uploads/{}.jpg", request_id);
        let enhanced_name = outcome
            .final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_final.png", request_id));
        let enhanced_rel = format!("/out/{}", enhanced_name);
        let enhanced_image_url = format!("{}{}", base_url.trim_end_matches('/'), enhanced_rel);

        let response = ProcessResponse {
            name,
            category,
            generated_tags: tags,
            original_image: original_rel,
            enhanced_image: enhanced_rel,
            original_resolution: [original.width(), original.height()],
            enhanced_resolution: [outcome.final_width, outcome.final_height],
            enhanced_image_name: enhanced_name,
            enhanced_image_url,
        };

        info!(
            "✓ Request {} complete in {:.2}s ({} tags, {})",
            request_id,
            start_time.elapsed().as_secs_f64(),
            response.generated_tags.len(),
            if outcome.subject.is_some() {
                "subject composited"
            } else {
                "no subject"
            }
        );

        Ok(response)
    }

    async fn decode_bytes(
        &self,
        bytes: Vec<u8>,
        path: &Path,
    ) -> PipelineResult<image::DynamicImage> {
        let path_str = path.display().to_string();
        tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| PipelineError::ImageOpFailed(e.to_string()))?
            .map_err(|e| PipelineError::ImageLoadFailed {
                path: path_str,
                source: e,
            })
    }

    async fn decode_artifact(&self, path: &Path) -> PipelineResult<image::DynamicImage> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::ArtifactIoFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        self.decode_bytes(bytes, path).await
    }

    /// Best-effort removal; a leftover file is worth a warning, not a failure.
    async fn remove_intermediates(&self, paths: &[PathBuf]) {
        let mut removed = 0usize;
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "⚠️  Could not remove intermediate {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        info!("🧹 Removed {} intermediate files", removed);
    }
}
