// Shared types for the enhancement + tagging workflow

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::categories::CategoryOverride;

/// A single detector hit in source-image pixel coordinates.
///
/// Ordering of a detection batch is confidence-descending after NMS and is
/// deterministic for identical model weights and input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionBox {
    pub class_label: String,
    pub confidence: f32,
    /// x1, y1, x2, y2
    pub bbox: [i32; 4],
}

impl DetectionBox {
    pub fn width(&self) -> i32 {
        (self.bbox[2] - self.bbox[0]).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bbox[3] - self.bbox[1]).max(0)
    }
}

/// Parsed multipart input for one /process request.
///
/// The config override is parsed at the HTTP boundary so malformed JSON is
/// rejected before any file is written or model invoked.
pub struct ProcessRequest {
    pub image_bytes: Vec<u8>,
    pub name: String,
    pub category: String,
    pub config_override: Option<CategoryOverride>,
}

/// Result of the region-aware enhancement pipeline.
#[derive(Debug, Clone)]
pub struct EnhancementOutcome {
    pub final_path: PathBuf,
    /// Dimensions of the full-image upscale; the final image always has
    /// exactly these dimensions whether or not a subject was composited.
    pub final_width: u32,
    pub final_height: u32,
    /// The subject region that received the specialized pass, if any.
    pub subject: Option<DetectionBox>,
    /// Intermediate files written along the way (candidates for cleanup).
    pub intermediate_paths: Vec<PathBuf>,
}

/// Success payload for POST /process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub name: String,
    pub category: String,
    pub generated_tags: Vec<String>,
    pub original_image: String,
    pub enhanced_image: String,
    pub original_resolution: [u32; 2],
    pub enhanced_resolution: [u32; 2],
    pub enhanced_image_name: String,
    pub enhanced_image_url: String,
}

/// Payload for GET /suggested-tags
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedTagsResponse {
    pub category: String,
    pub suggested_tags: Vec<String>,
}
