// Custom error types for better error handling and debugging
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation
// - Type-safe error matching
// - Automatic Display/Error trait implementations
// - Source error chaining

use thiserror::Error;

/// Detection service errors
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Image preprocessing failed: {0}")]
    PreprocessingFailed(String),

    #[error("Unexpected detector output: {0}")]
    MalformedOutput(String),
}

/// Visual-semantic classifier errors
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Cannot classify against an empty prompt batch")]
    EmptyPromptBatch,

    #[error("Unexpected encoder output: {0}")]
    MalformedOutput(String),
}

/// Upscaler subprocess errors
#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("Failed to spawn upscaler process '{program}': {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("Upscaler exited with status {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },

    #[error("Upscaler produced no output at {path}")]
    OutputMissing { path: String },

    #[error("Upscaler timed out after {seconds}s")]
    TimedOut { seconds: u64 },
}

/// Tag generation errors
#[derive(Debug, Error)]
pub enum TaggingError {
    #[error("max_tags must be a positive integer")]
    InvalidMaxTags,

    #[error("Detection failed during tag generation: {0}")]
    DetectionFailed(#[from] DetectionError),

    #[error("Classification failed during tag generation: {0}")]
    ClassificationFailed(#[from] ClassificationError),
}

/// Request pipeline errors
///
/// Every variant is fatal for its request: there are no retries and no
/// partial results (a request returns either image + tags or an error).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to persist upload to {path}: {source}")]
    UploadSaveFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to load image {path}: {source}")]
    ImageLoadFailed {
        path: String,
        source: image::ImageError,
    },

    #[error("Failed to read/write artifact {path}: {source}")]
    ArtifactIoFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Image operation failed: {0}")]
    ImageOpFailed(String),

    #[error("Enhancement failed: {0}")]
    EnhancementFailed(#[source] UpscaleError),

    #[error("Detection failed: {0}")]
    DetectionFailed(#[from] DetectionError),

    #[error("Tag generation failed: {0}")]
    TaggingFailed(#[from] TaggingError),
}

impl PipelineError {
    /// True when the failure is attributable to client-supplied input
    /// (mapped to 400 instead of 500 at the HTTP layer).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::TaggingFailed(TaggingError::InvalidMaxTags)
        )
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid classification config: {0}")]
    InvalidClassificationConfig(String),

    #[error("Invalid upscale config: {0}")]
    InvalidUpscaleConfig(String),

    #[error("Invalid pipeline config: {0}")]
    InvalidPipelineConfig(String),
}

// Convenience type aliases for Results
pub type DetectionResult<T> = Result<T, DetectionError>;
pub type ClassificationResult<T> = Result<T, ClassificationError>;
pub type UpscaleResult<T> = Result<T, UpscaleError>;
pub type TaggingResult<T> = Result<T, TaggingError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_max_tags_is_client_error() {
        let err = PipelineError::TaggingFailed(TaggingError::InvalidMaxTags);
        assert!(err.is_client_error());
    }

    #[test]
    fn upscale_failure_is_server_error() {
        let err = PipelineError::EnhancementFailed(UpscaleError::OutputMissing {
            path: "out/abc_sr.jpg".to_string(),
        });
        assert!(!err.is_client_error());
    }
}
