pub mod categories;
pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use categories::{CategoryCatalog, CategoryConfig, CategoryOverride, DEFAULT_CATEGORY};
pub use config::Config;
pub use errors::{
    ClassificationError, ConfigError, DetectionError, PipelineError, TaggingError, UpscaleError,
};
pub use types::{
    DetectionBox, EnhancementOutcome, ProcessRequest, ProcessResponse, SuggestedTagsResponse,
};
