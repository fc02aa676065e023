// Library exports for the product enhancement + auto-tagging service

// Core modules
pub mod core;
pub mod orchestration;
pub mod pipeline;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    categories::{CategoryCatalog, CategoryConfig, CategoryOverride},
    config::Config,
    errors::{
        ClassificationError, ConfigError, DetectionError, PipelineError, TaggingError,
        UpscaleError,
    },
    types::{
        DetectionBox, EnhancementOutcome, ProcessRequest, ProcessResponse, SuggestedTagsResponse,
    },
};

pub use orchestration::RequestOrchestrator;

pub use pipeline::{EnhancementPipeline, TagGenerator};

pub use services::{ClassificationService, DetectionService, UpscaleModel, UpscaleService};

pub use utils::{load_image_from_memory_async, Metrics};
