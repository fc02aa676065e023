pub mod classification;
pub mod detection;
pub mod onnx_builder; // Shared ONNX session builder (one provider chain for all models)
pub mod upscaling;

// Re-export commonly used services
pub use classification::ClassificationService;
pub use detection::DetectionService;
pub use upscaling::{UpscaleModel, UpscaleService};
