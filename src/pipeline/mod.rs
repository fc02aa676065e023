pub mod enhance;
pub mod tagging;

pub use enhance::EnhancementPipeline;
pub use tagging::TagGenerator;
