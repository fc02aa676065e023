pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    blend_region,
    clamp_box,
    crop_image_async,
    encode_jpeg_async,
    encode_png_async,
    feather_mask,
    load_image_from_memory_async,
};
pub use metrics::Metrics;
