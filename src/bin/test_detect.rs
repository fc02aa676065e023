//! Quick detection test binary - run the YOLO model against one image
//! Run with: cargo run --release --bin test_detect -- <image_path>

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use product_enhance::{Config, DetectionService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("product_enhance=debug,ort=off")
        .with_target(false)
        .init();

    // Get image path from args
    let args: Vec<String> = std::env::args().collect();
    let sample_path = if args.len() > 1 {
        args[1].clone()
    } else {
        "test_sample.jpg".to_string()
    };

    if !Path::new(&sample_path).exists() {
        eprintln!("Image not found: {}", sample_path);
        std::process::exit(1);
    }

    info!("Loading image: {}", sample_path);
    let image = image::open(&sample_path)?;
    info!("Image dimensions: {}x{}", image.width(), image.height());

    let config = Arc::new(Config::new()?);
    let detector = DetectionService::new(config).await?;

    info!("\n=== Running detection ===");
    let detections = detector.detect(&image).await?;

    println!("\n=== Results ===");
    println!("Detections: {}", detections.len());
    if detections.is_empty() {
        println!("  (none)");
    } else {
        for (i, det) in detections.iter().enumerate() {
            println!(
                "  {}. {} ({:.3}) at [{}, {}, {}, {}]",
                i + 1,
                det.class_label,
                det.confidence,
                det.bbox[0],
                det.bbox[1],
                det.bbox[2],
                det.bbox[3]
            );
        }
    }

    Ok(())
}
