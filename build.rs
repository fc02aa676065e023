use std::env;

fn main() {
    // Models are loaded at runtime from these default paths (overridable via env).
    // Missing files are not a build error, but warn early so deploys don't start blind.
    let model_paths = [
        ("detector", "models/yolov8n.onnx"),
        ("clip vision encoder", "models/clip_vision.onnx"),
        ("clip text encoder", "models/clip_text.onnx"),
        ("clip tokenizer", "models/clip_tokenizer.json"),
    ];

    for (name, path) in model_paths {
        if std::path::Path::new(path).exists() {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            println!(
                "cargo:warning=Found {} at {} ({:.1} MB)",
                name,
                path,
                size as f64 / 1_048_576.0
            );
        } else {
            println!(
                "cargo:warning=Missing {} at {} (set the corresponding *_MODEL_PATH env var or copy the file before running)",
                name, path
            );
        }
        println!("cargo:rerun-if-changed={}", path);
    }

    // Detect enabled acceleration features
    let mut enabled_features = Vec::new();

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        enabled_features.push("CUDA");
    }
    if env::var("CARGO_FEATURE_TENSORRT").is_ok() {
        enabled_features.push("TensorRT");
    }
    if env::var("CARGO_FEATURE_DIRECTML").is_ok() {
        enabled_features.push("DirectML");
    }
    if env::var("CARGO_FEATURE_COREML").is_ok() {
        enabled_features.push("CoreML");
    }
    if env::var("CARGO_FEATURE_OPENVINO").is_ok() {
        enabled_features.push("OpenVINO");
    }
    if env::var("CARGO_FEATURE_XNNPACK").is_ok() {
        enabled_features.push("XNNPACK");
    }

    if enabled_features.is_empty() {
        println!("cargo:warning=Building with CPU-only inference (no GPU acceleration)");
        println!("cargo:warning=To enable GPU: cargo build --features cuda (or directml on Windows)");
    } else {
        println!(
            "cargo:warning=GPU acceleration enabled: {}",
            enabled_features.join(", ")
        );
    }

    // Platform-specific warnings
    let target = env::var("TARGET").unwrap_or_default();

    if target.contains("windows-gnu") && enabled_features.contains(&"CUDA") {
        println!("cargo:warning=WARNING: CUDA binaries may not be available for Windows GNU target");
        println!("cargo:warning=Consider using DirectML instead: cargo build --features directml");
    }
}
