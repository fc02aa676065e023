use crate::core::errors::ConfigError;
use std::env;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    /// Absolute-URL prefix for response links; derived from the request
    /// Host header when unset.
    pub public_base_url: Option<String>,
}

/// Detection configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Low on purpose: recall over precision, downstream classification
    /// filters the false positives.
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub target_size: u32,
    pub inference_backend: Option<String>,
    pub model_path: String,
    pub pool_size: usize,
}

/// Visual-semantic classifier configuration
#[derive(Debug, Clone)]
pub struct ClassificationConfig {
    pub vision_model_path: String,
    pub text_model_path: String,
    pub tokenizer_path: String,
    pub image_size: u32,
    pub temperature: f32,
}

/// Upscaler subprocess configuration
#[derive(Debug, Clone)]
pub struct UpscaleConfig {
    pub python_bin: String,
    pub script_path: String,
    pub general_model: String,
    pub subject_model: String,
    pub subject_model_weights: String,
    pub scale: u32,
    pub tile: u32,
    pub tile_pad: u32,
    pub suffix: String,
    pub timeout_secs: u64,
}

/// Request pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub upload_dir: String,
    pub output_dir: String,
    /// Substring matched (case-insensitive) against detector labels to pick
    /// the subject region; also names the subject artifact suffix.
    pub subject_class: String,
    pub feather_margin: u32,
    pub cleanup_intermediates: bool,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub classification: ClassificationConfig,
    pub upscale: UpscaleConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        // Parse log level
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        Ok(Self {
            server: ServerConfig {
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8600),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .ok()
                    .map(|s| s.trim_end_matches('/').to_string())
                    .filter(|s| !s.is_empty()),
            },
            detection: DetectionConfig {
                confidence_threshold: env::var("DETECTION_CONFIDENCE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.10),
                iou_threshold: env::var("DETECTION_IOU")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.45),
                target_size: env::var("DETECTION_TARGET_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(640),
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                model_path: env::var("DETECTOR_MODEL_PATH")
                    .unwrap_or_else(|_| "models/yolov8n.onnx".to_string()),
                pool_size: env::var("ONNX_POOL_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| std::cmp::min(num_cpus::get(), 4).max(1)),
            },
            classification: ClassificationConfig {
                vision_model_path: env::var("CLIP_VISION_MODEL_PATH")
                    .unwrap_or_else(|_| "models/clip_vision.onnx".to_string()),
                text_model_path: env::var("CLIP_TEXT_MODEL_PATH")
                    .unwrap_or_else(|_| "models/clip_text.onnx".to_string()),
                tokenizer_path: env::var("CLIP_TOKENIZER_PATH")
                    .unwrap_or_else(|_| "models/clip_tokenizer.json".to_string()),
                image_size: env::var("CLIP_IMAGE_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(224),
                temperature: env::var("CLIP_TEMPERATURE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.07),
            },
            upscale: UpscaleConfig {
                python_bin: env::var("PYTHON_BIN").unwrap_or_else(|_| "python3".to_string()),
                script_path: env::var("UPSCALER_SCRIPT")
                    .unwrap_or_else(|_| "realesrgan/inference_realesrgan.py".to_string()),
                general_model: env::var("UPSCALE_MODEL")
                    .unwrap_or_else(|_| "RealESRGAN_x4plus".to_string()),
                subject_model: env::var("SUBJECT_MODEL").unwrap_or_else(|_| "30kR".to_string()),
                subject_model_weights: env::var("SUBJECT_MODEL_WEIGHTS")
                    .unwrap_or_else(|_| "weights/30kR.pth".to_string()),
                scale: env::var("UPSCALE_SCALE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(4),
                tile: env::var("UPSCALE_TILE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(768),
                tile_pad: env::var("UPSCALE_TILE_PAD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                suffix: env::var("UPSCALE_SUFFIX").unwrap_or_else(|_| "sr".to_string()),
                timeout_secs: env::var("UPSCALE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            },
            pipeline: PipelineConfig {
                upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()),
                output_dir: env::var("OUTPUT_DIR").unwrap_or_else(|_| "out".to_string()),
                subject_class: env::var("SUBJECT_CLASS")
                    .map(|s| s.trim().to_lowercase())
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "laptop".to_string()),
                feather_margin: env::var("FEATHER_MARGIN")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
                cleanup_intermediates: env::var("CLEANUP_INTERMEDIATES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(false),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(self.detection.iou_threshold));
        }

        if !(320..=2048).contains(&self.detection.target_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be between 320 and 2048, got {}",
                self.detection.target_size
            )));
        }

        if self.detection.pool_size == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "pool_size must be > 0".to_string(),
            ));
        }

        if self.classification.image_size == 0 {
            return Err(ConfigError::InvalidClassificationConfig(
                "image_size must be > 0".to_string(),
            ));
        }

        if self.classification.temperature <= 0.0 {
            return Err(ConfigError::InvalidClassificationConfig(format!(
                "temperature must be > 0, got {}",
                self.classification.temperature
            )));
        }

        if !(1..=8).contains(&self.upscale.scale) {
            return Err(ConfigError::InvalidUpscaleConfig(format!(
                "scale must be between 1 and 8, got {}",
                self.upscale.scale
            )));
        }

        if self.upscale.tile > 0 && self.upscale.tile_pad >= self.upscale.tile {
            return Err(ConfigError::InvalidUpscaleConfig(format!(
                "tile_pad ({}) must be smaller than tile ({})",
                self.upscale.tile_pad, self.upscale.tile
            )));
        }

        if self.upscale.timeout_secs == 0 {
            return Err(ConfigError::InvalidUpscaleConfig(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.upscale.suffix.is_empty() {
            return Err(ConfigError::InvalidUpscaleConfig(
                "suffix must not be empty".to_string(),
            ));
        }

        if self.pipeline.upload_dir.is_empty() || self.pipeline.output_dir.is_empty() {
            return Err(ConfigError::InvalidPipelineConfig(
                "upload_dir and output_dir must not be empty".to_string(),
            ));
        }

        if self.pipeline.subject_class.is_empty() {
            return Err(ConfigError::InvalidPipelineConfig(
                "subject_class must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn iou_threshold(&self) -> f32 {
        self.detection.iou_threshold
    }

    pub fn target_size(&self) -> u32 {
        self.detection.target_size
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.detection.pool_size
    }

    pub fn upload_dir(&self) -> &str {
        &self.pipeline.upload_dir
    }

    pub fn output_dir(&self) -> &str {
        &self.pipeline.output_dir
    }

    pub fn subject_class(&self) -> &str {
        &self.pipeline.subject_class
    }

    pub fn feather_margin(&self) -> u32 {
        self.pipeline.feather_margin
    }

    pub fn cleanup_intermediates(&self) -> bool {
        self.pipeline.cleanup_intermediates
    }
}

// Note: No Default implementation because Config::new() can fail
// Users should explicitly call Config::new()? and handle errors

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                port: 8600,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                public_base_url: None,
            },
            detection: DetectionConfig {
                confidence_threshold: 0.10,
                iou_threshold: 0.45,
                target_size: 640,
                inference_backend: None,
                model_path: "models/yolov8n.onnx".to_string(),
                pool_size: 2,
            },
            classification: ClassificationConfig {
                vision_model_path: "models/clip_vision.onnx".to_string(),
                text_model_path: "models/clip_text.onnx".to_string(),
                tokenizer_path: "models/clip_tokenizer.json".to_string(),
                image_size: 224,
                temperature: 0.07,
            },
            upscale: UpscaleConfig {
                python_bin: "python3".to_string(),
                script_path: "realesrgan/inference_realesrgan.py".to_string(),
                general_model: "RealESRGAN_x4plus".to_string(),
                subject_model: "30kR".to_string(),
                subject_model_weights: "weights/30kR.pth".to_string(),
                scale: 4,
                tile: 768,
                tile_pad: 10,
                suffix: "sr".to_string(),
                timeout_secs: 600,
            },
            pipeline: PipelineConfig {
                upload_dir: "uploads".to_string(),
                output_dir: "out".to_string(),
                subject_class: "laptop".to_string(),
                feather_margin: 30,
                cleanup_intermediates: false,
            },
        }
    }

    #[test]
    fn default_shaped_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut config = base_config();
        config.detection.confidence_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfidenceThreshold(_))
        ));
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut config = base_config();
        config.upscale.timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUpscaleConfig(_))
        ));
    }

    #[test]
    fn rejects_tile_pad_larger_than_tile() {
        let mut config = base_config();
        config.upscale.tile = 64;
        config.upscale.tile_pad = 64;
        assert!(config.validate().is_err());
    }
}
