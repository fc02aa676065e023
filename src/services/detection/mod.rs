use crate::core::config::Config;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::DetectionBox;
use crate::services::onnx_builder;
use anyhow::Result;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, info, trace};

/// COCO class names in model output order. YOLOv8 emits class indices into
/// this table; index 63 is "laptop", 67 is "cell phone".
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Session pool for concurrent inference
pub struct SessionPool {
    sender: Sender<Session>,
    receiver: Arc<tokio::sync::Mutex<Receiver<Session>>>,
}

impl SessionPool {
    async fn acquire(&self) -> Session {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.expect("Session pool exhausted")
    }

    async fn release(&self, session: Session) {
        self.sender.send(session).await.expect("Failed to return session to pool");
    }
}

pub struct DetectionService {
    session_pool: Arc<SessionPool>,
    config: Arc<Config>,
    device_type: String,
}

impl DetectionService {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let pool_size = config.onnx_pool_size();
        debug!("Creating detection session pool with {} sessions", pool_size);

        // Create first session to determine device type
        let (device_type, first_session) = Self::build_session(&config)?;

        // Create channel for session pool
        let (sender, receiver) = channel(pool_size);

        // Send first session to pool
        sender.send(first_session).await
            .map_err(|_| anyhow::anyhow!("Failed to initialize session pool"))?;

        // Create remaining sessions IN PARALLEL for faster startup
        if pool_size > 1 {
            let mut tasks = Vec::new();

            for i in 1..pool_size {
                let config_clone = Arc::clone(&config);
                let task = tokio::task::spawn_blocking(move || {
                    debug!("Creating session {} of {}", i + 1, pool_size);
                    Self::build_session(&config_clone)
                });
                tasks.push(task);
            }

            // Wait for all sessions to be created
            for task in tasks {
                let (_, session) = task.await
                    .map_err(|e| anyhow::anyhow!("Failed to spawn session creation: {}", e))??;
                sender.send(session).await
                    .map_err(|_| anyhow::anyhow!("Failed to add session to pool"))?;
            }
        }

        let session_pool = Arc::new(SessionPool {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        });

        info!("✓ Detection: {} ({} sessions)", device_type, pool_size);

        Ok(Self {
            session_pool,
            config,
            device_type,
        })
    }

    fn build_session(config: &Config) -> Result<(String, Session)> {
        onnx_builder::build_session_from_file(
            &config.detection.model_path,
            "YOLO detector",
            config.detection.inference_backend.as_deref(),
        )
    }

    #[allow(dead_code)]
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    fn preprocess_image(&self, img: &DynamicImage) -> Array4<f32> {
        let target_size = self.config.target_size();
        trace!("Preprocessing image: {}x{} → {}x{}",
            img.width(), img.height(),
            target_size, target_size);

        let resized = img.resize_exact(
            target_size,
            target_size,
            image::imageops::FilterType::Triangle,
        );
        let rgb_img = resized.to_rgb8();

        let target = target_size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, target, target));

        for y in 0..target {
            for x in 0..target {
                let pixel = rgb_img.get_pixel(x as u32, y as u32);
                array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
                array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
                array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
            }
        }

        debug!("✓ Image preprocessed: array shape=[1, 3, {}, {}]", target, target);
        array
    }

    /// Detect all objects in the image, across every class the model knows.
    ///
    /// Returns boxes in original-image pixel coordinates, NMS-filtered and
    /// sorted by confidence (highest first). Callers filter by class label.
    pub async fn detect(&self, img: &DynamicImage) -> DetectionResult<Vec<DetectionBox>> {
        debug!("🔍 [DETECTION] Starting detection on {}x{} image", img.width(), img.height());
        let detection_start = std::time::Instant::now();

        let preprocessed = self.preprocess_image(img);
        let images_value = Value::from_array(preprocessed)?;

        debug!("Running ONNX inference on {}...", self.device_type);
        let inference_start = std::time::Instant::now();

        // Acquire session from pool and run inference
        let (output_shape, output_data) = {
            let mut session = self.session_pool.acquire().await;
            let outputs = session.run(ort::inputs!["images" => images_value])?;

            // Extract and immediately clone all data while session is borrowed
            let (shape, data) = outputs["output0"].try_extract_tensor::<f32>()?;
            let shape_owned = shape.to_vec();
            let data_owned = data.to_vec();

            // Drop outputs and return session to pool
            drop(outputs);
            self.session_pool.release(session).await;

            (shape_owned, data_owned)
        };

        let inference_time = inference_start.elapsed();
        debug!("✓ Inference completed in {:.2}ms", inference_time.as_secs_f64() * 1000.0);

        if output_shape.len() != 3 || output_shape[1] < 5 {
            return Err(DetectionError::MalformedOutput(format!(
                "expected [1, 4+classes, anchors] output, got {:?}",
                output_shape
            )));
        }

        let num_attrs = output_shape[1] as usize;
        let num_anchors = output_shape[2] as usize;
        trace!("Raw predictions from model: {} anchors x {} attrs", num_anchors, num_attrs);

        let detections = decode_predictions(
            &output_data,
            num_attrs,
            num_anchors,
            img.width(),
            img.height(),
            self.config.target_size(),
            self.config.confidence_threshold(),
        );
        debug!("Filtered {} detections above confidence threshold {:.2}",
            detections.len(), self.config.confidence_threshold());

        let mut kept = nms(detections, self.config.iou_threshold());

        // Highest confidence first so "best box of class X" is a simple find()
        kept.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal));

        let total_time = detection_start.elapsed();
        debug!("✅ [DETECTION] Completed: {} objects in {:.2}ms",
            kept.len(), total_time.as_secs_f64() * 1000.0);

        Ok(kept)
    }
}

/// Decode raw YOLOv8 output into boxes in original-image coordinates.
///
/// The tensor is laid out `[1, 4 + num_classes, num_anchors]`: rows 0-3 are
/// box center/size in letterbox-free 640-space, the rest are per-class scores.
/// Each anchor keeps its best class; anchors below the confidence threshold
/// are dropped before NMS.
fn decode_predictions(
    data: &[f32],
    num_attrs: usize,
    num_anchors: usize,
    orig_width: u32,
    orig_height: u32,
    target_size: u32,
    confidence_threshold: f32,
) -> Vec<DetectionBox> {
    let num_classes = num_attrs - 4;
    let sx = orig_width as f32 / target_size as f32;
    let sy = orig_height as f32 / target_size as f32;

    let mut detections = Vec::new();

    for anchor in 0..num_anchors {
        // Best class for this anchor
        let mut best_class = 0usize;
        let mut best_score = 0.0f32;
        for class in 0..num_classes {
            let score = data[(4 + class) * num_anchors + anchor];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }

        if best_score < confidence_threshold {
            continue;
        }

        let cx = data[anchor];
        let cy = data[num_anchors + anchor];
        let w = data[2 * num_anchors + anchor];
        let h = data[3 * num_anchors + anchor];

        // Center/size → corners, then rescale to original image space
        let x1 = (((cx - w / 2.0) * sx).round() as i32).clamp(0, orig_width as i32);
        let y1 = (((cy - h / 2.0) * sy).round() as i32).clamp(0, orig_height as i32);
        let x2 = (((cx + w / 2.0) * sx).round() as i32).clamp(0, orig_width as i32);
        let y2 = (((cy + h / 2.0) * sy).round() as i32).clamp(0, orig_height as i32);

        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let class_label = COCO_CLASSES
            .get(best_class)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("class_{}", best_class));

        trace!("Anchor {}: {} conf={:.3} bbox=[{}, {}, {}, {}]",
            anchor, class_label, best_score, x1, y1, x2, y2);

        detections.push(DetectionBox {
            class_label,
            confidence: best_score,
            bbox: [x1, y1, x2, y2],
        });
    }

    detections
}

fn calculate_iou(box1: &[i32; 4], box2: &[i32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = ((x2 - x1) * (y2 - y1)) as f32;
    let area1 = ((box1[2] - box1[0]) * (box1[3] - box1[1])) as f32;
    let area2 = ((box2[2] - box2[0]) * (box2[3] - box2[1])) as f32;
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Class-aware non-maximum suppression: boxes only suppress boxes of the
/// same class, matching how the upstream detector behaves.
fn nms(detections: Vec<DetectionBox>, iou_threshold: f32) -> Vec<DetectionBox> {
    if detections.is_empty() {
        debug!("NMS: No detections to filter");
        return vec![];
    }

    trace!("NMS: Processing {} detections with IoU threshold={}",
        detections.len(), iou_threshold);

    let mut sorted = detections;
    sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence)
        .unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];
    let mut suppressed_count = 0;

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(sorted[i].clone());

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] && sorted[i].class_label == sorted[j].class_label {
                let iou = calculate_iou(&sorted[i].bbox, &sorted[j].bbox);
                if iou > iou_threshold {
                    suppressed[j] = true;
                    suppressed_count += 1;
                    trace!("NMS: Suppressed detection {} (IoU={:.3} with detection {})",
                        j, iou, i);
                }
            }
        }
    }

    debug!("NMS: Kept {}/{} detections (suppressed {})",
        keep.len(), sorted.len(), suppressed_count);
    keep
}
