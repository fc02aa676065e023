// Hierarchical auto-tagging: detector classes filtered by the category
// config, refined to subcategories by the zero-shot classifier, then
// expanded one level through the related-tags table.

use crate::core::categories::CategoryConfig;
use crate::core::errors::{TaggingError, TaggingResult};
use crate::services::{ClassificationService, DetectionService};
use crate::utils::image_ops::clamp_box;
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct TagGenerator {
    detection: Arc<DetectionService>,
    classification: Arc<ClassificationService>,
}

impl TagGenerator {
    pub fn new(
        detection: Arc<DetectionService>,
        classification: Arc<ClassificationService>,
    ) -> Self {
        Self {
            detection,
            classification,
        }
    }

    /// Produce the bounded tag list for one image under a category config.
    ///
    /// All-or-nothing: a detector or classifier failure fails the whole
    /// call, never a partial list. The input image is not modified.
    pub async fn generate_tags(
        &self,
        img: &DynamicImage,
        config: &CategoryConfig,
    ) -> TaggingResult<Vec<String>> {
        validate_max_tags(config)?;

        let detections = self.detection.detect(img).await?;
        debug!("🔍 Tagging: {} detections to consider", detections.len());

        let mut raw_labels = Vec::new();
        for detection in &detections {
            if !class_allowed(&config.allowed_classes, &detection.class_label) {
                trace!("Skipping '{}': not in allowed classes", detection.class_label);
                continue;
            }

            let (x, y, w, h) = clamp_box(&detection.bbox, img.width(), img.height());
            if w == 0 || h == 0 {
                continue;
            }

            let label = match config.subcategories_by_class.get(&detection.class_label) {
                Some(subcategories) if !subcategories.is_empty() => {
                    // crop_imm copies just the region; the classifier call
                    // dominates this path anyway
                    let crop = img.crop_imm(x, y, w, h);
                    self.classification.classify(&crop, subcategories).await?
                }
                _ => detection.class_label.clone(),
            };

            trace!("Detection '{}' contributes tag '{}'", detection.class_label, label);
            raw_labels.push(label);
        }

        let tags = finalize_tags(raw_labels, config);
        debug!("✓ Generated {} tags (cap {})", tags.len(), config.max_tags);
        Ok(tags)
    }
}

/// Reject a zero tag budget before any model work happens.
pub fn validate_max_tags(config: &CategoryConfig) -> TaggingResult<()> {
    if config.max_tags == 0 {
        return Err(TaggingError::InvalidMaxTags);
    }
    Ok(())
}

/// Empty allow list admits every class; otherwise exact label match.
fn class_allowed(allowed: &[String], class_label: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|a| a == class_label)
}

fn push_unique(tags: &mut Vec<String>, tag: String) {
    if !tags.iter().any(|t| t == &tag) {
        tags.push(tag);
    }
}

/// De-duplicate in insertion order, expand related tags exactly one level,
/// then truncate to the budget. Order is the insertion order, so truncation
/// is deterministic for a given detection order.
fn finalize_tags(raw_labels: Vec<String>, config: &CategoryConfig) -> Vec<String> {
    let mut tags = Vec::new();
    for label in raw_labels {
        push_unique(&mut tags, label);
    }

    expand_related(&mut tags, &config.related_tags);

    tags.truncate(config.max_tags);
    tags
}

/// Union in `related_tags[tag]` for every tag present before the expansion
/// started. Related tags of related tags are never added.
fn expand_related(tags: &mut Vec<String>, related: &HashMap<String, Vec<String>>) {
    let snapshot = tags.clone();
    for tag in &snapshot {
        if let Some(extra) = related.get(tag) {
            for item in extra {
                push_unique(tags, item.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(
        allowed: &[&str],
        related: &[(&str, &[&str])],
        max_tags: usize,
    ) -> CategoryConfig {
        CategoryConfig {
            allowed_classes: allowed.iter().map(|s| s.to_string()).collect(),
            subcategories_by_class: HashMap::new(),
            related_tags: related
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
            max_tags,
        }
    }

    #[test]
    fn test_validate_max_tags() {
        assert!(validate_max_tags(&config(&[], &[], 5)).is_ok());
        assert!(matches!(
            validate_max_tags(&config(&[], &[], 0)),
            Err(TaggingError::InvalidMaxTags)
        ));
    }

    #[test]
    fn test_class_allowed_empty_admits_all() {
        assert!(class_allowed(&[], "laptop"));
        assert!(class_allowed(&[], "zebra"));
    }

    #[test]
    fn test_class_allowed_filters_exact() {
        let allowed = vec!["laptop".to_string(), "cell phone".to_string()];
        assert!(class_allowed(&allowed, "laptop"));
        assert!(class_allowed(&allowed, "cell phone"));
        assert!(!class_allowed(&allowed, "phone"));
        assert!(!class_allowed(&allowed, "dog"));
    }

    #[test]
    fn test_push_unique_preserves_first_occurrence() {
        let mut tags = Vec::new();
        push_unique(&mut tags, "laptop".to_string());
        push_unique(&mut tags, "mouse".to_string());
        push_unique(&mut tags, "laptop".to_string());
        assert_eq!(tags, vec!["laptop", "mouse"]);
    }

    #[test]
    fn test_expand_related_single_level_only() {
        let cfg = config(&[], &[("a", &["b"]), ("b", &["c"])], 20);
        let tags = finalize_tags(vec!["a".to_string()], &cfg);

        // "b" arrives through "a", but "c" must not arrive through "b"
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn test_expand_related_skips_existing() {
        let cfg = config(&[], &[("ultrabook", &["thin laptop", "lightweight"])], 20);
        let tags = finalize_tags(
            vec!["ultrabook".to_string(), "lightweight".to_string()],
            &cfg,
        );
        assert_eq!(tags, vec!["ultrabook", "lightweight", "thin laptop"]);
    }

    #[test]
    fn test_finalize_deduplicates_raw_labels() {
        let cfg = config(&[], &[], 20);
        let tags = finalize_tags(
            vec![
                "laptop".to_string(),
                "laptop".to_string(),
                "mouse".to_string(),
            ],
            &cfg,
        );
        assert_eq!(tags, vec!["laptop", "mouse"]);
    }

    #[test]
    fn test_truncation_is_stable_insertion_order() {
        let cfg = config(&[], &[("a", &["x", "y", "z"])], 4);
        let tags = finalize_tags(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            &cfg,
        );

        // Insertion order: a, b, c, then expansion x, y, z; cap at 4
        assert_eq!(tags, vec!["a", "b", "c", "x"]);
    }

    #[test]
    fn test_expansion_caps_do_not_reorder() {
        let cfg = config(&[], &[("gaming laptop", &["rgb keyboard", "high performance"])], 2);
        let tags = finalize_tags(
            vec!["gaming laptop".to_string(), "mouse".to_string()],
            &cfg,
        );
        assert_eq!(tags, vec!["gaming laptop", "mouse"]);
    }
}
