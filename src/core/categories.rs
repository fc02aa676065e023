// Category configuration tables and per-request override merging
//
// Base tables are immutable and built once at startup; a request may ship a
// JSON override that replaces whole keys (shallow merge, no deep merge).

use serde::Deserialize;
use std::collections::HashMap;

/// Category every lookup falls back to when the requested name is unknown.
pub const DEFAULT_CATEGORY: &str = "laptop";

/// Effective tagging configuration for one category.
#[derive(Debug, Clone)]
pub struct CategoryConfig {
    /// Detector class labels that may contribute tags. Empty means allow all.
    pub allowed_classes: Vec<String>,
    /// Fine-grained candidate labels per detector class, in prompt order.
    pub subcategories_by_class: HashMap<String, Vec<String>>,
    /// One-level tag expansion table.
    pub related_tags: HashMap<String, Vec<String>>,
    pub max_tags: usize,
}

impl CategoryConfig {
    /// Shallow merge: a present override key fully replaces the base key.
    pub fn merge(&self, overrides: &CategoryOverride) -> CategoryConfig {
        CategoryConfig {
            allowed_classes: overrides
                .allowed_classes
                .clone()
                .unwrap_or_else(|| self.allowed_classes.clone()),
            subcategories_by_class: overrides
                .subcategories_by_class
                .clone()
                .unwrap_or_else(|| self.subcategories_by_class.clone()),
            related_tags: overrides
                .related_tags
                .clone()
                .unwrap_or_else(|| self.related_tags.clone()),
            max_tags: overrides.max_tags.unwrap_or(self.max_tags),
        }
    }
}

/// Client-supplied override, parsed from the `config` multipart field.
/// Unknown keys are ignored, matching the permissive wire contract.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryOverride {
    pub allowed_classes: Option<Vec<String>>,
    pub subcategories_by_class: Option<HashMap<String, Vec<String>>>,
    pub related_tags: Option<HashMap<String, Vec<String>>>,
    pub max_tags: Option<usize>,
}

/// Built-in category tables plus the suggested-tag lists served to clients.
pub struct CategoryCatalog {
    configs: HashMap<String, CategoryConfig>,
    suggested: HashMap<String, Vec<String>>,
}

impl CategoryCatalog {
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();

        configs.insert(
            "laptop".to_string(),
            CategoryConfig {
                allowed_classes: strings(&[
                    "laptop",
                    "keyboard",
                    "mouse",
                    "cell phone",
                    "monitor",
                    "tv",
                    "remote",
                ]),
                subcategories_by_class: table(&[
                    (
                        "laptop",
                        &["ultrabook", "gaming laptop", "business laptop", "thin laptop"][..],
                    ),
                    ("keyboard", &["mechanical keyboard", "wireless keyboard"][..]),
                    ("mouse", &["gaming mouse", "wireless mouse"][..]),
                ]),
                related_tags: table(&[
                    ("ultrabook", &["thin laptop", "lightweight"][..]),
                    ("gaming laptop", &["rgb keyboard", "high performance"][..]),
                    ("business laptop", &["professional", "long battery life"][..]),
                    ("mechanical keyboard", &["rgb keyboard", "gaming keyboard"][..]),
                    ("wireless mouse", &["bluetooth", "portable"][..]),
                ]),
                max_tags: 20,
            },
        );

        configs.insert(
            "phone".to_string(),
            CategoryConfig {
                allowed_classes: strings(&["cell phone", "remote", "keyboard", "mouse"]),
                subcategories_by_class: table(&[(
                    "cell phone",
                    &["android phone", "iphone", "foldable phone"][..],
                )]),
                related_tags: table(&[
                    ("android phone", &["fast charging", "usb-c"][..]),
                    ("iphone", &["lightning cable", "ios"][..]),
                    ("foldable phone", &["flex display"][..]),
                ]),
                max_tags: 15,
            },
        );

        configs.insert(
            "monitor".to_string(),
            CategoryConfig {
                allowed_classes: strings(&[
                    "monitor", "tv", "keyboard", "mouse", "remote", "laptop",
                ]),
                subcategories_by_class: table(&[(
                    "monitor",
                    &["gaming monitor", "office monitor", "curved monitor", "4k monitor"][..],
                )]),
                related_tags: table(&[
                    ("gaming monitor", &["144hz", "1ms"][..]),
                    ("curved monitor", &["immersive"][..]),
                    ("4k monitor", &["high resolution"][..]),
                ]),
                max_tags: 15,
            },
        );

        let mut suggested = HashMap::new();
        suggested.insert(
            "laptop".to_string(),
            strings(&[
                "laptop",
                "ultrabook",
                "gaming laptop",
                "ssd",
                "ram",
                "usb-c",
                "backlit keyboard",
            ]),
        );
        suggested.insert(
            "phone".to_string(),
            strings(&[
                "smartphone",
                "android",
                "iphone",
                "fast charging",
                "oled",
                "phone case",
            ]),
        );
        suggested.insert(
            "monitor".to_string(),
            strings(&["monitor", "gaming monitor", "144hz", "4k", "hdr", "displayport"]),
        );

        Self { configs, suggested }
    }

    /// Category identifiers are trimmed and lowercased before lookup.
    pub fn normalize(raw: &str) -> String {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            normalized
        }
    }

    /// Base table for a category; unknown names fall back to the default.
    pub fn base_config(&self, category: &str) -> &CategoryConfig {
        self.configs
            .get(category)
            .unwrap_or_else(|| &self.configs[DEFAULT_CATEGORY])
    }

    /// Base table with the request override applied on top.
    pub fn effective_config(
        &self,
        category: &str,
        overrides: Option<&CategoryOverride>,
    ) -> CategoryConfig {
        let base = self.base_config(category);
        match overrides {
            Some(ov) => base.merge(ov),
            None => base.clone(),
        }
    }

    /// Suggested tags for a category; unknown names fall back to the default.
    pub fn suggested_tags(&self, category: &str) -> &[String] {
        self.suggested
            .get(category)
            .unwrap_or_else(|| &self.suggested[DEFAULT_CATEGORY])
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn table(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(key, values)| (key.to_string(), strings(values)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_cover_all_categories() {
        let catalog = CategoryCatalog::builtin();
        for category in ["laptop", "phone", "monitor"] {
            let config = catalog.base_config(category);
            assert!(!config.allowed_classes.is_empty());
            assert!(config.max_tags > 0);
            assert!(!catalog.suggested_tags(category).is_empty());
        }
    }

    #[test]
    fn unknown_category_falls_back_to_laptop() {
        let catalog = CategoryCatalog::builtin();
        let config = catalog.base_config("toaster");
        assert_eq!(config.max_tags, 20);
        assert!(config.allowed_classes.contains(&"laptop".to_string()));
        assert_eq!(
            catalog.suggested_tags("toaster"),
            catalog.suggested_tags("laptop")
        );
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(CategoryCatalog::normalize("  Phone "), "phone");
        assert_eq!(CategoryCatalog::normalize(""), DEFAULT_CATEGORY);
    }

    #[test]
    fn override_replaces_whole_keys_only() {
        let catalog = CategoryCatalog::builtin();
        let overrides = CategoryOverride {
            max_tags: Some(2),
            related_tags: Some(HashMap::new()),
            ..Default::default()
        };
        let merged = catalog.effective_config("laptop", Some(&overrides));

        // Overridden keys are fully replaced
        assert_eq!(merged.max_tags, 2);
        assert!(merged.related_tags.is_empty());
        // Untouched keys keep the base values
        assert_eq!(
            merged.allowed_classes,
            catalog.base_config("laptop").allowed_classes
        );
        assert!(!merged.subcategories_by_class.is_empty());
    }

    #[test]
    fn override_json_uses_camel_case_keys() {
        let raw = r#"{"maxTags": 3, "allowedClasses": ["laptop"], "relatedTags": {"x": ["y"]}}"#;
        let overrides: CategoryOverride = serde_json::from_str(raw).unwrap();
        assert_eq!(overrides.max_tags, Some(3));
        assert_eq!(overrides.allowed_classes.as_deref(), Some(&["laptop".to_string()][..]));
        assert_eq!(overrides.related_tags.unwrap()["x"], vec!["y".to_string()]);
    }

    #[test]
    fn malformed_override_json_is_rejected() {
        assert!(serde_json::from_str::<CategoryOverride>("{bad").is_err());
        // Negative maxTags cannot deserialize into an unsigned field
        assert!(serde_json::from_str::<CategoryOverride>(r#"{"maxTags": -1}"#).is_err());
    }
}
