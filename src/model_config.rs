// src/model_config.rs
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessorConfig {
    pub do_normalize: bool,
    pub do_rescale: bool,
    pub image_mean: [f32; 3],
    pub image_processor_type: String,
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
    pub size: ImageSize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
}

/// The `id2label` part of the exported model's config.json.
#[derive(Debug, Deserialize, Clone)]
pub struct LabelConfig {
    pub id2label: BTreeMap<usize, String>,
}

impl Default for LabelConfig {
    // Falconsai/nsfw_image_detection ships "0": "normal", "1": "nsfw".
    fn default() -> Self {
        Self {
            id2label: BTreeMap::from([(0, "normal".to_string()), (1, "nsfw".to_string())]),
        }
    }
}

impl LabelConfig {
    /// Lowercased, underscore-separated label for an output index.
    pub fn label(&self, index: usize) -> String {
        match self.id2label.get(&index) {
            Some(label) => label.trim().to_lowercase().replace(' ', "_"),
            None => format!("class_{index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hugging_face_id2label() {
        let config: LabelConfig =
            serde_json::from_str(r#"{"id2label": {"0": "Normal", "1": "NSFW"}, "other": 1}"#)
                .unwrap();
        assert_eq!(config.label(0), "normal");
        assert_eq!(config.label(1), "nsfw");
    }

    #[test]
    fn parses_vit_preprocessor_config() {
        let config: PreprocessorConfig = serde_json::from_str(
            r#"{
                "do_normalize": true,
                "do_rescale": true,
                "do_resize": true,
                "image_mean": [0.5, 0.5, 0.5],
                "image_processor_type": "ViTImageProcessor",
                "image_std": [0.5, 0.5, 0.5],
                "resample": 2,
                "rescale_factor": 0.00392156862745098,
                "size": {"height": 224, "width": 224}
            }"#,
        )
        .unwrap();
        assert_eq!(config.image_processor_type, "ViTImageProcessor");
        assert_eq!((config.size.width, config.size.height), (224, 224));
        assert_eq!(config.image_mean, [0.5; 3]);
    }

    #[test]
    fn unknown_index_gets_placeholder_label() {
        let config = LabelConfig::default();
        assert_eq!(config.label(7), "class_7");
    }

    #[test]
    fn multi_word_labels_use_underscores() {
        let config = LabelConfig {
            id2label: BTreeMap::from([(0, "Very Safe".to_string())]),
        };
        assert_eq!(config.label(0), "very_safe");
    }
}
