use crate::classifier::Classifier;
use crate::model_config::{LabelConfig, PreprocessorConfig};
use crate::policy::Predictions;
use image::{DynamicImage, Pixel, RgbImage};
use ndarray::{Array, IxDyn};
use ort::inputs;

use ort::error::Error as OrtError;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Output, Session, SessionOutputs};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] OrtError),
    #[error("Image processing error: {0}")]
    ImageProcessing(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Model output format unexpected")]
    OutputFormatUnexpected,
    #[error("Invalid path for model files: {0}")]
    InvalidPath(String),
    #[error("Failed to convert model output")]
    OutputConversion,
}

/// ONNX export of an image-classification transformer (Falconsai by default).
pub struct NsfwModel {
    session: Session,
    preprocessor_config: PreprocessorConfig,
    labels: LabelConfig,
}

impl NsfwModel {
    pub fn new(model_dir: &Path) -> Result<Self, ModelError> {
        let model_path = model_dir.join("model.onnx");
        let preprocessor_config_path = model_dir.join("preprocessor_config.json");
        let label_config_path = model_dir.join("config.json");

        for required in [&model_path, &preprocessor_config_path] {
            if !required.exists() {
                return Err(ModelError::InvalidPath(format!(
                    "Model file not found: {:?}",
                    required
                )));
            }
        }

        let preprocessor_config_file = std::fs::File::open(&preprocessor_config_path)?;
        let preprocessor_config: PreprocessorConfig =
            serde_json::from_reader(preprocessor_config_file)?;

        let labels = if label_config_path.exists() {
            serde_json::from_reader(std::fs::File::open(&label_config_path)?)?
        } else {
            tracing::warn!(path = ?label_config_path, "no label config, assuming 0=normal 1=nsfw");
            LabelConfig::default()
        };

        tracing::info!(
            model = ?model_path,
            processor = %preprocessor_config.image_processor_type,
            width = preprocessor_config.size.width,
            height = preprocessor_config.size.height,
            labels = ?labels.id2label,
            "loading ONNX model"
        );

        let session = SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_cpus::get())?
            .commit_from_file(&model_path)?;

        tracing::info!("ONNX Runtime session created");

        Ok(Self {
            session,
            preprocessor_config,
            labels,
        })
    }

    fn preprocess(&self, image: DynamicImage) -> Array<f32, IxDyn> {
        let config = &self.preprocessor_config;
        let target_height = config.size.height;
        let target_width = config.size.width;

        let resized_image = image.resize_exact(
            target_width as u32,
            target_height as u32,
            image::imageops::FilterType::Triangle,
        );
        let rgb_image: RgbImage = resized_image.to_rgb8();

        // NCHW: [1, 3, height, width]
        let mut array = Array::zeros((1, 3, target_height, target_width));

        for (x, y, pixel) in rgb_image.enumerate_pixels() {
            let rgb = pixel.to_rgb();

            for c in 0..3 {
                let mut pixel_value = rgb[c] as f32;

                if config.do_rescale {
                    pixel_value *= config.rescale_factor;
                } else {
                    pixel_value /= 255.0;
                }

                if config.do_normalize {
                    pixel_value = (pixel_value - config.image_mean[c]) / config.image_std[c];
                }

                array[[0, c, y as usize, x as usize]] = pixel_value;
            }
        }

        array.into_dyn()
    }

    pub fn predict(&self, image: DynamicImage) -> Result<Vec<f32>, ModelError> {
        let processed_tensor = self.preprocess(image);

        let inputs = inputs!["pixel_values" => processed_tensor.view()]?;
        let outputs: SessionOutputs = self.session.run(inputs)?;

        let output_name = logits_output(&self.session.outputs)?;
        let output_value = outputs
            .get(output_name)
            .ok_or(ModelError::OutputFormatUnexpected)?;

        // Logits shaped [1, num_classes].
        let logits_view = output_value.try_extract_tensor::<f32>()?;
        let logits_slice = logits_view.as_slice().ok_or(ModelError::OutputConversion)?;

        Ok(softmax(logits_slice))
    }
}

/// Name of the logits output; exported classifiers declare it first.
fn logits_output(outputs: &[Output]) -> Result<&str, ModelError> {
    outputs
        .first()
        .map(|output| output.name.as_str())
        .ok_or(ModelError::OutputFormatUnexpected)
}

impl Classifier for NsfwModel {
    fn classify(&self, image: DynamicImage) -> Result<Predictions, ModelError> {
        let probabilities = self.predict(image)?;
        Ok(label_probabilities(&self.labels, &probabilities))
    }

    fn processor(&self) -> Option<&str> {
        Some(&self.preprocessor_config.image_processor_type)
    }
}

fn label_probabilities(labels: &LabelConfig, probabilities: &[f32]) -> Predictions {
    probabilities
        .iter()
        .enumerate()
        .map(|(idx, &prob)| (labels.label(idx), prob))
        .collect()
}

fn softmax(data: &[f32]) -> Vec<f32> {
    let max_val = data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = data.iter().map(|&x| (x - max_val).exp()).collect();
    let sum_exps: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum_exps).collect()
}
