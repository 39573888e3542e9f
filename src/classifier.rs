use image::DynamicImage;

use crate::nsfw_model::ModelError;
use crate::policy::Predictions;

/// Pluggable image classifier backing the moderation pipeline.
///
/// Implementations are shared across concurrent requests, so `classify`
/// must be safe to call from several blocking threads at once.
pub trait Classifier: Send + Sync {
    /// Maps class label to probability for one image.
    fn classify(&self, image: DynamicImage) -> Result<Predictions, ModelError>;

    /// Where inference runs, e.g. "cpu".
    fn device(&self) -> &str {
        "cpu"
    }

    /// Preprocessing pipeline the model was exported with, if known.
    fn processor(&self) -> Option<&str> {
        None
    }
}
