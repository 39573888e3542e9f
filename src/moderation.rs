use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::ServiceConfig;
use crate::error::ModerationError;
use crate::fetcher::SafeFetcher;
use crate::metrics::MetricsRecorder;
use crate::policy::{self, ThresholdPreset};
use crate::validator::ImageValidator;

/// Where the image for a moderation request comes from.
#[derive(Debug)]
pub enum ImageSource {
    Upload {
        bytes: Bytes,
        filename: Option<String>,
    },
    Url(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ModerationRecord {
    pub nsfw: f32,
    pub normal: f32,
    pub is_nsfw: bool,
    pub confidence: f32,
    pub threshold_used: f32,
    pub threshold_preset: ThresholdPreset,
    pub processing_time_ms: f64,
    pub request_id: Uuid,
}

/// Runs images through fetch, validation, classification and the threshold
/// policy, recording one metrics sample per request.
pub struct Moderator {
    validator: ImageValidator,
    fetcher: SafeFetcher,
    classifier: Arc<dyn Classifier>,
    metrics: Arc<MetricsRecorder>,
    inference_timeout: Duration,
}

impl Moderator {
    pub fn new(
        config: &ServiceConfig,
        classifier: Arc<dyn Classifier>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, ModerationError> {
        let fetcher = SafeFetcher::new(config.fetch_timeout, config.max_image_bytes)
            .map_err(|e| ModerationError::Internal(format!("building HTTP client: {e}")))?;

        Ok(Self {
            validator: ImageValidator::new(config.max_image_bytes, config.max_image_dimension),
            fetcher,
            classifier,
            metrics,
            inference_timeout: config.inference_timeout,
        })
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    /// Opens a request scope: assigns the request id and starts the clock.
    pub fn begin(&self) -> ModerationRequest<'_> {
        ModerationRequest {
            moderator: self,
            id: Uuid::new_v4(),
            started: Instant::now(),
        }
    }

    pub async fn moderate(
        &self,
        source: ImageSource,
        threshold: &str,
    ) -> Result<ModerationRecord, ModerationError> {
        self.begin().run(source, threshold).await
    }

    async fn classify(
        &self,
        request_id: Uuid,
        image: image::DynamicImage,
    ) -> Result<policy::Predictions, ModerationError> {
        let classifier = self.classifier.clone();
        let task = tokio::task::spawn_blocking(move || classifier.classify(image));

        match tokio::time::timeout(self.inference_timeout, task).await {
            Ok(Ok(Ok(predictions))) => Ok(predictions),
            Ok(Ok(Err(e))) => Err(ModerationError::Internal(format!("classifier: {e}"))),
            Ok(Err(join)) => Err(ModerationError::Internal(format!("classifier task: {join}"))),
            Err(_) => {
                tracing::warn!(%request_id, timeout = ?self.inference_timeout, "inference timed out");
                Err(ModerationError::Internal("inference timed out".into()))
            }
        }
    }
}

/// One in-flight moderation request. Consuming it through either `run` or
/// `fail` records exactly one metrics sample.
pub struct ModerationRequest<'a> {
    moderator: &'a Moderator,
    id: Uuid,
    started: Instant,
}

impl ModerationRequest<'_> {
    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Ends the request with an error raised outside the pipeline, such as a
    /// malformed upload.
    pub fn fail(self, err: ModerationError) -> ModerationError {
        let elapsed_ms = self.elapsed_ms();
        self.moderator.metrics.record(elapsed_ms, true);

        match &err {
            ModerationError::Internal(_) | ModerationError::ClassifierUnavailable(_) => {
                tracing::error!(request_id = %self.id, error = %err, elapsed_ms, "moderation failed")
            }
            _ => tracing::info!(request_id = %self.id, error = %err, elapsed_ms, "request rejected"),
        }
        err
    }

    pub async fn run(
        self,
        source: ImageSource,
        threshold: &str,
    ) -> Result<ModerationRecord, ModerationError> {
        let outcome = self.pipeline(source, threshold).await;
        match outcome {
            Ok(mut record) => {
                record.processing_time_ms = self.elapsed_ms();
                self.moderator.metrics.record(record.processing_time_ms, false);
                tracing::info!(
                    request_id = %self.id,
                    elapsed_ms = format_args!("{:.2}", record.processing_time_ms),
                    is_nsfw = record.is_nsfw,
                    confidence = format_args!("{:.3}", record.confidence),
                    "inference completed"
                );
                Ok(record)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn pipeline(
        &self,
        source: ImageSource,
        threshold: &str,
    ) -> Result<ModerationRecord, ModerationError> {
        let preset: ThresholdPreset = threshold.parse()?;
        let moderator = self.moderator;

        let bytes = match source {
            ImageSource::Upload { bytes, filename } => {
                tracing::info!(
                    request_id = %self.id,
                    filename = filename.as_deref().unwrap_or("<unnamed>"),
                    size = bytes.len(),
                    threshold = %preset,
                    "processing uploaded image"
                );
                bytes
            }
            ImageSource::Url(url) => {
                tracing::info!(request_id = %self.id, %url, threshold = %preset, "downloading image");
                let bytes = moderator.fetcher.fetch(&url).await?;
                tracing::info!(request_id = %self.id, size = bytes.len(), "processing downloaded image");
                bytes
            }
        };

        let image = moderator.validator.validate(&bytes)?;
        drop(bytes);

        let predictions = moderator.classify(self.id, image).await?;
        let decision = policy::decide(&predictions, preset);

        Ok(ModerationRecord {
            nsfw: decision.nsfw,
            normal: decision.normal,
            is_nsfw: decision.is_nsfw,
            confidence: decision.confidence,
            threshold_used: decision.threshold_used,
            threshold_preset: preset,
            processing_time_ms: 0.0,
            request_id: self.id,
        })
    }
}
