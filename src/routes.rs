//! HTTP endpoints: moderation (`/moderate`, `/moderate-url`) plus the
//! liveness, status and metrics endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State, multipart::MultipartError},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{
    LOG_IMAGE_DATA, NSFW_CLASSES, RETAIN_PREDICTIONS, SERVICE_NAME, SERVICE_VERSION, STORE_IMAGES,
    ServiceConfig,
};
use crate::error::{LimitExceeded, ModerationError};
use crate::metrics::MetricsSummary;
use crate::moderation::{ImageSource, ModerationRecord, Moderator};
use crate::policy::ThresholdPreset;

/// Room for multipart boundaries and part headers on top of the image itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const PRIVACY_NOTICE: &str = "Images are processed in-memory only. No data is stored.";

#[derive(Clone)]
pub struct AppState {
    pub moderator: Arc<Moderator>,
    pub config: Arc<ServiceConfig>,
}

fn body_limit(config: &ServiceConfig) -> usize {
    config.max_image_bytes + MULTIPART_OVERHEAD
}

pub fn router(state: AppState) -> Router {
    let body_limit = body_limit(&state.config);

    Router::new()
        .route("/", get(root))
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/moderate", post(moderate_upload))
        .route("/moderate-url", post(moderate_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "privacy": PRIVACY_NOTICE,
    }))
}

async fn ping() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        "service": SERVICE_NAME,
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    let presets = ThresholdPreset::ALL;

    let values: serde_json::Map<String, Value> = presets
        .iter()
        .map(|p| (p.as_str().to_string(), json!(p.threshold())))
        .collect();
    let descriptions: serde_json::Map<String, Value> = presets
        .iter()
        .map(|p| (p.as_str().to_string(), json!(p.description())))
        .collect();

    Json(json!({
        "status": "ok",
        "model": {
            "name": config.model_name,
            "type": "binary_classification",
            "classes": NSFW_CLASSES,
            "device": state.moderator.classifier().device(),
            "processor": state.moderator.classifier().processor(),
        },
        "version": SERVICE_VERSION,
        "privacy": {
            "store_images": STORE_IMAGES,
            "log_image_data": LOG_IMAGE_DATA,
            "retain_predictions": RETAIN_PREDICTIONS,
            "retention_seconds": 0,
        },
        "thresholds": {
            "available": ThresholdPreset::names(),
            "values": values,
            "default": ThresholdPreset::default(),
            "description": descriptions,
        },
        "limits": {
            "max_image_size_mb": config.max_image_size_mb(),
            "max_dimensions": config.max_image_dimension,
            "download_timeout_seconds": config.fetch_timeout.as_secs(),
        },
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSummary> {
    Json(state.moderator.metrics().summary())
}

#[derive(Debug, Deserialize)]
struct ThresholdQuery {
    threshold: Option<String>,
}

/// `POST /moderate`: multipart upload in an `image` (or `file`) field.
async fn moderate_upload(
    State(state): State<AppState>,
    Query(query): Query<ThresholdQuery>,
    mut multipart: Multipart,
) -> Result<Json<ModerationRecord>, ModerationError> {
    let request = state.moderator.begin();
    let threshold = query
        .threshold
        .unwrap_or_else(|| ThresholdPreset::default().to_string());

    // Reject a bad preset before touching the body.
    if let Err(err) = threshold.parse::<ThresholdPreset>() {
        return Err(request.fail(err));
    }

    let source = match read_upload(&mut multipart, body_limit(&state.config)).await {
        Ok(source) => source,
        Err(err) => return Err(request.fail(err)),
    };

    request.run(source, &threshold).await.map(Json)
}

async fn read_upload(
    multipart: &mut Multipart,
    limit: usize,
) -> Result<ImageSource, ModerationError> {
    let multipart_error = |err: MultipartError| {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ModerationError::TooLarge(LimitExceeded::Upload { max: limit })
        } else {
            ModerationError::InvalidImage(err.body_text())
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if !matches!(field.name(), Some("image" | "file")) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(ImageSource::Upload { bytes, filename });
    }

    Err(ModerationError::InvalidImage(
        "missing multipart field \"image\"".into(),
    ))
}

#[derive(Debug, Deserialize)]
struct ModerateUrlRequest {
    image_url: String,
    #[serde(default)]
    threshold: Option<String>,
}

/// `POST /moderate-url`: JSON `{image_url, threshold}`.
async fn moderate_url(
    State(state): State<AppState>,
    Json(body): Json<ModerateUrlRequest>,
) -> Result<Json<ModerationRecord>, ModerationError> {
    let threshold = body
        .threshold
        .unwrap_or_else(|| ThresholdPreset::default().to_string());

    state
        .moderator
        .moderate(ImageSource::Url(body.image_url), &threshold)
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRecorder;
    use crate::moderation::tests::FixedClassifier;
    use crate::validator::tests::encode;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use image::ImageFormat;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-MODERATION-TEST-BOUNDARY";

    fn app(classifier: Arc<FixedClassifier>, config: ServiceConfig) -> (Router, Arc<Moderator>) {
        let moderator = Arc::new(
            Moderator::new(&config, classifier, Arc::new(MetricsRecorder::new())).unwrap(),
        );
        let state = AppState {
            moderator: moderator.clone(),
            config: Arc::new(config),
        };
        (router(state), moderator)
    }

    fn multipart_request(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"cat.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_is_moderated() {
        let classifier = FixedClassifier::new(&[("nsfw", 0.87), ("normal", 0.13)]);
        let (app, _) = app(classifier.clone(), ServiceConfig::default());

        let png = encode(16, 16, ImageFormat::Png);
        let response = app
            .oneshot(multipart_request("/moderate?threshold=strict", "image", &png))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["is_nsfw"], true);
        assert_eq!(body["threshold_preset"], "strict");
        assert!(body["request_id"].as_str().is_some());
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn oversize_upload_is_413_without_inference() {
        let classifier = FixedClassifier::new(&[("nsfw", 0.5)]);
        let config = ServiceConfig {
            max_image_bytes: 1024,
            ..ServiceConfig::default()
        };
        let (app, moderator) = app(classifier.clone(), config);

        let response = app
            .oneshot(multipart_request("/moderate", "image", &vec![1u8; 4096]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(classifier.calls(), 0);
        let summary = moderator.metrics().summary();
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.total_requests, 1);
    }

    #[tokio::test]
    async fn unknown_threshold_is_rejected_before_reading_body() {
        let classifier = FixedClassifier::new(&[("nsfw", 0.5)]);
        let (app, moderator) = app(classifier.clone(), ServiceConfig::default());

        // The body is not even valid multipart; only the threshold is looked at.
        let request = Request::builder()
            .method("POST")
            .uri("/moderate?threshold=ultra")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from("garbage"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["detail"].as_str().unwrap().contains("ultra"));
        assert_eq!(classifier.calls(), 0);
        assert_eq!(moderator.metrics().summary().error_count, 1);
    }

    #[tokio::test]
    async fn missing_image_field_is_bad_request() {
        let (app, _) = app(FixedClassifier::new(&[]), ServiceConfig::default());

        let response = app
            .oneshot(multipart_request("/moderate", "document", b"hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn private_url_is_rejected() {
        let classifier = FixedClassifier::new(&[("nsfw", 0.5)]);
        let (app, _) = app(classifier.clone(), ServiceConfig::default());

        let request = Request::builder()
            .method("POST")
            .uri("/moderate-url")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "image_url": "http://192.168.0.10/cat.png" }).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn status_reports_presets_and_limits() {
        let (app, _) = app(FixedClassifier::new(&[]), ServiceConfig::default());

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["thresholds"]["default"], "balanced");
        assert_eq!(body["thresholds"]["values"]["strict"].as_f64().unwrap() as f32, 0.3);
        assert_eq!(body["model"]["classes"], json!(["normal", "nsfw"]));
        assert_eq!(body["model"]["device"], "cpu");
        assert_eq!(body["model"]["processor"], "FixedImageProcessor");
        assert_eq!(body["limits"]["max_dimensions"], 4096);
        assert_eq!(body["privacy"]["store_images"], false);
    }

    #[tokio::test]
    async fn ping_and_metrics_respond() {
        let (app, _) = app(FixedClassifier::new(&[]), ServiceConfig::default());

        let ping = app
            .clone()
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ping.status(), StatusCode::OK);
        assert!(json_body(ping).await["timestamp"].as_str().unwrap().ends_with('Z'));

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(metrics).await;
        assert_eq!(body["total_requests"], 0);
        assert_eq!(body["error_rate"], 0.0);
    }
}
