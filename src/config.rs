use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const SERVICE_NAME: &str = "NSFW Detection API";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Class labels the moderation decision is expressed in.
pub const NSFW_CLASSES: [&str; 2] = ["normal", "nsfw"];

pub const ALLOWED_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
];

// Images and predictions only ever live for one request.
pub const STORE_IMAGES: bool = false;
pub const LOG_IMAGE_DATA: bool = false;
pub const RETAIN_PREDICTIONS: bool = false;

const MB: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub model_dir: PathBuf,
    pub model_name: String,
    pub max_image_bytes: usize,
    pub max_image_dimension: u32,
    pub fetch_timeout: Duration,
    pub inference_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            model_dir: PathBuf::from("model"),
            model_name: "Falconsai/nsfw_image_detection".to_string(),
            max_image_bytes: 10 * MB,
            max_image_dimension: 4096,
            fetch_timeout: Duration::from_secs(10),
            inference_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            bind_addr: parse_var("BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            model_dir: env::var("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            model_name: env::var("MODEL_NAME").unwrap_or(defaults.model_name),
            max_image_bytes: parse_var::<usize>("MAX_IMAGE_SIZE_MB")?
                .map(|mb| mb * MB)
                .unwrap_or(defaults.max_image_bytes),
            max_image_dimension: parse_var("MAX_IMAGE_DIMENSION")?
                .unwrap_or(defaults.max_image_dimension),
            fetch_timeout: parse_var("IMAGE_DOWNLOAD_TIMEOUT_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            inference_timeout: parse_var("INFERENCE_TIMEOUT_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.inference_timeout),
        })
    }

    pub fn max_image_size_mb(&self) -> f64 {
        self.max_image_bytes as f64 / MB as f64
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}
