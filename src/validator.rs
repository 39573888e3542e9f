use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::{LimitExceeded, ModerationError};

const SUPPORTED_FORMATS: [ImageFormat; 5] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

/// Gatekeeper between raw request bytes and the classifier.
#[derive(Debug, Clone)]
pub struct ImageValidator {
    max_bytes: usize,
    max_dimension: u32,
}

impl ImageValidator {
    pub fn new(max_bytes: usize, max_dimension: u32) -> Self {
        Self {
            max_bytes,
            max_dimension,
        }
    }

    /// Checks the byte size, then the format and header dimensions, and only
    /// then decodes pixels. The decoded image is returned so it is decoded once.
    pub fn validate(&self, bytes: &[u8]) -> Result<DynamicImage, ModerationError> {
        if bytes.len() > self.max_bytes {
            return Err(LimitExceeded::Bytes {
                size: bytes.len(),
                max: self.max_bytes,
            }
            .into());
        }

        let format = reader(bytes)?
            .format()
            .filter(|format| SUPPORTED_FORMATS.contains(format))
            .ok_or_else(|| ModerationError::InvalidImage("unsupported or unknown format".into()))?;

        let (width, height) = reader(bytes)?
            .into_dimensions()
            .map_err(|e| ModerationError::InvalidImage(e.to_string()))?;
        if width > self.max_dimension || height > self.max_dimension {
            return Err(LimitExceeded::Dimensions {
                width,
                height,
                max: self.max_dimension,
            }
            .into());
        }

        let mut decoder = ImageReader::new(Cursor::new(bytes));
        decoder.set_format(format);
        decoder
            .decode()
            .map_err(|e| ModerationError::InvalidImage(e.to_string()))
    }
}

fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, ModerationError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ModerationError::InvalidImage(e.to_string()))
}
