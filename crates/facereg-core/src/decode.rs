//! Image decode primitive: raw upload bytes to an RGB pixel buffer.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image is empty")]
    Empty,
    #[error("malformed image: {0}")]
    Malformed(#[from] image::ImageError),
}

/// Decode an encoded image (PNG, JPEG, ...) into 8-bit RGB.
///
/// The format is guessed from the leading bytes.
pub fn decode_rgb(raw: &[u8]) -> Result<RgbImage, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    let img = image::load_from_memory(raw)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(DecodeError::Empty);
    }
    Ok(img.to_rgb8())
}
