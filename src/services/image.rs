//! Reference image intake: download, format check, orientation.

use image::ImageReader;
use reqwest::Client;
use std::io::Cursor;

use crate::models::job::Orientation;

/// Upper bound on a reference image download.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to download reference image: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Reference image download returned HTTP {0}")]
    Status(u16),

    #[error("Reference image is larger than {MAX_IMAGE_BYTES} bytes")]
    TooLarge,

    #[error("Unsupported reference image: {0}")]
    Unsupported(String),
}

/// Fetch a reference image and make sure it decodes as a supported format.
pub async fn fetch_reference_image(http: &Client, url: &str) -> Result<Vec<u8>, ImageError> {
    fetch_capped(http, url, MAX_IMAGE_BYTES).await
}

/// Download at most `limit` bytes; a larger body is abandoned mid-stream.
async fn fetch_capped(http: &Client, url: &str, limit: usize) -> Result<Vec<u8>, ImageError> {
    let mut response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ImageError::Status(response.status().as_u16()));
    }
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(ImageError::TooLarge);
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if bytes.len() + chunk.len() > limit {
            return Err(ImageError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    image::guess_format(&bytes).map_err(|e| ImageError::Unsupported(e.to_string()))?;
    Ok(bytes)
}

/// Landscape when wider than tall, portrait otherwise. Only the header is read.
pub fn orientation_of(image: &[u8]) -> Result<Orientation, ImageError> {
    let (width, height) = ImageReader::new(Cursor::new(image))
        .with_guessed_format()
        .map_err(|e| ImageError::Unsupported(e.to_string()))?
        .into_dimensions()
        .map_err(|e| ImageError::Unsupported(e.to_string()))?;

    Ok(if width > height {
        Orientation::Landscape
    } else {
        Orientation::Portrait
    })
}
