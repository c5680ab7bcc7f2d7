use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use std::path::Path;

use crate::error::{GatewayError, Result};

pub const ALLOWED_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];

const HIGH_QUALITY: u8 = 92;
const LOW_QUALITY: u8 = 88;

// Result of normalizing an upload: JPEG bytes plus the before/after dimensions.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub jpeg: Vec<u8>,
    pub original: (u32, u32),
    pub output: (u32, u32),
}

// Turns an uploaded image into a bounded-size JPEG for the vision model.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    pub max_file_size: usize,
    pub max_edge: u32,
    // Sources whose longer edge is below this get the higher JPEG quality.
    pub quality_threshold: u32,
}

impl ImageNormalizer {
    // Validates, orients, downsamples and re-encodes `bytes`.
    //
    // Cheap checks (size, extension) run before any decoding. Images already within
    // `max_edge` keep their dimensions; larger ones are scaled so the longer edge equals
    // `max_edge`, preserving aspect ratio.
    pub fn normalize(&self, file_name: &str, bytes: &[u8]) -> Result<NormalizedImage> {
        if bytes.len() > self.max_file_size {
            return Err(GatewayError::ImageTooLarge {
                size: bytes.len(),
                max: self.max_file_size,
            });
        }
        check_extension(file_name)?;

        let image = decode_oriented(bytes)?;
        let original = (image.width(), image.height());
        let (width, height) = fit_within(original.0, original.1, self.max_edge);

        let image = if (width, height) == original {
            image
        } else {
            image.resize_exact(width, height, FilterType::Lanczos3)
        };

        let quality = if original.0.max(original.1) < self.quality_threshold {
            HIGH_QUALITY
        } else {
            LOW_QUALITY
        };
        let jpeg = encode_jpeg(&image, quality)?;

        if (width, height) != original {
            tracing::info!(
                "image resized: {}x{} -> {}x{} ({} bytes)",
                original.0,
                original.1,
                width,
                height,
                jpeg.len()
            );
        }

        Ok(NormalizedImage {
            jpeg,
            original,
            output: (width, height),
        })
    }
}

fn check_extension(file_name: &str) -> Result<()> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(GatewayError::UnsupportedFormat { extension })
    }
}

// Decode by content sniffing, then apply the EXIF orientation if the format carries one
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage> {
    let invalid = |e: image::ImageError| GatewayError::InvalidImage(e.to_string());

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| GatewayError::InvalidImage(e.to_string()))?;
    let mut decoder = reader.into_decoder().map_err(invalid)?;
    let orientation = decoder.orientation().map_err(invalid)?;

    let mut image = DynamicImage::from_decoder(decoder).map_err(invalid)?;
    image.apply_orientation(orientation);
    Ok(image)
}

// Target dimensions whose longer edge is at most `max_edge`.
pub fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width <= max_edge && height <= max_edge {
        return (width, height);
    }

    let scale = |short: u32, long: u32| {
        let (short, long, max_edge) = (u64::from(short), u64::from(long), u64::from(max_edge));
        let scaled = (short * max_edge + long / 2) / long;
        (scaled as u32).max(1)
    };

    if width >= height {
        (max_edge, scale(height, width))
    } else {
        (scale(width, height), max_edge)
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    // JPEG has no alpha channel; palette/gray/16-bit sources all go through RGB8
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|e| GatewayError::InvalidImage(format!("jpeg encoding failed: {e}")))?;
    Ok(out)
}
