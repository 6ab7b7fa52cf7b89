//! Codec primitives: base64, binary tagging, bitmap decode, scaling, encode.
//!
//! Pixel work runs on the blocking pool so a worker can keep other requests
//! moving while one image is being decoded or encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cell_transcode_proto::{BinaryObject, DEFAULT_CONTENT_TYPE, OutputFormat, Source};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, imageops::FilterType};
use tracing::debug;

use crate::error::TranscodeError;
use crate::fetch::Fetcher;

/// Decode base64 text into bytes.
///
/// A data-URI header (everything up to and including the first comma) is
/// stripped first. The remainder must be strict standard base64: embedded
/// whitespace or line breaks and missing `=` padding are decode errors.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, TranscodeError> {
    let body = match text.split_once(',') {
        Some((_header, body)) => body,
        None => text,
    };
    STANDARD
        .decode(body)
        .map_err(|e| TranscodeError::Decode(format!("invalid base64: {e}")))
}

/// Wrap bytes as a binary object, defaulting the content type to PNG.
pub fn tag_binary(bytes: Vec<u8>, content_type: Option<&str>) -> BinaryObject {
    let content_type = content_type
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    BinaryObject::new(content_type, bytes)
}

/// A decoded pixel raster
#[derive(Debug, Clone)]
pub struct Bitmap {
    image: DynamicImage,
}

impl Bitmap {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }
}

/// Obtain the bytes of `source` and decode them into a bitmap.
///
/// The image format is sniffed from the bytes; a binary object's declared
/// content type is not trusted.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn decode_bitmap(source: Source, fetcher: &Fetcher) -> Result<Bitmap, TranscodeError> {
    let bytes = fetcher.resolve(source).await?;
    if bytes.is_empty() {
        return Err(TranscodeError::Decode("image data is empty".to_string()));
    }
    let len = bytes.len();

    let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| TranscodeError::Decode(format!("decoder task failed: {e}")))?
        .map_err(|e| TranscodeError::Decode(format!("unreadable image: {e}")))?;

    debug!(len, width = image.width(), height = image.height(), "decoded bitmap");
    Ok(Bitmap::new(image))
}

/// Fit `(width, height)` under `(max_width, max_height)`.
///
/// Width is clamped first; the height clamp then applies to the already
/// adjusted height. A source that exceeds both bounds can therefore end up
/// strictly under one of them.
pub fn scale_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let (mut w, mut h) = (f64::from(width), f64::from(height));
    let (max_w, max_h) = (f64::from(max_width), f64::from(max_height));

    if w > max_w {
        h = (h * max_w / w).round();
        w = max_w;
    }
    if h > max_h {
        w = (w * max_h / h).round();
        h = max_h;
    }

    (w as u32, h as u32)
}

/// Size and encoding of the raster to produce
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeTarget {
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    /// In `[0.1, 1.0]`
    pub quality: f32,
}

/// Render `bitmap` onto a surface of the target size and encode it.
#[tracing::instrument(level = "debug", skip(bitmap), fields(src_width = bitmap.width(), src_height = bitmap.height()))]
pub async fn encode_bitmap(
    bitmap: Bitmap,
    target: EncodeTarget,
    max_surface_pixels: u64,
) -> Result<BinaryObject, TranscodeError> {
    acquire_surface(target.width, target.height, max_surface_pixels)?;

    let bytes = tokio::task::spawn_blocking(move || render_and_encode(bitmap, target))
        .await
        .map_err(|e| TranscodeError::Encode(format!("encoder task failed: {e}")))??;

    debug!(len = bytes.len(), format = %target.format, "encoded bitmap");
    Ok(BinaryObject::new(target.format.mime(), bytes))
}

fn acquire_surface(width: u32, height: u32, max_pixels: u64) -> Result<(), TranscodeError> {
    if width == 0 || height == 0 {
        return Err(TranscodeError::Surface(format!(
            "cannot allocate a {width}x{height} surface"
        )));
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels > max_pixels {
        return Err(TranscodeError::Surface(format!(
            "{width}x{height} surface exceeds the {max_pixels} pixel limit"
        )));
    }
    Ok(())
}

fn render_and_encode(bitmap: Bitmap, target: EncodeTarget) -> Result<Vec<u8>, TranscodeError> {
    let image = bitmap.into_image();
    let image = if (image.width(), image.height()) == (target.width, target.height) {
        image
    } else {
        image.resize_exact(target.width, target.height, FilterType::Lanczos3)
    };

    let mut out = Vec::new();
    match target.format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = image.to_rgb8();
            let quality = (target.quality * 100.0).round().clamp(1.0, 100.0) as u8;
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
                .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
                .map_err(|e| TranscodeError::Encode(format!("jpeg: {e}")))?;
        }
        OutputFormat::Png => {
            let rgba = image.to_rgba8();
            image::codecs::png::PngEncoder::new(&mut out)
                .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
                .map_err(|e| TranscodeError::Encode(format!("png: {e}")))?;
        }
        OutputFormat::WebP => {
            let rgba = image.to_rgba8();
            let encoded = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
                .encode_simple(false, target.quality * 100.0)
                .map_err(|e| TranscodeError::Encode(format!("webp: {e:?}")))?;
            out.extend_from_slice(&encoded);
        }
    }
    Ok(out)
}
