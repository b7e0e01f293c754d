use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder as ImageCrateJpeg;
use image::ExtendedColorType;

/// Trait for JPEG encoding backends
pub trait JpegEncoder: Send + Sync {
    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>>;
    fn name(&self) -> &str;
}

/// Baseline JPEG via the `image` crate (default, pure Rust, deterministic)
pub struct ImageJpegEncoder;

impl JpegEncoder for ImageJpegEncoder {
    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            anyhow::bail!(
                "rgb buffer is {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            );
        }
        let mut out = Vec::with_capacity(pixels.len() / 8);
        ImageCrateJpeg::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(pixels, width, height, ExtendedColorType::Rgb8)
            .with_context(|| format!("jpeg encode {}x{} q{}", width, height, quality))?;
        Ok(out)
    }

    fn name(&self) -> &str {
        "image"
    }
}

/// Create an encoder by name
pub fn create_encoder(name: &str) -> Result<Box<dyn JpegEncoder>> {
    match name {
        "image" => Ok(Box::new(ImageJpegEncoder)),
        other => anyhow::bail!("unknown encoder: '{}'. Available: image", other),
    }
}
