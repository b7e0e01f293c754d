pub mod face;
pub mod jpeg;
pub mod levels;
pub mod pyramid;

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Resampling filter for downscaling faces to a level size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleFilter {
    Bilinear,
    Bicubic,
    #[default]
    Lanczos3,
}

impl ResampleFilter {
    fn to_fir_alg(self) -> fast_image_resize::ResizeAlg {
        use fast_image_resize::{FilterType, ResizeAlg};
        match self {
            ResampleFilter::Bilinear => ResizeAlg::Convolution(FilterType::Bilinear),
            ResampleFilter::Bicubic => ResizeAlg::Convolution(FilterType::CatmullRom),
            ResampleFilter::Lanczos3 => ResizeAlg::Convolution(FilterType::Lanczos3),
        }
    }
}

impl fmt::Display for ResampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleFilter::Bilinear => write!(f, "bilinear"),
            ResampleFilter::Bicubic => write!(f, "bicubic"),
            ResampleFilter::Lanczos3 => write!(f, "lanczos3"),
        }
    }
}

impl FromStr for ResampleFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bilinear" | "triangle" => Ok(ResampleFilter::Bilinear),
            "bicubic" | "catmullrom" | "catmull-rom" => Ok(ResampleFilter::Bicubic),
            "lanczos3" | "lanczos" => Ok(ResampleFilter::Lanczos3),
            _ => Err(format!("unknown resample filter '{}'. Available: bilinear, bicubic, lanczos3", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// SIMD-accelerated resize (via fast_image_resize)
// ---------------------------------------------------------------------------

/// Resize a square RGB face to `size x size`.
///
/// A face already at the target size is returned as a copy, so the finest
/// level is cut from the original pixels.
pub fn resize_face(face: &RgbImage, size: u32, filter: ResampleFilter) -> Result<RgbImage> {
    use fast_image_resize as fir;

    let (src_w, src_h) = face.dimensions();
    if src_w == size && src_h == size {
        return Ok(face.clone());
    }

    let src = fir::images::Image::from_vec_u8(
        src_w,
        src_h,
        face.as_raw().clone(),
        fir::pixels::PixelType::U8x3,
    )
    .map_err(|e| anyhow!("resize source {}x{}: {}", src_w, src_h, e))?;
    let mut dst = fir::images::Image::new(size, size, fir::pixels::PixelType::U8x3);
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src, &mut dst, &fir::ResizeOptions::new().resize_alg(filter.to_fir_alg()))
        .map_err(|e| anyhow!("resize {}x{} -> {}x{}: {}", src_w, src_h, size, size, e))?;

    RgbImage::from_raw(size, size, dst.into_vec())
        .ok_or_else(|| anyhow!("resized buffer does not match {}x{}", size, size))
}
