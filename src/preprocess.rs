//! Bitmap to classifier input conversion.
//! Center crop the region a shortest-edge resize to `size / crop_pct` would
//! keep, resize it to `size x size`, normalise per channel and lay out as a
//! 1x3xHxW tensor.

use image::{DynamicImage, GenericImageView, imageops::FilterType};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AnalysisError;

/// NCHW float tensor, batch size 1.
pub type PixelBuffer = Array4<f32>;

/// Largest edge accepted before conversion; guards against absurd allocations.
const MAX_EDGE: u32 = 16_384;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSpec {
    pub size: u32,
    pub crop_pct: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for InputSpec {
    fn default() -> Self {
        // ImageNet statistics
        Self {
            size: 224,
            crop_pct: 0.875,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// Converts a decoded bitmap into the tensor layout the classifier expects.
pub fn to_pixel_buffer(img: &DynamicImage, spec: &InputSpec) -> Result<PixelBuffer, AnalysisError> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        warn!("Cannot convert empty image ({}x{})", w, h);
        return Err(AnalysisError::ImageConversionFailed);
    }
    if w > MAX_EDGE || h > MAX_EDGE {
        warn!("Image {}x{} exceeds the {} pixel edge limit", w, h, MAX_EDGE);
        return Err(AnalysisError::ImageConversionFailed);
    }

    let crop = spec.size;
    if crop == 0 {
        warn!("Input size must be greater than zero");
        return Err(AnalysisError::ImageConversionFailed);
    }

    // Cropping before resizing keeps the work at `crop x crop` whatever the
    // aspect ratio. The region matches a shortest-edge resize to
    // `crop / crop_pct` followed by a center crop.
    let resize_size = (crop as f64 / spec.crop_pct as f64).ceil();
    let short = w.min(h);
    let side = ((short as f64 * crop as f64 / resize_size).round() as u32).clamp(1, short);
    let region = img.crop_imm((w - side) / 2, (h - side) / 2, side, side);
    let rgb = region.resize_exact(crop, crop, FilterType::Triangle).to_rgb8();

    let hw = (crop * crop) as usize;
    let mut data = vec![0f32; 3 * hw];
    for (i, pixel) in rgb.as_raw().chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * hw + i] = (pixel[c] as f32 / 255.0 - spec.mean[c]) / spec.std[c];
        }
    }

    Array4::from_shape_vec((1, 3, crop as usize, crop as usize), data).map_err(|e| {
        warn!("Failed to build input tensor: {}", e);
        AnalysisError::ImageConversionFailed
    })
}
