//! Grayscale template matching against a reference image.
//!
//! Both images are reduced to luma with `Y = 0.299 R + 0.587 G + 0.114 B`
//! and compared by mean squared error; the score is `1 − MSE / 255²`, so
//! identical images score `1.0` and black against white scores `0.0`.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, ensure};
use image::RgbImage;
use image::imageops::FilterType;
use serde::Serialize;

use super::FrameProcessor;
use crate::core::{FrameBuffer, SharedFrame};
use crate::error::{CaptureError, CaptureResult};

/// Result of comparing one frame with the reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchReport {
    pub similarity: f64,
    pub matched: bool,
}

/// Luma of an sRGB pixel, in `[0, 255]`.
#[inline]
fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn frame_luma(frame: &FrameBuffer) -> Vec<f32> {
    let format = frame.format();
    let bpp = format.bytes_per_pixel();
    let mut out = Vec::with_capacity(frame.width() as usize * frame.height() as usize);
    for y in 0..frame.height() {
        for px in frame.row(y).chunks_exact(bpp) {
            let (r, g, b) = format.rgb(px);
            out.push(luma(r, g, b));
        }
    }
    out
}

fn image_luma(image: &RgbImage) -> Vec<f32> {
    image.pixels().map(|p| luma(p[0], p[1], p[2])).collect()
}

/// `1 − MSE / 255²` over two equally sized luma planes.
pub fn similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum();
    let mse = sum / a.len() as f64;
    (1.0 - mse / (255.0 * 255.0)).clamp(0.0, 1.0)
}

/// A reentrant [`FrameProcessor`] scoring frames against a reference image.
///
/// The reference is resampled to the frame size on first sight of a size and
/// cached; frames of the usual fixed region size hit the cache every time.
pub struct TemplateMatcher {
    reference: RgbImage,
    threshold: f64,
    scaled: Mutex<Option<((u32, u32), Arc<Vec<f32>>)>>,
}

impl std::fmt::Debug for TemplateMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateMatcher")
            .field("reference", &self.reference.dimensions())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl TemplateMatcher {
    pub fn new(reference: RgbImage, threshold: f64) -> CaptureResult<Self> {
        if reference.width() == 0 || reference.height() == 0 {
            return Err(CaptureError::validation(
                "reference",
                "non-empty image",
                format!("{}x{}", reference.width(), reference.height()),
            ));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CaptureError::validation(
                "threshold",
                "between 0 and 1",
                threshold.to_string(),
            ));
        }
        Ok(Self {
            reference,
            threshold,
            scaled: Mutex::new(None),
        })
    }

    pub fn from_path(path: impl AsRef<Path>, threshold: f64) -> CaptureResult<Self> {
        let path = path.as_ref();
        let reference = image::open(path)
            .map_err(|e| {
                CaptureError::image("load reference", e)
                    .with_context(path.display().to_string())
                    .with_recovery_suggestion("check the reference image path")
            })?
            .to_rgb8();
        Self::new(reference, threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn reference_luma(&self, width: u32, height: u32) -> Arc<Vec<f32>> {
        let mut cache = self.scaled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((size, luma)) = cache.as_ref() {
            if *size == (width, height) {
                return Arc::clone(luma);
            }
        }
        let luma = if self.reference.dimensions() == (width, height) {
            image_luma(&self.reference)
        } else {
            let resized =
                image::imageops::resize(&self.reference, width, height, FilterType::Triangle);
            image_luma(&resized)
        };
        let luma = Arc::new(luma);
        *cache = Some(((width, height), Arc::clone(&luma)));
        luma
    }

    /// Score a single frame.
    pub fn compare(&self, frame: &FrameBuffer) -> Result<MatchReport> {
        ensure!(
            frame.width() > 0 && frame.height() > 0,
            "cannot match an empty frame"
        );
        let reference = self.reference_luma(frame.width(), frame.height());
        let similarity = similarity(&frame_luma(frame), &reference);
        Ok(MatchReport {
            similarity,
            matched: similarity >= self.threshold,
        })
    }
}

impl FrameProcessor for TemplateMatcher {
    type Output = MatchReport;

    fn process(&self, frame: SharedFrame) -> Result<MatchReport> {
        self.compare(&frame)
    }

    fn is_reentrant(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "template-matcher"
    }
}
