//! # Frame Buffers
//!
//! [`FrameBuffer`] is the unit of data passed between capture, processing and
//! presentation. Its shape (width, height, pixel format, stride) is fixed
//! when it is allocated and its byte region never changes length; a reshape
//! means a different buffer.
//!
//! ## Memory Layout
//!
//! ```text
//!  ◀──────────── stride (bytes) ────────────▶
//!  ◀──── width × bytes_per_pixel ────▶
//! ┌───────────────────────────────────┬──────┐
//! │ row 0 pixels                      │ pad  │
//! ├───────────────────────────────────┼──────┤
//! │ row 1 pixels                      │ pad  │
//! │ ...                               │      │
//! └───────────────────────────────────┴──────┘
//!                 height rows
//! ```
//!
//! Buffers handed out by a [`BufferPool`](super::buffer_pool::BufferPool)
//! return to it when dropped. Reused buffers are **not** zeroed: a processor
//! must not assume anything about bytes it did not see written.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::buffer_pool::PoolShared;
use crate::error::{CaptureError, CaptureResult};

/// A frame shared read-only with processors and sinks.
///
/// Holding a clone of the `Arc` past `process` is how a processor keeps
/// extended ownership of a frame.
pub type SharedFrame = Arc<FrameBuffer>;

/// Pixel layouts a backend can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }

    /// Read one pixel as `(r, g, b)` from its raw bytes.
    #[inline]
    pub fn rgb(self, px: &[u8]) -> (u8, u8, u8) {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => (px[0], px[1], px[2]),
            PixelFormat::Bgr8 | PixelFormat::Bgra8 => (px[2], px[1], px[0]),
            PixelFormat::Gray8 => (px[0], px[0], px[0]),
        }
    }
}

/// A rectangle relative to a display target's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The full area of a `width × height` surface.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `self` lies entirely within a `width × height` surface.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        (self.x as u64 + self.width as u64) <= width as u64
            && (self.y as u64 + self.height as u64) <= height as u64
    }
}

/// The immutable geometry of a frame buffer. Also the pool's free-list key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
}

impl FrameShape {
    /// Tightly packed rows, padded up to `row_alignment` bytes.
    pub fn aligned(width: u32, height: u32, format: PixelFormat, row_alignment: usize) -> Self {
        let row = width as usize * format.bytes_per_pixel();
        let align = row_alignment.max(1);
        let stride = row.div_ceil(align) * align;
        Self {
            width,
            height,
            format,
            stride,
        }
    }

    /// A shape with an explicit stride, rejected when the stride cannot hold a row.
    pub fn with_stride(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
    ) -> CaptureResult<Self> {
        let row = width as usize * format.bytes_per_pixel();
        if stride < row {
            return Err(CaptureError::validation(
                "stride",
                format!(">= width * bytes_per_pixel ({})", row),
                stride.to_string(),
            ));
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
        })
    }

    /// Bytes of pixel data per row, excluding padding.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.stride * self.height as usize
    }
}

/// A fixed-shape pixel buffer with capture metadata.
#[derive(Debug)]
pub struct FrameBuffer {
    shape: FrameShape,
    data: Vec<u8>,
    sequence: u64,
    captured_at: SystemTime,
    home: Option<Weak<PoolShared>>,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer that belongs to no pool.
    pub fn new(shape: FrameShape) -> Self {
        Self::from_parts(shape, vec![0u8; shape.byte_len()], None)
    }

    pub(crate) fn from_parts(
        shape: FrameShape,
        data: Vec<u8>,
        home: Option<Weak<PoolShared>>,
    ) -> Self {
        debug_assert_eq!(data.len(), shape.byte_len());
        Self {
            shape,
            data,
            sequence: 0,
            captured_at: SystemTime::UNIX_EPOCH,
            home,
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn format(&self) -> PixelFormat {
        self.shape.format
    }

    pub fn stride(&self) -> usize {
        self.shape.stride
    }

    /// Sequence number assigned by the capture loop; `0` until delivered.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.shape.stride;
        &self.data[start..start + self.shape.row_bytes()]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.shape.stride;
        let len = self.shape.row_bytes();
        &mut self.data[start..start + len]
    }

    /// Copy a tightly or loosely packed source image of the same width,
    /// height and format into this buffer row by row.
    pub fn copy_from_rows(&mut self, src: &[u8], src_stride: usize) -> CaptureResult<()> {
        let row_bytes = self.shape.row_bytes();
        let needed = src_stride * (self.shape.height as usize).saturating_sub(1) + row_bytes;
        if src_stride < row_bytes || src.len() < needed {
            return Err(CaptureError::validation(
                "source",
                format!("at least {} bytes with stride >= {}", needed, row_bytes),
                format!("{} bytes, stride {}", src.len(), src_stride),
            ));
        }
        for y in 0..self.shape.height {
            let offset = y as usize * src_stride;
            self.row_mut(y)
                .copy_from_slice(&src[offset..offset + row_bytes]);
        }
        Ok(())
    }

    pub(crate) fn stamp(&mut self, sequence: u64, captured_at: SystemTime) {
        self.sequence = sequence;
        self.captured_at = captured_at;
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take().and_then(|weak| weak.upgrade()) {
            pool.reclaim(self.shape, std::mem::take(&mut self.data));
        }
    }
}
