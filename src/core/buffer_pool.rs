//! # Buffer Pool Module
//!
//! An arena-style free list of frame buffers keyed by [`FrameShape`]. The
//! capture loop acquires one buffer per cycle and the buffer finds its own
//! way back when its last holder drops it, so the hot path does not allocate
//! once the pool is warm.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐ acquire ┌──────────────────────┐  Arc  ┌─────────────────┐
//! │  Capture Loop   │────────▶│     Buffer Pool      │──────▶│   Processor     │
//! │  (one or more)  │         │ ┌──────────────────┐ │       └────────┬────────┘
//! └─────────────────┘         │ │ 35x31 Rgba8 [..] │ │                │ drop
//!                             │ │ 1920x1080 Bgra8  │ │◀───────────────┘
//!                             │ └──────────────────┘ │  reclaim
//!                             └──────────────────────┘
//! ```
//!
//! ## Shape Changes
//!
//! Acquiring a shape the pool has never seen marks every other shape stale,
//! except shapes that still have buffers checked out. A stale bucket is freed
//! by the first [`BufferPool::sweep`] that finds it untouched since the sweep
//! before, so a shape in steady use by another loop on the same pool keeps
//! its buffers. Acquiring from a stale bucket revives it.
//!
//! ## Limits
//!
//! - `max_frame_bytes`: larger requests fail with an allocation error
//! - `max_outstanding`: checked-out buffers across every user of the pool
//! - `max_idle_per_shape`: surplus returns are freed instead of kept
//!
//! ## Example
//!
//! ```rust
//! use screenwatch::config::PoolConfig;
//! use screenwatch::core::{BufferPool, PixelFormat};
//!
//! let pool = BufferPool::new(PoolConfig::default());
//!
//! let buffer = pool.acquire(1920, 1080, PixelFormat::Bgra8)?;
//! assert_eq!(buffer.stride(), 1920 * 4);
//! pool.release(buffer);
//!
//! let stats = pool.stats();
//! assert_eq!(stats.outstanding, 0);
//! assert_eq!(stats.idle, 1);
//! # Ok::<(), screenwatch::CaptureError>(())
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::frame::{FrameBuffer, FrameShape, PixelFormat};
use crate::config::PoolConfig;
use crate::error::{CaptureError, CaptureResult};

/// A shape-keyed pool of reusable frame buffers.
///
/// Cloning the pool clones a handle; every clone shares the same free list,
/// which is what lets several capture loops pool memory together.
#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

/// Point-in-time pool utilization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently checked out (including ones held by processors)
    pub outstanding: usize,
    /// Highest `outstanding` value observed
    pub peak_outstanding: usize,
    /// Buffers waiting in the free list
    pub idle: usize,
    /// Shapes with a bucket in the free list
    pub shapes: usize,
    /// Fresh allocations served
    pub allocations: u64,
    /// Acquisitions served from the free list
    pub reuses: u64,
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    limits: PoolConfig,
    state: Mutex<FreeList>,
}

#[derive(Debug, Default)]
struct FreeList {
    buckets: HashMap<FrameShape, Bucket>,
    outstanding: usize,
    peak_outstanding: usize,
    allocations: u64,
    reuses: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    idle: Vec<Vec<u8>>,
    /// Buffers of this shape currently checked out
    outstanding: usize,
    stale: bool,
    /// Acquired from, reclaimed into or marked since the last sweep
    touched: bool,
}

impl Bucket {
    fn mark_stale(&mut self) {
        if self.outstanding == 0 && !self.stale {
            self.stale = true;
            self.touched = true;
        }
    }

    fn expired(&self) -> bool {
        self.stale && !self.touched && self.outstanding == 0
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, FreeList> {
        // A panic while holding the lock cannot leave the free list torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called from `FrameBuffer::drop`.
    pub(crate) fn reclaim(&self, shape: FrameShape, data: Vec<u8>) {
        let mut list = self.lock();
        list.outstanding = list.outstanding.saturating_sub(1);
        let max_idle = self.limits.max_idle_per_shape;
        if let Some(bucket) = list.buckets.get_mut(&shape) {
            bucket.outstanding = bucket.outstanding.saturating_sub(1);
            bucket.touched = true;
            if bucket.idle.len() < max_idle && data.len() == shape.byte_len() {
                bucket.idle.push(data);
            }
        }
    }
}

impl BufferPool {
    /// Creates an empty pool; buffers are allocated on first need.
    pub fn new(limits: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                limits,
                state: Mutex::new(FreeList::default()),
            }),
        }
    }

    pub fn limits(&self) -> &PoolConfig {
        &self.shared.limits
    }

    /// Returns a buffer of exactly the requested shape.
    ///
    /// The stride is `width × bytes_per_pixel` rounded up to the configured
    /// row alignment. A pooled buffer of the identical shape is preferred;
    /// its contents are whatever the previous user left behind.
    ///
    /// # Errors
    ///
    /// [`CaptureError::Allocation`] when the shape is empty, larger than
    /// `max_frame_bytes`, or when `max_outstanding` buffers are checked out.
    pub fn acquire(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> CaptureResult<FrameBuffer> {
        let limits = &self.shared.limits;
        let shape = FrameShape::aligned(width, height, format, limits.row_alignment);
        let bytes = shape.byte_len();

        if width == 0 || height == 0 {
            return Err(CaptureError::allocation(
                bytes,
                format!("empty shape {}x{}", width, height),
            ));
        }
        if bytes > limits.max_frame_bytes {
            return Err(CaptureError::allocation(
                bytes,
                format!("exceeds max_frame_bytes ({})", limits.max_frame_bytes),
            )
            .with_recovery_suggestion("capture a smaller region or raise pool.max_frame_bytes"));
        }

        let reused = {
            let mut list = self.shared.lock();
            if list.outstanding >= limits.max_outstanding {
                return Err(CaptureError::allocation(
                    bytes,
                    format!(
                        "pool exhausted: {} buffers outstanding",
                        list.outstanding
                    ),
                ));
            }

            if !list.buckets.contains_key(&shape) {
                list.buckets.values_mut().for_each(Bucket::mark_stale);
                list.buckets.insert(shape, Bucket::default());
            }

            let reused = list.buckets.get_mut(&shape).and_then(|bucket| {
                bucket.stale = false;
                bucket.touched = true;
                bucket.outstanding += 1;
                bucket.idle.pop()
            });
            if reused.is_some() {
                list.reuses += 1;
            } else {
                list.allocations += 1;
            }
            list.outstanding += 1;
            list.peak_outstanding = list.peak_outstanding.max(list.outstanding);
            reused
        };

        let data = reused.unwrap_or_else(|| vec![0u8; bytes]);
        Ok(FrameBuffer::from_parts(
            shape,
            data,
            Some(Arc::downgrade(&self.shared)),
        ))
    }

    /// Returns a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: FrameBuffer) {
        drop(buffer);
    }

    /// Frees the idle buffers of every stale shape left untouched since the
    /// previous sweep. Returns how many were freed.
    pub fn sweep(&self) -> usize {
        let mut freed = 0;
        let mut list = self.shared.lock();
        list.buckets.retain(|_, bucket| {
            if bucket.expired() {
                freed += bucket.idle.len();
                return false;
            }
            bucket.touched = false;
            true
        });
        freed
    }

    pub fn stats(&self) -> PoolStats {
        let list = self.shared.lock();
        PoolStats {
            outstanding: list.outstanding,
            peak_outstanding: list.peak_outstanding,
            idle: list.buckets.values().map(|b| b.idle.len()).sum(),
            shapes: list.buckets.len(),
            allocations: list.allocations,
            reuses: list.reuses,
        }
    }
}
