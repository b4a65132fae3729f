//! # Core Infrastructure Module
//!
//! Frame buffers, the shape-keyed buffer pool that recycles them, and the
//! reorder buffer that keeps overlapped processing results in sequence order.

pub mod buffer_pool;
pub mod frame;
pub mod reorder;

pub use buffer_pool::{BufferPool, PoolStats};
pub use frame::{FrameBuffer, FrameShape, PixelFormat, Rect, SharedFrame};
pub use reorder::ReorderBuffer;
