//! Camera-side plumbing: frame types, recycled frame buffers, the most-recent-wins
//! [`FrameSlot`] and the capture thread that fills it.

mod pool;
mod slot;
mod source;
mod types;

pub use pool::{BufferPool, DEFAULT_POOL_DEPTH, PooledBuffer};
pub use slot::{FrameSlot, SlotStats};
pub use source::{Capture, FramePump, FrameSource, SyntheticSource, spawn_frame_pump};
pub use types::{CaptureError, Frame, FrameFormat, FrameGeometry, Rotation};
