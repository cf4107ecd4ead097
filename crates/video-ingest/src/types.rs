use std::fmt;

use anyhow::Error;
use thiserror::Error;

use crate::pool::PooledBuffer;

/// Raw camera frame handed from a frame source to the detector.
///
/// The pixel storage is borrowed from the source's [`BufferPool`](crate::BufferPool) and goes
/// back to it when the frame is dropped, whether the frame was processed or overwritten.
pub struct Frame {
    pub data: PooledBuffer,
    pub width: i32,
    pub height: i32,
    pub rotation: Rotation,
    pub timestamp_ms: i64,
    pub sequence: u64,
    pub format: FrameFormat,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rotation", &self.rotation)
            .field("format", &self.format)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// YUV 4:2:0 semi-planar, the usual preview format of handset cameras.
    Nv21,
    Bgr8,
}

impl FrameFormat {
    /// Number of bytes a single frame of the given size occupies.
    pub fn buffer_len(self, width: i32, height: i32) -> usize {
        let pixels = (width.max(0) as usize) * (height.max(0) as usize);
        match self {
            FrameFormat::Nv21 => pixels + pixels.div_ceil(2),
            FrameFormat::Bgr8 => pixels * 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// Geometry and cadence a frame source produces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameGeometry {
    pub width: i32,
    pub height: i32,
    pub fps: f32,
    pub rotation: Rotation,
    pub format: FrameFormat,
}

impl FrameGeometry {
    pub fn buffer_len(&self) -> usize {
        self.format.buffer_len(self.width, self.height)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("frame source {name:?} is unavailable: {reason}")]
    Unavailable { name: String, reason: String },
    #[error(transparent)]
    Other(#[from] Error),
}
