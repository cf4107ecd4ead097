//! Frame sources and the capture thread that feeds a [`FrameSlot`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    pool::{BufferPool, DEFAULT_POOL_DEPTH},
    slot::FrameSlot,
    types::{CaptureError, Frame, FrameGeometry},
};

/// Outcome of asking a source for its next frame.
pub enum Capture {
    Frame(Frame),
    /// Every buffer is still held downstream; this tick produces nothing.
    Starved,
    EndOfStream,
}

/// Device that produces camera frames at a roughly fixed rate.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn geometry(&self) -> FrameGeometry;

    fn next_frame(&mut self) -> Result<Capture, CaptureError>;
}

/// Frame source producing blank frames of a fixed geometry, optionally for a bounded count.
///
/// Stands in for the handset camera in simulations: the marker content of each frame is
/// supplied separately by a scripted detector keyed on the frame sequence number.
pub struct SyntheticSource {
    geometry: FrameGeometry,
    pool: BufferPool,
    sequence: u64,
    limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(geometry: FrameGeometry) -> Result<Self, CaptureError> {
        if geometry.width <= 0 || geometry.height <= 0 {
            return Err(CaptureError::Unavailable {
                name: "synthetic".into(),
                reason: format!(
                    "invalid frame size {}x{}",
                    geometry.width, geometry.height
                ),
            });
        }
        if !(geometry.fps > 0.0) {
            return Err(CaptureError::Unavailable {
                name: "synthetic".into(),
                reason: format!("invalid frame rate {}", geometry.fps),
            });
        }
        Ok(Self {
            pool: BufferPool::new(geometry.buffer_len(), DEFAULT_POOL_DEPTH),
            geometry,
            sequence: 0,
            limit: None,
        })
    }

    /// Stop after `frames` frames have been produced.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    fn next_frame(&mut self) -> Result<Capture, CaptureError> {
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Ok(Capture::EndOfStream);
        }
        let Some(data) = self.pool.acquire() else {
            return Ok(Capture::Starved);
        };
        let frame = Frame {
            data,
            width: self.geometry.width,
            height: self.geometry.height,
            rotation: self.geometry.rotation,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence: self.sequence,
            format: self.geometry.format,
        };
        self.sequence += 1;
        Ok(Capture::Frame(frame))
    }
}

/// Handle for the capture thread started by [`spawn_frame_pump`].
pub struct FramePump {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Result<(), CaptureError>>>,
}

impl FramePump {
    /// Whether the capture thread has exited on its own (end of stream or error).
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Ask the capture thread to stop and wait for it, returning its outcome.
    pub fn stop(mut self) -> Result<(), CaptureError> {
        self.stop.store(true, Ordering::SeqCst);
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<(), CaptureError> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(CaptureError::Other(anyhow::anyhow!(
                    "frame pump thread panicked"
                )))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.join_inner();
    }
}

/// Spawns the capture thread which pulls frames from `source` at its frame rate and
/// publishes them into `slot`.
///
/// The thread only ever publishes; it never waits for the detector. `on_frame` runs after
/// every tick that produced a frame and is used for liveness heartbeats.
pub fn spawn_frame_pump<F>(
    mut source: Box<dyn FrameSource>,
    slot: Arc<FrameSlot>,
    mut on_frame: F,
) -> Result<FramePump, CaptureError>
where
    F: FnMut() + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let geometry = source.geometry();
    let interval = Duration::from_secs_f32(1.0 / geometry.fps.max(0.1));

    let handle = thread::Builder::new()
        .name("v2v-frame-pump".into())
        .spawn(move || {
            info!(
                source = source.name(),
                width = geometry.width,
                height = geometry.height,
                fps = geometry.fps,
                "frame source started"
            );
            let mut next_tick = Instant::now();
            let mut starved: u64 = 0;
            while !thread_stop.load(Ordering::Relaxed) {
                match source.next_frame()? {
                    Capture::Frame(frame) => {
                        slot.publish(frame);
                        on_frame();
                    }
                    Capture::Starved => {
                        starved = starved.wrapping_add(1);
                        if starved % 30 == 1 {
                            warn!(starved, "frame source starved of buffers");
                        }
                    }
                    Capture::EndOfStream => {
                        debug!(source = source.name(), "frame source reached end of stream");
                        break;
                    }
                }

                next_tick += interval;
                let now = Instant::now();
                if next_tick > now {
                    thread::sleep(next_tick - now);
                } else {
                    next_tick = now;
                }
            }
            Ok(())
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(FramePump {
        stop,
        handle: Some(handle),
    })
}
