//! Contract of the marker decoding capability.
//!
//! Decoding is asynchronous: [`MarkerDetector::detect`] returns a [`DetectionTask`] that the
//! caller waits on. The detector may complete the task on any thread; the caller is the one
//! that keeps a single detection in flight.

use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::trace;
use video_ingest::Frame;

use crate::marker::DecodedMarker;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("marker detector unavailable: {0}")]
    Unavailable(String),
    #[error("marker detection failed: {0}")]
    Failed(String),
}

pub type DetectionResult = Result<Vec<DecodedMarker>, DetectError>;

/// Pending outcome of one detector call.
pub struct DetectionTask {
    rx: Receiver<DetectionResult>,
}

/// Completion side of a [`DetectionTask`].
pub struct DetectionCompleter {
    tx: Sender<DetectionResult>,
}

impl DetectionTask {
    /// Task that is already complete.
    pub fn ready(result: DetectionResult) -> Self {
        let (completer, task) = Self::pending();
        completer.complete(result);
        task
    }

    /// Task completed later through the returned completer.
    pub fn pending() -> (DetectionCompleter, Self) {
        let (tx, rx) = bounded(1);
        (DetectionCompleter { tx }, Self { rx })
    }

    /// Block until the detector completes the task.
    ///
    /// A completer dropped without completing counts as a failed detection.
    pub fn wait(self) -> DetectionResult {
        self.rx.recv().unwrap_or_else(|_| {
            Err(DetectError::Failed(
                "detector dropped the task without completing it".into(),
            ))
        })
    }
}

impl DetectionCompleter {
    pub fn complete(self, result: DetectionResult) {
        if self.tx.send(result).is_err() {
            trace!("detection completed after the caller gave up on it");
        }
    }
}

/// Marker decoding capability consumed by the processing loop.
pub trait MarkerDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> DetectionTask;
}

/// Detector that replays a fixed per-frame script of decoded markers.
///
/// Frame `n` yields the markers at index `n` of the script (modulo its length when looping).
/// Frames past the end of a non-looping script decode to nothing.
pub struct ScriptedDetector {
    script: Vec<Vec<DecodedMarker>>,
    looping: bool,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<DecodedMarker>>, looping: bool) -> Self {
        Self { script, looping }
    }

    pub fn markers_for(&self, sequence: u64) -> Vec<DecodedMarker> {
        if self.script.is_empty() {
            return Vec::new();
        }
        let len = self.script.len() as u64;
        let index = if self.looping {
            sequence % len
        } else if sequence < len {
            sequence
        } else {
            return Vec::new();
        };
        self.script[index as usize].clone()
    }
}

impl MarkerDetector for ScriptedDetector {
    fn detect(&self, frame: &Frame) -> DetectionTask {
        DetectionTask::ready(Ok(self.markers_for(frame.sequence)))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use video_ingest::{FrameFormat, PooledBuffer, Rotation};

    use super::*;
    use crate::marker::Point;

    fn frame(sequence: u64) -> Frame {
        Frame {
            data: PooledBuffer::unpooled(vec![0; 6]),
            width: 2,
            height: 2,
            rotation: Rotation::Deg0,
            timestamp_ms: 0,
            sequence,
            format: FrameFormat::Nv21,
        }
    }

    #[test]
    fn pending_task_completes_from_another_thread() {
        let (completer, task) = DetectionTask::pending();
        let worker = thread::spawn(move || {
            completer.complete(Ok(vec![DecodedMarker::square(
                "AA:BB:CC:DD:EE:FF",
                Point::new(0, 0),
                10,
            )]))
        });
        let markers = task.wait().expect("detection succeeds");
        worker.join().expect("worker thread");
        assert_eq!(markers.len(), 1);
    }

    #[test]
    fn dropped_completer_fails_the_task() {
        let (completer, task) = DetectionTask::pending();
        drop(completer);
        assert!(matches!(task.wait(), Err(DetectError::Failed(_))));
    }

    #[test]
    fn scripted_detector_loops_or_runs_dry() {
        let marker = DecodedMarker::square("11:22:33:44:55:66", Point::new(0, 0), 4);
        let script = vec![vec![marker.clone()], vec![]];

        let looping = ScriptedDetector::new(script.clone(), true);
        assert_eq!(looping.detect(&frame(2)).wait().expect("ok"), vec![marker]);
        assert!(looping.detect(&frame(3)).wait().expect("ok").is_empty());

        let once = ScriptedDetector::new(script, false);
        assert!(once.detect(&frame(2)).wait().expect("ok").is_empty());
        assert!(ScriptedDetector::new(Vec::new(), true).markers_for(7).is_empty());
    }
}
