//! Marker model and the decoding capability contract.
//!
//! A marker carries a peer's transport address (or its `:STOP` variant). This crate turns
//! decoded corner geometry into [`MarkerObservation`]s and defines how the processing loop
//! talks to whatever decodes markers from camera frames.

pub mod address;
pub mod detector;
pub mod marker;

pub use address::{ADDRESS_LEN, STOP_SUFFIX, is_peer_address, stop_payload, strip_stop};
pub use detector::{
    DetectError, DetectionCompleter, DetectionResult, DetectionTask, MarkerDetector,
    ScriptedDetector,
};
pub use marker::{Calibration, DecodedMarker, MarkerObservation, Point};
