//! Proximity tracking and the frame processing pipeline.
//!
//! Frames flow from a [`video_ingest::FrameSlot`] through a [`marker_core::MarkerDetector`]
//! into the [`ProximityTracker`], whose decisions drive the session layer and the display.

pub mod direction;
pub mod pipeline;
pub mod render;
pub mod tracker;

pub use direction::{Direction, in_acquisition_band};
pub use pipeline::{
    CalibrationTrigger, HealthComponent, PipelineError, PipelineHealth, ProcessingContext,
    ProcessingHandle, ProcessingStats, WatchdogState, spawn_processing_loop, spawn_watchdog,
};
pub use render::{LogSurface, MarkerImage, OwnMarker, RecordingSurface, RenderState, RenderSurface};
pub use tracker::{
    FrameDecision, ProximityTracker, STALENESS_WINDOW_MS, SessionCommand, TrackerEvent,
    TrackerState,
};
