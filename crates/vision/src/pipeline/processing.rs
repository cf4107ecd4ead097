//! The processing thread: claim the newest frame, run the detector, feed the tracker and act
//! on its decision.
//!
//! Frames are claimed from the [`FrameSlot`] one at a time and released only after the
//! tracker has seen the detection result, so the detector never has two frames in flight.
//! Completion immediately re-checks the slot, which collapses a burst of frames into the
//! latest one.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use chrono::Utc;
use link::{EventKind, EventRecord, EventSink, Notifier, SessionControl, StopIndicator};
use marker_core::{DetectError, MarkerDetector};
use tracing::{debug, debug_span, info, warn};
use video_ingest::{Frame, FrameSlot};

use crate::{
    pipeline::{
        PipelineError,
        watchdog::{HealthComponent, PipelineHealth},
    },
    render::{OwnMarker, RenderState, RenderSurface},
    tracker::{FrameDecision, ProximityTracker, SessionCommand, TrackerEvent},
};

/// Operator request to calibrate against the engaged peer on the next processed frame.
#[derive(Clone, Default)]
pub struct CalibrationTrigger {
    requested: Arc<AtomicBool>,
}

impl CalibrationTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

/// Everything the processing thread works with.
pub struct ProcessingContext {
    pub slot: Arc<FrameSlot>,
    pub detector: Arc<dyn MarkerDetector>,
    pub tracker: Arc<Mutex<ProximityTracker>>,
    pub sessions: Arc<dyn SessionControl>,
    pub sink: Arc<dyn EventSink>,
    pub notifier: Arc<dyn Notifier>,
    pub stop: Arc<StopIndicator>,
    pub surface: Arc<dyn RenderSurface>,
    pub own_marker: OwnMarker,
    pub calibration: CalibrationTrigger,
    /// Request calibration automatically once this frame number is reached.
    pub calibrate_at_frame: Option<u64>,
    pub health: Option<Arc<PipelineHealth>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub frames: u64,
    pub detector_failures: u64,
    pub sessions_opened: u64,
    pub sessions_cancelled: u64,
}

pub struct ProcessingHandle {
    handle: thread::JoinHandle<Result<ProcessingStats, PipelineError>>,
}

impl ProcessingHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread. It exits once the frame slot is shut down.
    pub fn join(self) -> Result<ProcessingStats, PipelineError> {
        self.handle
            .join()
            .unwrap_or(Err(PipelineError::Panicked("processing")))
    }
}

pub fn spawn_processing_loop(ctx: ProcessingContext) -> Result<ProcessingHandle, PipelineError> {
    let handle = thread::Builder::new()
        .name("v2v-processing".into())
        .spawn(move || run(&ctx))
        .map_err(|source| PipelineError::Spawn {
            name: "processing",
            source,
        })?;
    Ok(ProcessingHandle { handle })
}

fn run(ctx: &ProcessingContext) -> Result<ProcessingStats, PipelineError> {
    let mut stats = ProcessingStats::default();
    let mut auto_calibration_armed = ctx.calibrate_at_frame.is_some();
    info!("processing loop started");

    while let Some(frame) = ctx.slot.wait_claim() {
        let mut next = Some(frame);
        while let Some(frame) = next {
            if auto_calibration_armed
                && ctx
                    .calibrate_at_frame
                    .is_some_and(|at| frame.sequence >= at)
            {
                auto_calibration_armed = false;
                ctx.calibration.request();
            }
            let outcome = process_frame(ctx, &frame, &mut stats);
            drop(frame);
            if let Err(err) = outcome {
                let _ = ctx.slot.complete();
                return Err(err);
            }
            next = ctx.slot.complete();
        }
    }

    info!(frames = stats.frames, "processing loop stopped");
    Ok(stats)
}

fn process_frame(
    ctx: &ProcessingContext,
    frame: &Frame,
    stats: &mut ProcessingStats,
) -> Result<(), PipelineError> {
    let span = debug_span!(
        "frame",
        sequence = frame.sequence,
        width = frame.width,
        height = frame.height
    );
    let _entered = span.enter();

    let markers = match ctx.detector.detect(frame).wait() {
        Ok(markers) => {
            metrics::counter!("v2v_detections_total").increment(1);
            markers
        }
        Err(DetectError::Unavailable(reason)) => {
            return Err(PipelineError::DetectorUnavailable(reason));
        }
        Err(DetectError::Failed(reason)) => {
            metrics::counter!("v2v_detector_failures_total").increment(1);
            stats.detector_failures += 1;
            warn!(%reason, "marker detection failed");
            Vec::new()
        }
    };
    stats.frames += 1;

    let now = Utc::now().timestamp_millis();
    let (decision, engaged) = {
        let mut tracker = ctx.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        if ctx.calibration.take() {
            match tracker.calibrate() {
                Some(calibration) => {
                    info!(constant = calibration.constant(), "distance calibrated");
                    ctx.notifier.notify("Distance set");
                }
                None => warn!("calibration requested without an engaged peer"),
            }
        }
        let decision = tracker.observe_frame(&markers, frame.height, now);
        (decision, tracker.summary())
    };

    apply(ctx, &decision, now, stats);

    let local_stop = ctx.stop.is_active(now);
    let state = RenderState {
        direction: decision.direction,
        marker: ctx.own_marker.image(local_stop),
        local_stop,
        engaged,
        frame_sequence: frame.sequence,
    };
    ctx.surface.present(&state, frame);

    if let Some(health) = ctx.health.as_ref() {
        health.beat(HealthComponent::Processing);
    }
    Ok(())
}

fn apply(ctx: &ProcessingContext, decision: &FrameDecision, now: i64, stats: &mut ProcessingStats) {
    for event in &decision.events {
        match event {
            TrackerEvent::Acquired(peer) => info!(peer = %peer, "peer acquired"),
            TrackerEvent::PeerStop(peer) => {
                info!(peer = %peer, "peer signalled stop");
                ctx.sink.append(EventRecord::at(EventKind::PeerStop, now));
            }
            TrackerEvent::PeerResumed(peer) => debug!(peer = %peer, "peer resumed"),
            TrackerEvent::Lost(peer) => info!(peer = %peer, "peer lost"),
        }
    }

    for command in &decision.commands {
        match command {
            SessionCommand::Open(peer) => {
                stats.sessions_opened += 1;
                if let Err(err) = ctx.sessions.open_outbound(peer) {
                    warn!(peer = %peer, error = %err, "failed to open outbound session");
                }
            }
            SessionCommand::Cancel => {
                stats.sessions_cancelled += 1;
                ctx.sessions.cancel_outbound();
            }
        }
    }
}
