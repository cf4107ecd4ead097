//! Engaged-peer state machine.
//!
//! The tracker owns the single engaged observation. Each processed frame feeds it the
//! decoded markers of that frame; it answers with the session commands to issue, the events
//! to record and the bearing to display. Time is passed in explicitly.

use marker_core::{
    Calibration, DecodedMarker, MarkerObservation, STOP_SUFFIX, is_peer_address, stop_payload,
};
use tracing::{debug, trace};

use crate::direction::{Direction, in_acquisition_band};

/// An engaged peer not seen for longer than this is dropped.
pub const STALENESS_WINDOW_MS: i64 = 5_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    /// Open an outbound session to the peer, cancelling any previous one first.
    Open(String),
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    Acquired(String),
    /// The engaged peer is showing its stop marker.
    PeerStop(String),
    /// The engaged peer is back to its plain marker.
    PeerResumed(String),
    Lost(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameDecision {
    pub commands: Vec<SessionCommand>,
    pub events: Vec<TrackerEvent>,
    pub direction: Direction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerState {
    NoPeer,
    Tracking,
    StoppedByPeer,
}

#[derive(Default)]
pub struct ProximityTracker {
    engaged: Option<MarkerObservation>,
    calibration: Option<Calibration>,
}

impl ProximityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engaged(&self) -> Option<&MarkerObservation> {
        self.engaged.as_ref()
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn state(&self) -> TrackerState {
        match &self.engaged {
            None => TrackerState::NoPeer,
            Some(engaged) if engaged.content.ends_with(STOP_SUFFIX) => {
                TrackerState::StoppedByPeer
            }
            Some(_) => TrackerState::Tracking,
        }
    }

    /// Text describing the engaged observation, for display.
    pub fn summary(&self) -> Option<String> {
        self.engaged.as_ref().map(ToString::to_string)
    }

    /// Derive the calibration constant from the engaged peer's apparent size.
    ///
    /// Has no effect without an engaged peer. A later call replaces the constant.
    pub fn calibrate(&mut self) -> Option<Calibration> {
        let engaged = self.engaged.as_mut()?;
        let calibration = Calibration::from_apparent_size(engaged.apparent_size)?;
        engaged.distance_m = calibration.distance_for(engaged.apparent_size);
        debug!(
            constant = calibration.constant(),
            size = engaged.apparent_size,
            "distance calibrated"
        );
        self.calibration = Some(calibration);
        Some(calibration)
    }

    /// Feed the markers decoded from one frame of the given height.
    pub fn observe_frame(
        &mut self,
        markers: &[DecodedMarker],
        frame_height: i32,
        now_ms: i64,
    ) -> FrameDecision {
        let mut decision = FrameDecision::default();
        for marker in markers {
            let observation = MarkerObservation::from_marker(marker, self.calibration, now_ms);
            self.observe(observation, frame_height, &mut decision);
        }

        if let Some(engaged) = self.engaged.take_if(|engaged| {
            now_ms.saturating_sub(engaged.last_seen_ms) > STALENESS_WINDOW_MS
        }) {
            debug!(peer = %engaged.content, "engaged peer went stale");
            decision.commands.push(SessionCommand::Cancel);
            decision.events.push(TrackerEvent::Lost(engaged.content));
        }

        decision.direction = self
            .engaged
            .as_ref()
            .map_or(Direction::None, |engaged| {
                Direction::classify(engaged.center.x, frame_height)
            });
        decision
    }

    fn observe(
        &mut self,
        observation: MarkerObservation,
        frame_height: i32,
        decision: &mut FrameDecision,
    ) {
        if observation.apparent_size <= 0 {
            trace!(content = %observation.content, "ignoring degenerate marker");
            return;
        }

        if let Some(engaged) = self.engaged.as_mut() {
            if observation.content == stop_payload(&engaged.content) {
                debug!(peer = %engaged.content, "peer shows its stop marker");
                decision
                    .events
                    .push(TrackerEvent::PeerStop(engaged.content.clone()));
                engaged.content = observation.content;
                return;
            }
            if engaged.content == stop_payload(&observation.content) {
                debug!(peer = %observation.content, "peer cleared its stop marker");
                engaged.content = observation.content.clone();
                decision
                    .events
                    .push(TrackerEvent::PeerResumed(observation.content.clone()));
            }
        }

        if !is_peer_address(&observation.content) {
            trace!(content = %observation.content, "marker is not a peer address");
            return;
        }

        let engaged = self.engaged.as_ref();
        if engaged.is_some_and(|engaged| engaged.content == observation.content) {
            self.engaged = Some(observation);
            return;
        }

        let bound = engaged.and_then(|engaged| engaged.distance_m);
        let closer = match (observation.distance_m, bound) {
            (Some(distance), Some(bound)) => (0.0..=bound).contains(&distance),
            _ => true,
        };
        if !closer {
            trace!(content = %observation.content, "candidate is farther than the engaged peer");
            return;
        }
        if !in_acquisition_band(observation.center.x, frame_height) {
            trace!(
                content = %observation.content,
                x = observation.center.x,
                "candidate is outside the central band"
            );
            return;
        }

        debug!(
            peer = %observation.content,
            size = observation.apparent_size,
            "acquired peer"
        );
        decision
            .commands
            .push(SessionCommand::Open(observation.content.clone()));
        decision
            .events
            .push(TrackerEvent::Acquired(observation.content.clone()));
        self.engaged = Some(observation);
    }
}
