//! What the display shows after each decision cycle.

use std::sync::{Mutex, PoisonError};

use marker_core::{is_peer_address, stop_payload};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::direction::Direction;

/// Marker the device shows to the vehicle behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerImage {
    None,
    Address(String),
    Stop(String),
}

/// The device's own marker payloads.
#[derive(Clone, Debug, Default)]
pub struct OwnMarker {
    address: Option<String>,
}

impl OwnMarker {
    /// A malformed address disables marker display.
    pub fn new(address: Option<&str>) -> Self {
        let address = match address {
            Some(address) if is_peer_address(address) => Some(address.to_owned()),
            Some(address) => {
                warn!(address, "own address is not a valid peer address; marker display disabled");
                None
            }
            None => None,
        };
        Self { address }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn image(&self, stopped: bool) -> MarkerImage {
        match &self.address {
            None => MarkerImage::None,
            Some(address) if stopped => MarkerImage::Stop(stop_payload(address)),
            Some(address) => MarkerImage::Address(address.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderState {
    pub direction: Direction,
    pub marker: MarkerImage,
    pub local_stop: bool,
    /// Text describing the engaged peer, if any.
    pub engaged: Option<String>,
    pub frame_sequence: u64,
}

pub trait RenderSurface: Send + Sync {
    fn present(&self, state: &RenderState, frame: &Frame);
}

/// Surface that logs what would be drawn whenever it changes.
#[derive(Default)]
pub struct LogSurface {
    last: Mutex<Option<(Direction, MarkerImage)>>,
}

impl LogSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderSurface for LogSurface {
    fn present(&self, state: &RenderState, frame: &Frame) {
        let current = (state.direction, state.marker.clone());
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_ref() != Some(&current) {
            debug!(
                frame = frame.sequence,
                direction = %state.direction,
                marker = ?state.marker,
                engaged = state.engaged.as_deref().unwrap_or("-"),
                "display updated"
            );
            *last = Some(current);
        }
    }
}

/// Surface keeping every presented state, for inspection.
#[derive(Default)]
pub struct RecordingSurface {
    states: Mutex<Vec<RenderState>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<RenderState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RenderSurface for RecordingSurface {
    fn present(&self, state: &RenderState, _frame: &Frame) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
    }
}
