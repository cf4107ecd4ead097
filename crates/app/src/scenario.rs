//! JSON scenarios standing in for the camera, the marker decoder and the motion sensor.

use std::{collections::BTreeSet, fmt::Write as _, fs, path::Path};

use anyhow::{Context, Result, bail};
use link::MotionSample;
use marker_core::{DecodedMarker, is_peer_address, strip_stop};
use serde::{Deserialize, Serialize};
use video_ingest::{FrameFormat, FrameGeometry, Rotation};

use crate::config::FrameOverrides;

/// A scripted run: what the camera sees frame by frame and what the motion sensor reports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub frame: FrameSettings,
    /// Replay `frames` from the start once exhausted instead of seeing nothing.
    #[serde(default)]
    pub looping: bool,
    /// Markers decoded from frame `n`, for each `n`.
    #[serde(default)]
    pub frames: Vec<Vec<DecodedMarker>>,
    /// Motion samples, replayed cyclically.
    #[serde(default)]
    pub motion: Vec<MotionSample>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSettings {
    #[serde(default = "default_width")]
    pub width: i32,
    #[serde(default = "default_height")]
    pub height: i32,
    #[serde(default = "default_fps")]
    pub fps: f32,
    #[serde(default)]
    pub rotation_degrees: u16,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            rotation_degrees: 0,
        }
    }
}

fn default_width() -> i32 {
    1280
}

fn default_height() -> i32 {
    720
}

fn default_fps() -> f32 {
    15.0
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(raw)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<()> {
        self.frame.rotation()?;
        if self.frame.width <= 0 || self.frame.height <= 0 {
            bail!(
                "frame size must be positive (got {}x{})",
                self.frame.width,
                self.frame.height
            );
        }
        if !(self.frame.fps.is_finite() && self.frame.fps > 0.0) {
            bail!("frame rate must be positive (got {})", self.frame.fps);
        }
        for (index, markers) in self.frames.iter().enumerate() {
            if let Some(marker) = markers.iter().find(|marker| marker.payload.is_empty()) {
                bail!("frame {index}: marker at {:?} has an empty payload", marker.corners[0]);
            }
        }
        Ok(())
    }

    /// Frame geometry with command-line overrides applied.
    pub fn geometry(&self, overrides: &FrameOverrides) -> Result<FrameGeometry> {
        Ok(FrameGeometry {
            width: overrides.width.unwrap_or(self.frame.width),
            height: overrides.height.unwrap_or(self.frame.height),
            fps: overrides.fps.unwrap_or(self.frame.fps),
            rotation: self.frame.rotation()?,
            format: FrameFormat::Nv21,
        })
    }

    /// Distinct peer addresses appearing in markers, including stop markers.
    pub fn peers(&self) -> BTreeSet<&str> {
        self.frames
            .iter()
            .flatten()
            .map(|marker| strip_stop(&marker.payload).unwrap_or(marker.payload.as_str()))
            .filter(|payload| is_peer_address(payload))
            .collect()
    }

    pub fn summary(&self) -> String {
        let markers: usize = self.frames.iter().map(Vec::len).sum();
        let foreign = self
            .frames
            .iter()
            .flatten()
            .filter(|marker| {
                !is_peer_address(strip_stop(&marker.payload).unwrap_or(marker.payload.as_str()))
            })
            .count();
        let emergencies = self
            .motion
            .iter()
            .filter(|sample| sample.is_emergency())
            .count();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "frame: {}x{} @ {} fps, rotated {} degrees",
            self.frame.width, self.frame.height, self.frame.fps, self.frame.rotation_degrees
        );
        let _ = writeln!(
            out,
            "frames: {} scripted{}, {markers} markers ({foreign} not peer addresses)",
            self.frames.len(),
            if self.looping { ", looping" } else { "" }
        );
        let peers: Vec<_> = self.peers().into_iter().collect();
        let _ = writeln!(
            out,
            "peers: {}",
            if peers.is_empty() {
                "none".to_string()
            } else {
                peers.join(", ")
            }
        );
        let _ = write!(
            out,
            "motion: {} samples ({emergencies} below the stop threshold)",
            self.motion.len()
        );
        out
    }
}

impl FrameSettings {
    fn rotation(&self) -> Result<Rotation> {
        Ok(match self.rotation_degrees {
            0 => Rotation::Deg0,
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            other => bail!("rotation must be 0, 90, 180 or 270 degrees (got {other})"),
        })
    }
}
