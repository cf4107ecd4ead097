use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Marker as returned by the decoding capability.
///
/// Corners are ordered top-left, top-right, bottom-right, bottom-left in image coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedMarker {
    pub payload: String,
    pub corners: [Point; 4],
}

impl DecodedMarker {
    pub fn new(payload: impl Into<String>, corners: [Point; 4]) -> Self {
        Self {
            payload: payload.into(),
            corners,
        }
    }

    /// Axis-aligned square marker of side `size` whose top-left corner sits at `origin`.
    pub fn square(payload: impl Into<String>, origin: Point, size: i32) -> Self {
        Self::new(
            payload,
            [
                origin,
                Point::new(origin.x + size, origin.y),
                Point::new(origin.x + size, origin.y + size),
                Point::new(origin.x, origin.y + size),
            ],
        )
    }

    /// Square marker of side `size` centred on `center`.
    pub fn centered(payload: impl Into<String>, center: Point, size: i32) -> Self {
        Self::square(
            payload,
            Point::new(center.x - size / 2, center.y - size / 2),
            size,
        )
    }

    /// Largest edge extent of the marker in pixels.
    ///
    /// Corners come straight from the decoder, so the arithmetic saturates instead of
    /// overflowing on out-of-frame coordinates.
    pub fn apparent_size(&self) -> i32 {
        let [c0, c1, c2, c3] = self.corners;
        let horizontal = c1.x.saturating_sub(c0.x).max(c2.x.saturating_sub(c3.x));
        let vertical = c3.y.saturating_sub(c0.y).max(c2.y.saturating_sub(c1.y));
        horizontal.max(vertical)
    }

    pub fn center(&self) -> Point {
        let half = self.apparent_size() / 2;
        let origin = self.corners[0];
        Point::new(origin.x.saturating_add(half), origin.y.saturating_add(half))
    }
}

/// Distance scale derived from a marker of known size held at a known distance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    constant: f32,
}

impl Calibration {
    /// Calibrate from the apparent size of the currently engaged marker.
    pub fn from_apparent_size(size: i32) -> Option<Self> {
        (size > 0).then(|| Self {
            constant: size as f32 / 2.0,
        })
    }

    pub fn constant(&self) -> f32 {
        self.constant
    }

    /// Estimated distance in meters for a marker of `size` pixels.
    pub fn distance_for(&self, size: i32) -> Option<f32> {
        (size > 0).then(|| 2.0 * self.constant / size as f32)
    }
}

/// One sighting of a marker, with the geometry the tracker reasons about.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerObservation {
    pub content: String,
    pub apparent_size: i32,
    pub center: Point,
    /// `None` until a calibration constant exists.
    pub distance_m: Option<f32>,
    pub last_seen_ms: i64,
}

impl MarkerObservation {
    pub fn from_marker(
        marker: &DecodedMarker,
        calibration: Option<Calibration>,
        seen_at_ms: i64,
    ) -> Self {
        let apparent_size = marker.apparent_size();
        Self {
            content: marker.payload.clone(),
            apparent_size,
            center: marker.center(),
            distance_m: calibration.and_then(|cal| cal.distance_for(apparent_size)),
            last_seen_ms: seen_at_ms,
        }
    }
}

impl fmt::Display for MarkerObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Content: {}", self.content)?;
        writeln!(f, "Size: {}", self.apparent_size)?;
        writeln!(f, "Center: {}, {}", self.center.x, self.center.y)?;
        if let Some(distance) = self.distance_m {
            writeln!(f, "Distance: {distance} m")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_the_largest_edge_extent() {
        let skewed = DecodedMarker::new(
            "AA:BB:CC:DD:EE:FF",
            [
                Point::new(10, 10),
                Point::new(60, 12),
                Point::new(62, 90),
                Point::new(8, 70),
            ],
        );
        assert_eq!(skewed.apparent_size(), 78);
        assert_eq!(skewed.center(), Point::new(49, 49));
    }

    #[test]
    fn extreme_corners_saturate_instead_of_overflowing() {
        let marker = DecodedMarker::new(
            "AA:BB:CC:DD:EE:FF",
            [
                Point::new(i32::MIN, i32::MIN),
                Point::new(i32::MAX, i32::MIN),
                Point::new(i32::MAX, i32::MAX),
                Point::new(i32::MIN, i32::MAX),
            ],
        );
        assert_eq!(marker.apparent_size(), i32::MAX);
        let middle = i32::MIN + i32::MAX / 2;
        assert_eq!(marker.center(), Point::new(middle, middle));

        let inverted = DecodedMarker::new(
            "x",
            [
                Point::new(i32::MAX, i32::MAX),
                Point::new(i32::MIN, i32::MAX),
                Point::new(i32::MIN, i32::MIN),
                Point::new(i32::MAX, i32::MIN),
            ],
        );
        assert_eq!(inverted.apparent_size(), i32::MIN);
        assert_eq!(inverted.center(), Point::new(i32::MAX / 2, i32::MAX / 2));
        let observation =
            MarkerObservation::from_marker(&inverted, Calibration::from_apparent_size(100), 0);
        assert_eq!(observation.distance_m, None);
    }

    #[test]
    fn centered_marker_reports_its_center() {
        let marker = DecodedMarker::centered("x", Point::new(360, 200), 150);
        assert_eq!(marker.apparent_size(), 150);
        assert_eq!(marker.center(), Point::new(360, 200));
    }

    #[test]
    fn distance_follows_the_calibration_constant_exactly() {
        let calibration = Calibration::from_apparent_size(300).expect("positive size");
        assert_eq!(calibration.constant(), 150.0);
        assert_eq!(calibration.distance_for(150), Some(2.0 * 150.0 / 150.0));
        assert_eq!(calibration.distance_for(600), Some(0.5));
        assert_eq!(calibration.distance_for(0), None);
        assert!(Calibration::from_apparent_size(0).is_none());
        assert!(Calibration::from_apparent_size(-1).is_none());
    }

    #[test]
    fn observations_have_no_distance_before_calibration() {
        let marker = DecodedMarker::square("AA:BB:CC:DD:EE:FF", Point::new(0, 0), 120);
        let raw = MarkerObservation::from_marker(&marker, None, 42);
        assert_eq!(raw.distance_m, None);
        assert_eq!(raw.last_seen_ms, 42);

        let calibrated =
            MarkerObservation::from_marker(&marker, Calibration::from_apparent_size(240), 43);
        assert_eq!(calibrated.distance_m, Some(2.0));
        assert!(calibrated.to_string().contains("Distance: 2 m"));
    }

    #[test]
    fn markers_deserialize_from_scenario_json() {
        let json = r#"{"payload":"AA:BB:CC:DD:EE:FF","corners":[{"x":0,"y":0},{"x":10,"y":0},{"x":10,"y":10},{"x":0,"y":10}]}"#;
        let marker: DecodedMarker = serde_json::from_str(json).expect("valid marker json");
        assert_eq!(marker.apparent_size(), 10);
    }
}
