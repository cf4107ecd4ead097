use std::fmt;

/// Bearing of the engaged peer relative to straight ahead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    FarLeft,
    Left,
    #[default]
    None,
    Right,
    FarRight,
}

impl Direction {
    /// Classify a marker center `x` against bands relative to the frame height `h`.
    ///
    /// Bands use integer arithmetic and are checked in order:
    /// `[0, h/4 - 1]` far left, `[h/4, 3h/8]` left, `[5h/8, 3*(h/4)]` right,
    /// `[3h/4 + 1, h]` far right. Everything else, including the gaps, is `None`.
    pub fn classify(x: i32, height: i32) -> Self {
        let quarter = height / 4;
        if (0..quarter).contains(&x) {
            Direction::FarLeft
        } else if (quarter..=3 * height / 8).contains(&x) {
            Direction::Left
        } else if (5 * height / 8..=3 * quarter).contains(&x) {
            Direction::Right
        } else if (3 * height / 4 + 1..=height).contains(&x) {
            Direction::FarRight
        } else {
            Direction::None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::FarLeft => "farLeft",
            Direction::Left => "left",
            Direction::None => "none",
            Direction::Right => "right",
            Direction::FarRight => "farRight",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether `x` lies in the central band `[h/4, 3*(h/4)]` that gates acquisition.
pub fn in_acquisition_band(x: i32, height: i32) -> bool {
    let quarter = height / 4;
    (quarter..=3 * quarter).contains(&x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges_for_a_720_pixel_frame() {
        let h = 720;
        assert_eq!(Direction::classify(0, h), Direction::FarLeft);
        assert_eq!(Direction::classify(179, h), Direction::FarLeft);
        assert_eq!(Direction::classify(180, h), Direction::Left);
        assert_eq!(Direction::classify(270, h), Direction::Left);
        assert_eq!(Direction::classify(271, h), Direction::None);
        assert_eq!(Direction::classify(360, h), Direction::None);
        assert_eq!(Direction::classify(449, h), Direction::None);
        assert_eq!(Direction::classify(450, h), Direction::Right);
        assert_eq!(Direction::classify(540, h), Direction::Right);
        assert_eq!(Direction::classify(541, h), Direction::FarRight);
        assert_eq!(Direction::classify(720, h), Direction::FarRight);
        assert_eq!(Direction::classify(721, h), Direction::None);
        assert_eq!(Direction::classify(-1, h), Direction::None);
    }

    #[test]
    fn odd_heights_keep_the_integer_gaps() {
        // h = 722: h/4 = 180, 3*(h/4) = 540, 3h/4 + 1 = 542.
        assert_eq!(Direction::classify(540, 722), Direction::Right);
        assert_eq!(Direction::classify(541, 722), Direction::None);
        assert_eq!(Direction::classify(542, 722), Direction::FarRight);
    }

    #[test]
    fn acquisition_band_is_the_middle_half() {
        assert!(!in_acquisition_band(179, 720));
        assert!(in_acquisition_band(180, 720));
        assert!(in_acquisition_band(540, 720));
        assert!(!in_acquisition_band(541, 720));
    }
}
