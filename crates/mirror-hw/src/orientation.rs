//! Orientation correction. Frames are rotated upright before detection.
//!
//! The camera sensor is fixed to the device while the display can be mounted
//! in any of four rotations. The sensor and display rotate in opposite
//! directions, so a 90° device reading needs a 270° counter-clockwise
//! correction (and vice versa).

use crate::frame::Frame;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Device rotation reading, in quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map a raw reading in degrees. Anything that is not an exact quarter
    /// turn falls back to upright.
    pub fn from_degrees(degrees: u16) -> Self {
        match degrees {
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Counter-clockwise angle that brings a frame captured at this reading
    /// upright: 0→0, 90→270, 180→180, 270→90.
    pub fn correction_angle(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 270,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 90,
        }
    }
}

/// Shared, lock-free holder of the latest device rotation reading.
///
/// The orientation listener writes it; the camera thread stamps each captured
/// frame with the value current at capture time.
#[derive(Debug, Clone, Default)]
pub struct OrientationHandle {
    degrees: Arc<AtomicU16>,
}

impl OrientationHandle {
    pub fn new(initial: Rotation) -> Self {
        Self {
            degrees: Arc::new(AtomicU16::new(initial.degrees())),
        }
    }

    /// Record a new device reading. Unrecognized angles are stored as upright.
    pub fn set_degrees(&self, degrees: u16) {
        let rotation = Rotation::from_degrees(degrees);
        let previous = self.degrees.swap(rotation.degrees(), Ordering::Relaxed);
        if previous != rotation.degrees() {
            tracing::debug!(degrees = rotation.degrees(), "device orientation changed");
        }
    }

    pub fn get(&self) -> Rotation {
        Rotation::from_degrees(self.degrees.load(Ordering::Relaxed))
    }
}

/// Rotate `frame` counter-clockwise by `rotation.correction_angle()` about its
/// centre, keeping its dimensions.
///
/// Destination pixels whose source falls outside the frame are black. The
/// input frame is left untouched.
pub fn correct(frame: &Frame, rotation: Rotation) -> Frame {
    let angle = rotation.correction_angle();
    if angle == 0 {
        return Frame {
            rotation: Rotation::Deg0,
            ..frame.clone()
        };
    }

    // (cos, sin) of the counter-clockwise angle.
    let (cos, sin): (i64, i64) = match angle {
        90 => (0, 1),
        180 => (-1, 0),
        _ => (0, -1),
    };

    let w = frame.width as i64;
    let h = frame.height as i64;
    let mut data = vec![0u8; frame.data.len()];

    // Work in doubled coordinates so the centre of an even-sized frame stays
    // on the integer grid.
    for y in 0..h {
        let dy2 = 2 * y + 1 - h;
        for x in 0..w {
            let dx2 = 2 * x + 1 - w;
            let src_x = (cos * dx2 - sin * dy2 + w - 1).div_euclid(2);
            let src_y = (sin * dx2 + cos * dy2 + h - 1).div_euclid(2);
            if (0..w).contains(&src_x) && (0..h).contains(&src_y) {
                data[(y * w + x) as usize] = frame.data[(src_y * w + src_x) as usize];
            }
        }
    }

    Frame {
        data,
        width: frame.width,
        height: frame.height,
        timestamp: frame.timestamp,
        sequence: frame.sequence,
        rotation: Rotation::Deg0,
        is_dark: frame.is_dark,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(width: u32, height: u32) -> Frame {
        let data = (0..(width * height)).map(|i| i as u8).collect();
        Frame::from_gray(data, width, height).unwrap()
    }

    #[test]
    fn test_correction_angle_mapping() {
        let cases = [(0, 0), (90, 270), (180, 180), (270, 90)];
        for (reading, expected) in cases {
            assert_eq!(Rotation::from_degrees(reading).correction_angle(), expected);
        }
    }

    #[test]
    fn test_unknown_angle_falls_back_to_upright() {
        assert_eq!(Rotation::from_degrees(45), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(360), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(45).correction_angle(), 0);
    }

    #[test]
    fn test_correct_preserves_dimensions() {
        let frame = grid(6, 4);
        for degrees in [0, 90, 180, 270] {
            let out = correct(&frame, Rotation::from_degrees(degrees));
            assert_eq!((out.width, out.height), (6, 4));
            assert_eq!(out.data.len(), 24);
        }
    }

    #[test]
    fn test_correct_180_reverses_pixels() {
        let frame = grid(4, 3);
        let out = correct(&frame, Rotation::Deg180);
        let reversed: Vec<u8> = frame.data.iter().rev().copied().collect();
        assert_eq!(out.data, reversed);
    }

    #[test]
    fn test_correct_270_reading_rotates_quarter_turn_ccw() {
        // Deg270 reading → 90° counter-clockwise:
        // 0 1 2      2 5 8
        // 3 4 5  →   1 4 7
        // 6 7 8      0 3 6
        let frame = grid(3, 3);
        let out = correct(&frame, Rotation::Deg270);
        assert_eq!(out.data, vec![2, 5, 8, 1, 4, 7, 0, 3, 6]);
    }

    #[test]
    fn test_correct_90_reading_rotates_quarter_turn_cw() {
        let frame = grid(3, 3);
        let out = correct(&frame, Rotation::Deg90);
        assert_eq!(out.data, vec![6, 3, 0, 7, 4, 1, 8, 5, 2]);
    }

    #[test]
    fn test_correct_does_not_mutate_source() {
        let frame = grid(3, 3);
        let before = frame.data.clone();
        let _ = correct(&frame, Rotation::Deg90);
        assert_eq!(frame.data, before);
    }

    #[test]
    fn test_handle_tracks_latest_reading() {
        let handle = OrientationHandle::new(Rotation::Deg0);
        let reader = handle.clone();
        handle.set_degrees(180);
        assert_eq!(reader.get(), Rotation::Deg180);
        handle.set_degrees(33);
        assert_eq!(reader.get(), Rotation::Deg0);
    }
}
