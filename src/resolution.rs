//! Image resolutions and the letterboxing policy of the pipeline.

use std::fmt;

use nalgebra::Point2;

/// Resolution (`width x height`) of an image or a network input.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// Creates a new [`Resolution`] of `width x height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Maps between frame pixels and *normalized input space*.
///
/// A frame is letterboxed into a centered square with a side length of `max(width, height)`.
/// Normalized input space spans that square as `[0, 1]²`, so it has the same scale on both axes
/// and rotations computed in it are not skewed by the frame's aspect ratio. The padded area is
/// treated as black when sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    side: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    pub fn new(frame: Resolution) -> Self {
        let side = frame.width().max(frame.height()) as f32;
        Self {
            side,
            pad_x: (side - frame.width() as f32) * 0.5,
            pad_y: (side - frame.height() as f32) * 0.5,
        }
    }

    /// Side length of the letterboxed square, in frame pixels.
    pub fn side(&self) -> f32 {
        self.side
    }

    /// Converts a point in normalized input space to frame pixel coordinates.
    pub fn to_pixels(&self, p: Point2<f32>) -> Point2<f32> {
        Point2::new(p.x * self.side - self.pad_x, p.y * self.side - self.pad_y)
    }

    /// Converts frame pixel coordinates to normalized input space.
    pub fn to_normalized(&self, p: Point2<f32>) -> Point2<f32> {
        Point2::new((p.x + self.pad_x) / self.side, (p.y + self.pad_y) / self.side)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn letterbox_pads_short_axis() {
        let lb = Letterbox::new(Resolution::new(200, 100));
        assert_eq!(lb.side(), 200.0);

        // Frame origin lies inside the padded square, a quarter of the way down.
        let origin = lb.to_normalized(Point2::new(0.0, 0.0));
        assert_relative_eq!(origin, Point2::new(0.0, 0.25));

        let center = lb.to_pixels(Point2::new(0.5, 0.5));
        assert_relative_eq!(center, Point2::new(100.0, 50.0));
    }

    #[test]
    fn letterbox_round_trip() {
        let lb = Letterbox::new(Resolution::new(640, 480));
        let p = Point2::new(123.5, 456.25);
        assert_relative_eq!(lb.to_pixels(lb.to_normalized(p)), p, epsilon = 1e-3);
    }
}
