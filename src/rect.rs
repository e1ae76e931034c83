//! Axis-aligned rectangles.

use std::fmt;

use nalgebra::{Point2, Vector2};

/// An axis-aligned rectangle, stored as center and size.
///
/// Rectangles are allowed to have zero height and/or width. Negative dimensions are not allowed.
#[derive(Clone, Copy, PartialEq)]
pub struct Rect {
    center: Point2<f32>,
    size: Vector2<f32>,
}

impl Rect {
    /// Creates a rectangle extending outwards from a center point.
    #[inline]
    pub fn from_center(x_center: f32, y_center: f32, width: f32, height: f32) -> Self {
        Self {
            center: Point2::new(x_center, y_center),
            size: Vector2::new(width.max(0.0), height.max(0.0)),
        }
    }

    /// Creates a rectangle extending downwards and right from a point.
    #[inline]
    pub fn from_top_left(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::from_center(x + width * 0.5, y + height * 0.5, width, height)
    }

    #[inline]
    pub fn center(&self) -> Point2<f32> {
        self.center
    }

    #[inline]
    pub fn x_center(&self) -> f32 {
        self.center.x
    }

    #[inline]
    pub fn y_center(&self) -> f32 {
        self.center.y
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.size.x
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.size.y
    }

    pub fn top_left(&self) -> Point2<f32> {
        self.center - self.size * 0.5
    }

    pub fn bottom_right(&self) -> Point2<f32> {
        self.center + self.size * 0.5
    }

    pub fn area(&self) -> f32 {
        self.size.x * self.size.y
    }

    /// Scales the width and height of `self` by `factor`, keeping the center in place.
    pub fn scale(&self, factor: f32) -> Self {
        Self::from_center(
            self.center.x,
            self.center.y,
            self.size.x * factor,
            self.size.y * factor,
        )
    }

    /// Computes the intersection of `self` and `other`.
    ///
    /// Returns [`None`] when the rectangles do not overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let min = self.top_left().sup(&other.top_left());
        let max = self.bottom_right().inf(&other.bottom_right());
        if min.x > max.x || min.y > max.y {
            return None;
        }

        Some(Rect::from_top_left(min.x, min.y, max.x - min.x, max.y - min.y))
    }

    fn intersection_area(&self, other: &Self) -> f32 {
        self.intersection(other).map_or(0.0, |rect| rect.area())
    }

    /// Computes the Intersection over Union (IoU) of `self` and `other`.
    ///
    /// Two degenerate (zero-area) rectangles have an IoU of 0.0.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect @ ({}, {}) {}x{}",
            self.center.x, self.center.y, self.size.x, self.size.y
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn iou_of_identical_rects_is_one() {
        let r = Rect::from_center(0.5, 0.5, 0.2, 0.3);
        assert_eq!(r.iou(&r), 1.0);
    }

    #[test]
    fn iou_of_disjoint_rects_is_zero() {
        let a = Rect::from_top_left(0.0, 0.0, 1.0, 1.0);
        let b = Rect::from_top_left(2.0, 0.0, 1.0, 1.0);
        assert!(a.intersection(&b).is_none());
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = Rect::from_top_left(0.0, 0.0, 2.0, 1.0);
        let b = Rect::from_top_left(1.0, 0.0, 2.0, 1.0);
        assert_relative_eq!(a.iou(&b), 1.0 / 3.0);
    }

    #[test]
    fn iou_of_empty_rects() {
        let a = Rect::from_center(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn scale_keeps_center() {
        let r = Rect::from_center(-1.0, 3.0, 1.0, 2.0).scale(4.0);
        assert_eq!(r.center(), Point2::new(-1.0, 3.0));
        assert_eq!(r.width(), 4.0);
        assert_eq!(r.height(), 8.0);
    }
}
