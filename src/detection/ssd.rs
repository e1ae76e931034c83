//! SSD anchor grids.
//!
//! Palm detection networks predict one box per anchor. Anchors sit at the centers of the cells of
//! each output feature map, and all anchors of the palm models have unit size, so an anchor is
//! fully described by its center.

use std::ops::Index;

use nalgebra::Point2;

use crate::resolution::Resolution;

/// Reference point the network predicts a box relative to, in normalized input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    center: Point2<f32>,
}

impl Anchor {
    #[inline]
    pub fn x_center(&self) -> f32 {
        self.center.x
    }

    #[inline]
    pub fn y_center(&self) -> f32 {
        self.center.y
    }

    #[inline]
    pub fn center(&self) -> Point2<f32> {
        self.center
    }
}

/// One output feature map of an SSD network.
#[derive(Debug, Clone, Copy)]
pub struct LayerInfo {
    boxes_per_cell: u32,
    grid: Resolution,
}

impl LayerInfo {
    /// Describes a `width`x`height` feature map predicting `boxes_per_cell` boxes per cell.
    ///
    /// # Panics
    ///
    /// Panics if `boxes_per_cell` is zero.
    pub fn new(boxes_per_cell: u32, width: u32, height: u32) -> Self {
        assert!(boxes_per_cell > 0, "SSD layer without boxes");
        Self {
            boxes_per_cell,
            grid: Resolution::new(width, height),
        }
    }

    /// Number of anchors this layer contributes.
    pub fn anchor_count(&self) -> usize {
        self.boxes_per_cell as usize * self.grid.num_pixels() as usize
    }

    /// Anchors of this layer in network output order: row by row, then box by box.
    fn anchors(self) -> impl Iterator<Item = Anchor> {
        let (w, h) = (self.grid.width(), self.grid.height());
        (0..h).flat_map(move |row| {
            (0..w).flat_map(move |col| {
                let center = Point2::new(
                    (col as f32 + 0.5) / w as f32,
                    (row as f32 + 0.5) / h as f32,
                );
                (0..self.boxes_per_cell).map(move |_| Anchor { center })
            })
        })
    }
}

/// All anchors of a network, indexed like the network's outputs.
#[derive(Debug, Clone)]
pub struct Anchors {
    anchors: Vec<Anchor>,
}

impl Anchors {
    /// Lays out the anchors of all `layers`, in order.
    pub fn calculate(layers: &[LayerInfo]) -> Self {
        Self {
            anchors: layers.iter().flat_map(|layer| layer.anchors()).collect(),
        }
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Anchor> {
        self.anchors.iter()
    }
}

impl Index<usize> for Anchors {
    type Output = Anchor;

    fn index(&self, index: usize) -> &Anchor {
        &self.anchors[index]
    }
}
