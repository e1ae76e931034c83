//! Plain-old-data records stored in GPU buffers.

use bytemuck::{Pod, Zeroable};

/// One detected palm, as stored in the detection buffer.
///
/// All coordinates are in normalized input space.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct DetectionRecord {
    pub center: [f32; 2],
    /// Width and height of the bounding box.
    pub extent: [f32; 2],
    pub keypoints: [[f32; 2]; 7],
    pub score: f32,
    pub _pad: [f32; 5],
}

/// The crop region currently fed to the landmark detector.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RegionRecord {
    /// Center X, center Y, side length, and rotation (radians).
    pub region: [f32; 4],
    /// Change of `region` since the previous frame.
    pub delta: [f32; 4],
    /// Column-major matrix mapping crop-local coordinates to normalized input space.
    pub crop_matrix: [[f32; 4]; 4],
}

/// Arguments of an indirect, non-indexed draw call.
///
/// This matches the layout expected by `wgpu::RenderPass::draw_indirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DrawIndirectArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawIndirectArgs {
    /// Byte offset of [`DrawIndirectArgs::instance_count`].
    pub const INSTANCE_COUNT_OFFSET: u64 = 4;

    /// Creates a draw with `vertex_count` vertices per instance and no instances.
    pub fn new(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count: 0,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(mem::size_of::<DetectionRecord>(), 96);
        assert_eq!(mem::size_of::<RegionRecord>(), 96);
        assert_eq!(mem::size_of::<DrawIndirectArgs>(), 16);

        let args = DrawIndirectArgs {
            instance_count: 0xAABBCCDD,
            ..DrawIndirectArgs::new(6)
        };
        let bytes = bytemuck::bytes_of(&args);
        let offset = DrawIndirectArgs::INSTANCE_COUNT_OFFSET as usize;
        assert_eq!(&bytes[offset..offset + 4], &0xAABBCCDDu32.to_ne_bytes());
    }
}
