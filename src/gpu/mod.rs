//! GPU-resident buffers.
//!
//! Every buffer the pipeline owns is a [`Buffer`]: a typed, fixed-length allocation on a
//! [`Device`] that is released when the [`Buffer`] is dropped. Writes and copies are queued on the
//! device and never wait for the GPU; only [`Buffer::read_back`] (meant for diagnostics and tests)
//! and [`Device::wait_idle`] block.
//!
//! Two devices are provided: [`Gpu`], backed by `wgpu`, and [`HostDevice`], which keeps buffers
//! in host memory and tracks live allocations.

mod backend;
mod host;
mod records;

use std::{fmt, marker::PhantomData, mem};

use bytemuck::Pod;

pub use backend::Gpu;
pub use host::{HostBuffer, HostDevice};
pub use records::{DetectionRecord, DrawIndirectArgs, RegionRecord};

/// What a buffer is going to be bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// A storage buffer that is written by the pipeline and read by shaders or other buffers.
    Storage,
    /// A buffer holding indirect draw arguments.
    Indirect,
}

/// Parameters for [`Device::create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    /// Size in bytes. Must be a multiple of 4.
    pub size: u64,
    pub kind: BufferKind,
}

/// A device that can allocate buffers and queue transfers between them.
///
/// Transfers submitted through the same device are applied in submission order.
pub trait Device {
    /// The device's untyped buffer handle. Dropping it releases the allocation.
    type Buffer;

    /// Allocates a zero-initialized buffer.
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer, AllocError>;

    /// Queues a write of `data` to `buffer` at byte `offset`.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]);

    /// Queues a device-side copy of `size` bytes from `src` to `dst`.
    fn copy_buffer(
        &self,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    );

    /// Reads back the full contents of `buffer`, waiting for all queued work to finish first.
    fn read_buffer(&self, buffer: &Self::Buffer) -> anyhow::Result<Vec<u8>>;

    /// Blocks until all submitted work has retired.
    fn wait_idle(&self);
}

/// A buffer allocation failed.
#[derive(Debug, Clone)]
pub struct AllocError {
    pub label: String,
    pub size: u64,
    pub reason: String,
}

impl AllocError {
    pub(crate) fn new(desc: &BufferDesc<'_>, reason: impl Into<String>) -> Self {
        Self {
            label: desc.label.to_string(),
            size: desc.size,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate buffer '{}' ({} bytes): {}",
            self.label, self.size, self.reason
        )
    }
}

impl std::error::Error for AllocError {}

/// A fixed-length, typed buffer living on a [`Device`].
///
/// The allocation is acquired in [`Buffer::new`] and released when the [`Buffer`] is dropped.
pub struct Buffer<D: Device, T> {
    raw: D::Buffer,
    len: usize,
    label: &'static str,
    _p: PhantomData<fn() -> T>,
}

impl<D: Device, T: Pod> Buffer<D, T> {
    /// Allocates a zero-initialized buffer holding `len` elements of `T`.
    pub fn new(
        device: &D,
        label: &'static str,
        len: usize,
        kind: BufferKind,
    ) -> Result<Self, AllocError> {
        let size = len
            .checked_mul(mem::size_of::<T>())
            .map(|size| size as u64)
            .ok_or_else(|| AllocError {
                label: label.to_string(),
                size: u64::MAX,
                reason: format!("{len} elements exceed the address space"),
            })?;
        let raw = device.create_buffer(&BufferDesc { label, size, kind })?;
        log::debug!("allocated buffer '{}' ({} x {} bytes)", label, len, mem::size_of::<T>());
        Ok(Self {
            raw,
            len,
            label,
            _p: PhantomData,
        })
    }

    /// Number of `T` elements the buffer holds.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        (self.len * mem::size_of::<T>()) as u64
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Returns the untyped device buffer, for binding it in a renderer.
    pub fn raw(&self) -> &D::Buffer {
        &self.raw
    }

    /// Queues a write of `data` to the start of the buffer.
    pub fn write(&self, device: &D, data: &[T]) {
        self.write_at(device, 0, data);
    }

    /// Queues a write of `data` starting at element `index`.
    ///
    /// # Panics
    ///
    /// Panics if the write would extend past the end of the buffer.
    #[track_caller]
    pub fn write_at(&self, device: &D, index: usize, data: &[T]) {
        assert!(
            index + data.len() <= self.len,
            "write of {} elements at {} overflows buffer '{}' of length {}",
            data.len(),
            index,
            self.label,
            self.len,
        );
        if data.is_empty() {
            return;
        }

        let offset = (index * mem::size_of::<T>()) as u64;
        device.write_buffer(&self.raw, offset, bytemuck::cast_slice(data));
    }

    /// Reads the buffer contents back to the host. Blocks until queued work has finished.
    pub fn read_back(&self, device: &D) -> anyhow::Result<Vec<T>> {
        let bytes = device.read_buffer(&self.raw)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

/// Allocates a zero-filled host-side staging vector of `len` elements.
///
/// Reports failure the same way a device allocation does, instead of aborting.
pub(crate) fn staging_vec<T: Pod>(label: &str, len: usize) -> Result<Vec<T>, AllocError> {
    let size = (len as u64).saturating_mul(mem::size_of::<T>() as u64);
    let mut vec = Vec::new();
    vec.try_reserve_exact(len).map_err(|e| AllocError {
        label: label.to_string(),
        size,
        reason: e.to_string(),
    })?;
    vec.resize(len, T::zeroed());
    Ok(vec)
}

impl<D: Device, T> Drop for Buffer<D, T> {
    fn drop(&mut self) {
        log::trace!("releasing buffer '{}'", self.label);
    }
}

impl<D: Device, T> fmt::Debug for Buffer<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .finish()
    }
}
