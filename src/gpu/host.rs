//! A [`Device`] that keeps buffers in host memory.

use std::{
    ptr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use super::{AllocError, BufferDesc, Device};

#[derive(Default)]
struct Stats {
    live_buffers: AtomicUsize,
    live_bytes: AtomicU64,
}

/// Host-memory implementation of [`Device`].
///
/// All operations complete immediately. The device counts live allocations, and can be given a
/// byte budget that makes [`Device::create_buffer`] fail once exceeded.
///
/// Cloning a [`HostDevice`] yields a handle to the same allocation statistics.
#[derive(Clone, Default)]
pub struct HostDevice {
    stats: Arc<Stats>,
    budget: Option<u64>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device that refuses allocations that would bring the live byte count above
    /// `bytes`.
    pub fn with_budget(bytes: u64) -> Self {
        Self {
            stats: Arc::default(),
            budget: Some(bytes),
        }
    }

    /// Returns the number of buffers that are currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.stats.live_buffers.load(Ordering::Acquire)
    }

    /// Returns the total size of all buffers that are currently allocated.
    pub fn live_bytes(&self) -> u64 {
        self.stats.live_bytes.load(Ordering::Acquire)
    }
}

/// Buffer of a [`HostDevice`].
pub struct HostBuffer {
    data: Mutex<Vec<u8>>,
    stats: Arc<Stats>,
}

impl HostBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> u64 {
        self.lock().len() as u64
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let size = self.data.get_mut().unwrap_or_else(PoisonError::into_inner).len();
        self.stats.live_buffers.fetch_sub(1, Ordering::AcqRel);
        self.stats.live_bytes.fetch_sub(size as u64, Ordering::AcqRel);
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<HostBuffer, AllocError> {
        if desc.size % 4 != 0 {
            return Err(AllocError::new(desc, "size is not a multiple of 4"));
        }
        if let Some(budget) = self.budget {
            let live = self.live_bytes();
            if live + desc.size > budget {
                return Err(AllocError::new(
                    desc,
                    format!("budget of {budget} bytes exceeded ({live} bytes in use)"),
                ));
            }
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| AllocError::new(desc, "size exceeds address space"))?;

        self.stats.live_buffers.fetch_add(1, Ordering::AcqRel);
        self.stats.live_bytes.fetch_add(desc.size, Ordering::AcqRel);
        Ok(HostBuffer {
            data: Mutex::new(vec![0; len]),
            stats: self.stats.clone(),
        })
    }

    fn write_buffer(&self, buffer: &HostBuffer, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        buffer.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn copy_buffer(
        &self,
        src: &HostBuffer,
        src_offset: u64,
        dst: &HostBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let (src_offset, dst_offset, size) =
            (src_offset as usize, dst_offset as usize, size as usize);
        if ptr::eq(src, dst) {
            src.lock()
                .copy_within(src_offset..src_offset + size, dst_offset);
            return;
        }

        let src = src.lock();
        dst.lock()[dst_offset..dst_offset + size]
            .copy_from_slice(&src[src_offset..src_offset + size]);
    }

    fn read_buffer(&self, buffer: &HostBuffer) -> anyhow::Result<Vec<u8>> {
        Ok(buffer.lock().clone())
    }

    fn wait_idle(&self) {}
}
