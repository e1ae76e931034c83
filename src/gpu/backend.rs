//! The `wgpu`-backed [`Device`].

use std::sync::{mpsc, Arc};

use wgpu::{
    AdapterInfo, Backends, BufferDescriptor, BufferUsages, CommandEncoderDescriptor,
    DeviceDescriptor, ErrorFilter, Features, Limits, Maintain, MapMode,
};

use super::{AllocError, BufferDesc, BufferKind, Device};
use crate::error::Error;

/// A handle to a GPU.
///
/// Cloning a [`Gpu`] is cheap and yields a handle to the same device and queue.
#[derive(Clone)]
pub struct Gpu {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl Gpu {
    /// Opens a suitable default GPU.
    ///
    /// Fails with [`Error::Device`] if no adapter is available or the device cannot be created.
    pub async fn open() -> Result<Self, Error> {
        // The OpenGL backend panics spuriously, so don't enable it.
        let backends = Backends::PRIMARY;
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        log::info!("available graphics adapters:");
        for adapter in instance.enumerate_adapters(backends) {
            log_adapter("-", &adapter.get_info());
        }

        let adapter = instance
            .request_adapter(&Default::default())
            .await
            .ok_or_else(|| Error::Device("no graphics adapter found".into()))?;
        log_adapter("using", &adapter.get_info());
        log::debug!("adapter limits: {:?}", adapter.limits());

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("handpipe"),
                    features: Features::empty(),
                    limits: Limits::downlevel_defaults().using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| Error::Device(format!("failed to open device: {e}")))?;

        Ok(Self::from_wgpu(device, queue))
    }

    /// Opens a default GPU, blocking the calling thread until it is ready.
    pub fn open_blocking() -> Result<Self, Error> {
        pollster::block_on(Self::open())
    }

    /// Creates a [`Gpu`] handle from an existing [`wgpu::Device`] and [`wgpu::Queue`].
    ///
    /// Both can be passed wrapped in [`Arc`]s, which allows a renderer to share them.
    pub fn from_wgpu(
        device: impl Into<Arc<wgpu::Device>>,
        queue: impl Into<Arc<wgpu::Queue>>,
    ) -> Self {
        Self {
            device: device.into(),
            queue: queue.into(),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

impl Device for Gpu {
    type Buffer = wgpu::Buffer;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<wgpu::Buffer, AllocError> {
        let max = self.device.limits().max_buffer_size;
        if desc.size > max {
            return Err(AllocError::new(
                desc,
                format!("exceeds the device's maximum buffer size of {max} bytes"),
            ));
        }

        let usage = match desc.kind {
            BufferKind::Storage => {
                BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC
            }
            BufferKind::Indirect => {
                BufferUsages::INDIRECT
                    | BufferUsages::STORAGE
                    | BufferUsages::COPY_DST
                    | BufferUsages::COPY_SRC
            }
        };

        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());

        match oom.or(validation) {
            Some(err) => Err(AllocError::new(desc, err.to_string())),
            None => Ok(buffer),
        }
    }

    fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
        self.queue.write_buffer(buffer, offset, data);
    }

    fn copy_buffer(
        &self,
        src: &wgpu::Buffer,
        src_offset: u64,
        dst: &wgpu::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("copy_buffer"),
            });
        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
        self.queue.submit([encoder.finish()]);
    }

    fn read_buffer(&self, buffer: &wgpu::Buffer) -> anyhow::Result<Vec<u8>> {
        let size = buffer.size();
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("readback_staging"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("read_buffer"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit([encoder.finish()]);

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device.poll(Maintain::Wait);
        receiver.recv()??;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn wait_idle(&self) {
        self.device.poll(Maintain::Wait);
    }
}

fn log_adapter(prefix: &str, info: &AdapterInfo) {
    let backend = match info.backend {
        wgpu::Backend::Empty => "dummy",
        wgpu::Backend::Vulkan => "Vulkan",
        wgpu::Backend::Metal => "Metal",
        wgpu::Backend::Dx12 => "DX12",
        wgpu::Backend::Dx11 => "DX11",
        wgpu::Backend::Gl => "OpenGL",
        wgpu::Backend::BrowserWebGpu => "WebGPU",
    };
    let device_type = match info.device_type {
        wgpu::DeviceType::Other => "Unknown",
        wgpu::DeviceType::IntegratedGpu => "iGPU",
        wgpu::DeviceType::DiscreteGpu => "dGPU",
        wgpu::DeviceType::VirtualGpu => "vGPU",
        wgpu::DeviceType::Cpu => "CPU",
    };
    log::info!("{} [{}] [{}] {}", prefix, backend, device_type, info.name);
}
