use anyhow::{Context, Result};
use log::info;
use winit::dpi::PhysicalSize;

use super::{RenderSetupError, COLOR_FORMAT, DEPTH_FORMAT};

/// Device and queue for off-screen rendering plus the optional features the
/// visibility pipeline adapts to.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    timestamps_supported: bool,
    compute_supported: bool,
}

impl GpuContext {
    pub async fn headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request headless adapter")?;
        let adapter_info = adapter.get_info();
        let timestamps_supported = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let compute_supported =
            adapter.get_downlevel_capabilities().flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        let mut required_features = wgpu::Features::empty();
        if timestamps_supported {
            required_features |= wgpu::Features::TIMESTAMP_QUERY;
        }
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Visibility Device"),
            required_features,
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request headless device")?;
        info!(
            "GPU adapter '{}' ({:?}); timestamps: {}, compute: {}",
            adapter_info.name, adapter_info.backend, timestamps_supported, compute_supported
        );
        Ok(Self { device, queue, timestamps_supported, compute_supported })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn timestamps_supported(&self) -> bool {
        self.timestamps_supported
    }

    pub fn compute_supported(&self) -> bool {
        self.compute_supported
    }

    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }
}

/// Off-screen colour and depth attachments for the forward pass.
pub struct RenderTargets {
    pub color_texture: wgpu::Texture,
    pub color_view: wgpu::TextureView,
    pub depth_texture: wgpu::Texture,
    pub depth_view: wgpu::TextureView,
    size: PhysicalSize<u32>,
}

impl RenderTargets {
    pub fn new(device: &wgpu::Device, size: PhysicalSize<u32>) -> Result<Self> {
        if size.width == 0 || size.height == 0 {
            return Err(RenderSetupError::ZeroViewport { width: size.width, height: size.height }.into());
        }
        let color_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Headless Render Target"),
            size: wgpu::Extent3d { width: size.width, height: size.height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let (depth_texture, depth_view) = create_depth_texture(device, size);
        Ok(Self { color_texture, color_view, depth_texture, depth_view, size })
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }
}

pub(super) fn create_depth_texture(
    device: &wgpu::Device,
    size: PhysicalSize<u32>,
) -> (wgpu::Texture, wgpu::TextureView) {
    let extent =
        wgpu::Extent3d { width: size.width.max(1), height: size.height.max(1), depth_or_array_layers: 1 };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}
