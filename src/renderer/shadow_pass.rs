use anyhow::Result;
use log::debug;
use std::num::NonZeroU64;
use std::sync::Arc;

use super::mesh_pass::{draw_instances, uniform_stride, DrawBatch};
use super::{RenderMode, RenderSetupError, DEPTH_FORMAT, MAX_SHADOW_CASCADES, SHADOW_RESOLUTION_RANGE};
use crate::camera3d::{Camera3D, OPENGL_TO_WGPU_MATRIX};
use crate::cascades::{compute_cascade_splits, compute_cascades, ShadowCascade};
use crate::config::ShadowConfig;
use crate::culling::FrustumCulling;
use crate::geometry::Aabb;
use crate::light::DirectionalLight;

/// Per-cascade slot read by `shadow_depth.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CascadeUniform {
    light_view_proj: [[f32; 4]; 4],
}

/// Everything the forward shader needs to select and sample a cascade.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShadowUniform {
    pub light_view_proj: [[[f32; 4]; 4]; MAX_SHADOW_CASCADES],
    /// x = split far distance, y = world units per texel.
    pub cascade_params: [[f32; 4]; MAX_SHADOW_CASCADES],
    /// x = depth bias, y = cascade count.
    pub params: [f32; 4],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowPassStats {
    /// Shadow casters inside at least one cascade frustum.
    pub casters_visible: u32,
    /// Draw calls summed over all cascade layers.
    pub draws: u32,
}

struct ShadowMap {
    _texture: wgpu::Texture,
    array_view: wgpu::TextureView,
    layer_views: Vec<wgpu::TextureView>,
}

/// Owns the cascade depth array and the depth-only pipeline, fits the cascades
/// each frame and exposes them to culling and lighting.
pub struct ShadowManager {
    config: ShadowConfig,
    pipeline: wgpu::RenderPipeline,
    cascade_buffer: wgpu::Buffer,
    cascade_bind_group: wgpu::BindGroup,
    cascade_stride: u64,
    uniform_buffer: wgpu::Buffer,
    map: ShadowMap,
    sampler: wgpu::Sampler,
    sample_layout: Arc<wgpu::BindGroupLayout>,
    sample_bind_group: wgpu::BindGroup,
    splits: Vec<f32>,
    cascades: Vec<ShadowCascade>,
}

impl ShadowManager {
    /// Checks a shadow configuration against the device limits.
    pub fn validate(config: &ShadowConfig, limits: &wgpu::Limits) -> Result<(), RenderSetupError> {
        let count = config.cascade_count;
        if count == 0 {
            return Err(RenderSetupError::ZeroCascades);
        }
        if count as usize > MAX_SHADOW_CASCADES {
            return Err(RenderSetupError::TooManyCascades { requested: count, max: MAX_SHADOW_CASCADES as u32 });
        }
        let resolution = config.resolution;
        if !SHADOW_RESOLUTION_RANGE.contains(&resolution) {
            return Err(RenderSetupError::ShadowResolutionOutOfRange {
                resolution,
                min: *SHADOW_RESOLUTION_RANGE.start(),
                max: *SHADOW_RESOLUTION_RANGE.end(),
            });
        }
        if resolution > limits.max_texture_dimension_2d {
            return Err(RenderSetupError::ShadowResolutionAboveDeviceLimit {
                resolution,
                limit: limits.max_texture_dimension_2d,
            });
        }
        if count > limits.max_texture_array_layers {
            return Err(RenderSetupError::ArrayLayerLimit { requested: count, limit: limits.max_texture_array_layers });
        }
        Ok(())
    }

    pub fn new(device: &wgpu::Device, config: &ShadowConfig, draw_layout: &wgpu::BindGroupLayout) -> Result<Self> {
        Self::validate(config, &device.limits())?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Shadow Depth Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/shadow_depth.wgsl").into()),
        });

        let cascade_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Cascade BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(std::mem::size_of::<CascadeUniform>() as u64),
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shadow Pipeline Layout"),
            bind_group_layouts: &[&cascade_bgl, draw_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Shadow Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[crate::mesh::MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: None,
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let cascade_stride = uniform_stride::<CascadeUniform>(device);
        let cascade_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shadow Cascade Buffer"),
            size: cascade_stride * MAX_SHADOW_CASCADES as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let cascade_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Shadow Cascade BG"),
            layout: &cascade_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &cascade_buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<CascadeUniform>() as u64),
                }),
            }],
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Shadow Uniform Buffer"),
            size: std::mem::size_of::<ShadowUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Shadow Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            lod_min_clamp: 0.0,
            lod_max_clamp: 0.0,
            compare: Some(wgpu::CompareFunction::LessEqual),
            anisotropy_clamp: 1,
            border_color: None,
        });

        let sample_layout = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Sample BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2Array,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
                    count: None,
                },
            ],
        }));

        let map = create_shadow_map(device, config.cascade_count, config.resolution)?;
        let sample_bind_group = create_sample_bind_group(device, &sample_layout, &uniform_buffer, &map, &sampler);

        Ok(Self {
            config: config.clone(),
            pipeline,
            cascade_buffer,
            cascade_bind_group,
            cascade_stride,
            uniform_buffer,
            map,
            sampler,
            sample_layout,
            sample_bind_group,
            splits: Vec::new(),
            cascades: Vec::new(),
        })
    }

    /// Applies a new configuration, recreating the depth array when its size changed.
    pub fn reconfigure(&mut self, device: &wgpu::Device, config: &ShadowConfig) -> Result<()> {
        Self::validate(config, &device.limits())?;
        let needs_recreate =
            config.cascade_count != self.config.cascade_count || config.resolution != self.config.resolution;
        self.config = config.clone();
        if needs_recreate {
            self.map = create_shadow_map(device, config.cascade_count, config.resolution)?;
            self.sample_bind_group = create_sample_bind_group(
                device,
                &self.sample_layout,
                &self.uniform_buffer,
                &self.map,
                &self.sampler,
            );
            self.cascades.clear();
            self.splits.clear();
        }
        Ok(())
    }

    /// Fits this frame's cascades. The last split is `min(camera.far, shadow_distance)`.
    pub fn update_cascades(
        &mut self,
        camera: &Camera3D,
        sun: &DirectionalLight,
        object_bounds: &[Aabb],
    ) -> &[ShadowCascade] {
        let far = self.config.shadow_distance.map_or(camera.far, |distance| distance.min(camera.far)).max(camera.near);
        let light_view = sun.light_view(self.config.light_distance);
        self.splits = compute_cascade_splits(self.config.cascade_count, camera.near, far, self.config.split_lambda);
        self.cascades = compute_cascades(camera, light_view, self.config.resolution, &self.splits, object_bounds);
        &self.cascades
    }

    pub fn cascades(&self) -> &[ShadowCascade] {
        &self.cascades
    }

    pub fn splits(&self) -> &[f32] {
        &self.splits
    }

    pub fn cascade_count(&self) -> usize {
        self.config.cascade_count as usize
    }

    pub fn resolution(&self) -> u32 {
        self.config.resolution
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Layers in the current depth array.
    pub fn layer_count(&self) -> usize {
        self.map.layer_views.len()
    }

    pub fn layer_view(&self, cascade: usize) -> Option<&wgpu::TextureView> {
        self.map.layer_views.get(cascade)
    }

    pub fn sample_layout(&self) -> &Arc<wgpu::BindGroupLayout> {
        &self.sample_layout
    }

    pub fn sample_bind_group(&self) -> &wgpu::BindGroup {
        &self.sample_bind_group
    }

    /// Lighting uniform for the cascades fitted last.
    pub fn uniform(&self) -> ShadowUniform {
        let mut data = ShadowUniform {
            light_view_proj: [[[0.0; 4]; 4]; MAX_SHADOW_CASCADES],
            cascade_params: [[0.0; 4]; MAX_SHADOW_CASCADES],
            params: [self.config.depth_bias, self.cascades.len() as f32, 0.0, 0.0],
        };
        for (index, cascade) in self.cascades.iter().enumerate().take(MAX_SHADOW_CASCADES) {
            data.light_view_proj[index] = (OPENGL_TO_WGPU_MATRIX * cascade.light_space_matrix).to_cols_array_2d();
            data.cascade_params[index] = [cascade.far_split, cascade.texel_size, 0.0, 0.0];
        }
        data
    }

    /// Uploads the per-cascade render slots and the lighting uniform.
    pub fn write_uniforms(&self, queue: &wgpu::Queue) {
        let stride = self.cascade_stride as usize;
        let mut slots = vec![0u8; stride * MAX_SHADOW_CASCADES];
        let data = self.uniform();
        for (index, matrix) in data.light_view_proj.iter().enumerate().take(self.cascades.len()) {
            let slot = CascadeUniform { light_view_proj: *matrix };
            let bytes = bytemuck::bytes_of(&slot);
            slots[index * stride..index * stride + bytes.len()].copy_from_slice(bytes);
        }
        queue.write_buffer(&self.cascade_buffer, 0, &slots);
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&data));
    }

    /// Starts the depth pass of one cascade layer: depth cleared to 1.0 and
    /// viewport and scissor covering the full resolution.
    pub fn begin_cascade_pass<'e>(
        &self,
        encoder: &'e mut wgpu::CommandEncoder,
        cascade: usize,
    ) -> Result<wgpu::RenderPass<'e>, RenderSetupError> {
        let layer_view = self.layer_view(cascade).ok_or(RenderSetupError::MissingLayerView { cascade })?;
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Shadow Pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: layer_view,
                depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        let resolution = self.config.resolution;
        pass.set_viewport(0.0, 0.0, resolution as f32, resolution as f32, 0.0, 1.0);
        pass.set_scissor_rect(0, 0, resolution, resolution);
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.cascade_bind_group, &[(cascade as u64 * self.cascade_stride) as u32]);
        Ok(pass)
    }

    /// Renders every cascade layer with the depth-only pipeline. `culling` must be
    /// updated with this frame's cascades.
    pub fn render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        culling: &FrustumCulling,
        batch: &DrawBatch<'_>,
    ) -> Result<ShadowPassStats> {
        let mode = RenderMode::DepthOnly;
        let casters_visible = batch
            .instances
            .iter()
            .filter(|instance| mode.includes(instance) && culling.is_visible(&instance.bounds, instance.model))
            .count() as u32;
        let mut stats = ShadowPassStats { casters_visible, draws: 0 };
        for cascade in 0..self.cascades.len() {
            let mut pass = self.begin_cascade_pass(encoder, cascade)?;
            stats.draws += draw_instances(&mut pass, batch, mode, |instance| {
                culling.is_visible_in_cascade(cascade, &instance.bounds, instance.model)
            });
        }
        Ok(stats)
    }
}

fn create_shadow_map(device: &wgpu::Device, cascade_count: u32, resolution: u32) -> Result<ShadowMap> {
    let layers = cascade_count.max(1);
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Shadow Map"),
        size: wgpu::Extent3d { width: resolution, height: resolution, depth_or_array_layers: layers },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let array_view = texture.create_view(&wgpu::TextureViewDescriptor {
        label: Some("Shadow Map Array View"),
        format: Some(DEPTH_FORMAT),
        dimension: Some(wgpu::TextureViewDimension::D2Array),
        base_array_layer: 0,
        array_layer_count: Some(layers),
        ..Default::default()
    });
    let layer_views: Vec<wgpu::TextureView> = (0..layers)
        .map(|layer| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some("Shadow Map Cascade Layer"),
                format: Some(DEPTH_FORMAT),
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: layer,
                array_layer_count: Some(1),
                ..Default::default()
            })
        })
        .collect();
    if layer_views.len() != layers as usize {
        return Err(RenderSetupError::MissingLayerView { cascade: layer_views.len() }.into());
    }
    debug!("Shadow map created: {resolution}x{resolution}, {layers} cascade layer(s)");
    Ok(ShadowMap { _texture: texture, array_view, layer_views })
}

fn create_sample_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    uniform_buffer: &wgpu::Buffer,
    map: &ShadowMap,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Shadow Sample BG"),
        layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: uniform_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&map.array_view) },
            wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::Sampler(sampler) },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> wgpu::Limits {
        wgpu::Limits { max_texture_dimension_2d: 8192, max_texture_array_layers: 256, ..wgpu::Limits::default() }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(ShadowManager::validate(&ShadowConfig::default(), &limits()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_cascade_counts() {
        let zero = ShadowConfig { cascade_count: 0, ..ShadowConfig::default() };
        assert!(matches!(ShadowManager::validate(&zero, &limits()), Err(RenderSetupError::ZeroCascades)));
        let many = ShadowConfig { cascade_count: 5, ..ShadowConfig::default() };
        assert!(matches!(
            ShadowManager::validate(&many, &limits()),
            Err(RenderSetupError::TooManyCascades { requested: 5, .. })
        ));
        let layered = wgpu::Limits { max_texture_array_layers: 2, ..limits() };
        assert!(matches!(
            ShadowManager::validate(&ShadowConfig::default(), &layered),
            Err(RenderSetupError::ArrayLayerLimit { requested: 4, limit: 2 })
        ));
    }

    #[test]
    fn validate_rejects_bad_resolutions() {
        let small = ShadowConfig { resolution: 128, ..ShadowConfig::default() };
        assert!(matches!(
            ShadowManager::validate(&small, &limits()),
            Err(RenderSetupError::ShadowResolutionOutOfRange { resolution: 128, .. })
        ));
        let device_limited = wgpu::Limits { max_texture_dimension_2d: 2048, ..limits() };
        assert!(matches!(
            ShadowManager::validate(&ShadowConfig::default(), &device_limited),
            Err(RenderSetupError::ShadowResolutionAboveDeviceLimit { resolution: 4096, limit: 2048 })
        ));
    }

    #[test]
    fn shadow_uniform_matches_wgsl_layout() {
        assert_eq!(std::mem::size_of::<ShadowUniform>(), 336);
        assert_eq!(std::mem::size_of::<CascadeUniform>(), 64);
    }
}
