use anyhow::{anyhow, Result};
use std::num::NonZeroU64;
use std::sync::Arc;

use super::{RenderMode, RenderTargets, COLOR_FORMAT, DEPTH_FORMAT};
use crate::camera3d::Camera3D;
use crate::light::DirectionalLight;
use crate::mesh::{GpuMesh, MeshVertex};
use crate::scene::MeshInstance;

/// Bind group index of the per-draw uniform in both the shadow and forward pipelines.
pub const DRAW_GROUP: u32 = 1;

const AMBIENT: [f32; 4] = [0.08, 0.09, 0.1, 1.0];

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(super) struct FrameUniform {
    pub view_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub camera_pos: [f32; 4],
    pub sun_dir: [f32; 4],
    pub sun_color: [f32; 4],
    pub ambient: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(super) struct DrawUniform {
    pub model: [[f32; 4]; 4],
    pub base_color: [f32; 4],
}

/// One uniform slot per instance, bound with a dynamic offset so every pass of
/// the frame reads the model matrix written once at the start of the frame.
pub struct DrawUniforms {
    layout: Arc<wgpu::BindGroupLayout>,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    stride: u64,
    capacity: usize,
    staging: Vec<u8>,
}

impl DrawUniforms {
    pub fn new(device: &wgpu::Device) -> Self {
        let layout = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Draw Uniform BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(std::mem::size_of::<DrawUniform>() as u64),
                },
                count: None,
            }],
        }));
        let stride = uniform_stride::<DrawUniform>(device);
        let capacity = 64;
        let (buffer, bind_group) = Self::allocate(device, &layout, stride, capacity);
        Self { layout, buffer, bind_group, stride, capacity, staging: Vec::new() }
    }

    fn allocate(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        stride: u64,
        capacity: usize,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Draw Uniform Buffer"),
            size: stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Draw Uniform BG"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<DrawUniform>() as u64),
                }),
            }],
        });
        (buffer, bind_group)
    }

    pub fn layout(&self) -> &Arc<wgpu::BindGroupLayout> {
        &self.layout
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn offset(&self, index: usize) -> u32 {
        (index as u64 * self.stride) as u32
    }

    /// Uploads model matrix and colour for every instance, growing the buffer
    /// to the next power of two when needed.
    pub fn write(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, instances: &[MeshInstance]) {
        if instances.is_empty() {
            return;
        }
        if instances.len() > self.capacity {
            self.capacity = instances.len().next_power_of_two();
            let (buffer, bind_group) = Self::allocate(device, &self.layout, self.stride, self.capacity);
            self.buffer = buffer;
            self.bind_group = bind_group;
        }
        let stride = self.stride as usize;
        self.staging.clear();
        self.staging.resize(instances.len() * stride, 0);
        for (slot, instance) in self.staging.chunks_exact_mut(stride).zip(instances) {
            let uniform = DrawUniform {
                model: instance.model.to_cols_array_2d(),
                base_color: instance.color.extend(1.0).to_array(),
            };
            let bytes = bytemuck::bytes_of(&uniform);
            slot[..bytes.len()].copy_from_slice(bytes);
        }
        queue.write_buffer(&self.buffer, 0, &self.staging);
    }
}

pub(super) fn uniform_stride<T>(device: &wgpu::Device) -> u64 {
    let alignment = device.limits().min_uniform_buffer_offset_alignment.max(1) as u64;
    (std::mem::size_of::<T>() as u64).div_ceil(alignment) * alignment
}

/// Instances of a frame together with their GPU meshes and uniform slots.
pub struct DrawBatch<'a> {
    pub instances: &'a [MeshInstance],
    pub meshes: &'a [GpuMesh],
    pub uniforms: &'a DrawUniforms,
}

/// Records one indexed draw per instance accepted by `mode` and `accept`.
/// Returns the number of draws recorded.
pub fn draw_instances<F>(pass: &mut wgpu::RenderPass<'_>, batch: &DrawBatch<'_>, mode: RenderMode, mut accept: F) -> u32
where
    F: FnMut(&MeshInstance) -> bool,
{
    let mut drawn = 0;
    for (index, instance) in batch.instances.iter().enumerate() {
        if !mode.includes(instance) || !accept(instance) {
            continue;
        }
        let Some(mesh) = batch.meshes.get(instance.mesh.0) else {
            continue;
        };
        pass.set_bind_group(DRAW_GROUP, batch.uniforms.bind_group(), &[batch.uniforms.offset(index)]);
        pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
        pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        drawn += 1;
    }
    drawn
}

/// Forward colour pass: sun with cascaded shadows plus clustered point lights.
pub struct MeshPass {
    pipeline: wgpu::RenderPipeline,
    frame_buffer: wgpu::Buffer,
    frame_bind_group: wgpu::BindGroup,
}

pub struct ForwardBindings<'a> {
    pub clusters: &'a wgpu::BindGroup,
    pub shadows: &'a wgpu::BindGroup,
}

impl MeshPass {
    pub fn new(
        device: &wgpu::Device,
        draw_layout: &wgpu::BindGroupLayout,
        cluster_layout: &wgpu::BindGroupLayout,
        shadow_layout: &wgpu::BindGroupLayout,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Forward Clustered Shader"),
            source: wgpu::ShaderSource::Wgsl(
                concat!(
                    include_str!("../../assets/shaders/cluster_common.wgsl"),
                    include_str!("../../assets/shaders/forward_clustered.wgsl"),
                )
                .into(),
            ),
        });

        let frame_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Forward Frame BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Forward Pipeline Layout"),
            bind_group_layouts: &[&frame_bgl, draw_layout, cluster_layout, shadow_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Forward Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Forward Frame Buffer"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Forward Frame BG"),
            layout: &frame_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: frame_buffer.as_entire_binding() }],
        });

        Self { pipeline, frame_buffer, frame_bind_group }
    }

    pub fn write_frame(&self, queue: &wgpu::Queue, camera: &Camera3D, sun: &DirectionalLight) {
        let data = FrameUniform {
            view_proj: camera.gpu_view_projection().to_cols_array_2d(),
            view: camera.view_matrix().to_cols_array_2d(),
            camera_pos: camera.position.extend(1.0).to_array(),
            sun_dir: sun.normalized_direction().extend(0.0).to_array(),
            sun_color: sun.color.extend(1.0).to_array(),
            ambient: AMBIENT,
        };
        queue.write_buffer(&self.frame_buffer, 0, bytemuck::bytes_of(&data));
    }

    /// Clears the targets and draws every instance `accept` lets through in `mode`.
    pub fn draw<F>(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargets,
        batch: &DrawBatch<'_>,
        bindings: ForwardBindings<'_>,
        mode: RenderMode,
        accept: F,
    ) -> Result<u32>
    where
        F: FnMut(&MeshInstance) -> bool,
    {
        if batch.instances.len() > batch.uniforms.capacity() {
            return Err(anyhow!(
                "Draw uniforms hold {} slots for {} instances",
                batch.uniforms.capacity(),
                batch.instances.len()
            ));
        }
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Forward Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &targets.color_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r: 0.02, g: 0.02, b: 0.03, a: 1.0 }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &targets.depth_view,
                depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.frame_bind_group, &[]);
        pass.set_bind_group(2, bindings.clusters, &[]);
        pass.set_bind_group(3, bindings.shadows, &[]);
        Ok(draw_instances(&mut pass, batch, mode, accept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layouts_match_wgsl() {
        assert_eq!(std::mem::size_of::<FrameUniform>(), 192);
        assert_eq!(std::mem::size_of::<DrawUniform>(), 80);
    }
}
