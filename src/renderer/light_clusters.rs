use anyhow::{anyhow, ensure, Result};
use log::{debug, warn};
use std::sync::Arc;
use winit::dpi::PhysicalSize;

use super::cluster_grid::{
    ClusterCullStats, ClusterDispatchState, ClusterGpu, ClusterGrid, ClusterParams, ClusterParamsGpu, ClusterStage,
    CullParamsGpu, CLUSTER_COUNT, CULL_WORKGROUP_SIZE, GRID_X, GRID_Y, GRID_Z,
};
use super::gpu_context::GpuContext;
use super::gpu_timer::{ClusterTimings, GpuPassTimer, CULL_PASS_LABEL, GATHER_PASS_LABEL};
use super::RenderSetupError;
use crate::camera3d::Camera3D;
use crate::config::ClusterConfig;
use crate::light::{PointLight, PointLightGpu};

/// Storage buffers the forward fragment stage binds (clusters and lights).
const FRAGMENT_STORAGE_BUFFERS: u32 = 2;
const INITIAL_LIGHT_CAPACITY: u32 = 64;

pub struct ClusterComputeParams<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub encoder: &'a mut wgpu::CommandEncoder,
    pub camera: &'a Camera3D,
    pub viewport: PhysicalSize<u32>,
    pub lights: &'a [PointLight],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterFrameStats {
    pub lights_uploaded: u32,
    pub lights_dropped: u32,
    /// Set when the grid was built by `ClusterGrid` instead of the compute kernels.
    pub cpu_cull: Option<ClusterCullStats>,
}

struct ComputeResources {
    gather_pipeline: wgpu::ComputePipeline,
    cull_pipeline: wgpu::ComputePipeline,
    gather_bind_group: wgpu::BindGroup,
    cull_layout: wgpu::BindGroupLayout,
    cull_bind_group: wgpu::BindGroup,
}

/// Builds the per-cluster light lists for the forward pass: two compute
/// dispatches when the device supports them, the CPU grid otherwise.
pub struct ClusteredShading {
    compute: Option<ComputeResources>,
    cpu_grid: Option<ClusterGrid>,
    params_buffer: wgpu::Buffer,
    cull_params_buffer: wgpu::Buffer,
    cluster_buffer: wgpu::Buffer,
    light_buffer: wgpu::Buffer,
    light_capacity: u32,
    max_lights: u32,
    fragment_layout: Arc<wgpu::BindGroupLayout>,
    fragment_bind_group: wgpu::BindGroup,
    timer: Option<GpuPassTimer>,
    light_staging: Vec<PointLightGpu>,
    truncation_warned: bool,
    dispatch: ClusterDispatchState,
}

impl ClusteredShading {
    pub fn validate(config: &ClusterConfig, limits: &wgpu::Limits) -> Result<(), RenderSetupError> {
        let required = config.max_lights as u64 * std::mem::size_of::<PointLightGpu>() as u64;
        let available = limits.max_storage_buffer_binding_size as u64;
        if required > available {
            return Err(RenderSetupError::LightBudgetExceeded { max_lights: config.max_lights, required, available });
        }
        if limits.max_storage_buffers_per_shader_stage < FRAGMENT_STORAGE_BUFFERS {
            return Err(RenderSetupError::StorageBufferLimit {
                required: FRAGMENT_STORAGE_BUFFERS,
                available: limits.max_storage_buffers_per_shader_stage,
            });
        }
        Ok(())
    }

    pub fn new(gpu: &GpuContext, config: &ClusterConfig) -> Result<Self> {
        Self::with_options(gpu.device(), gpu.queue(), config, gpu.compute_supported(), gpu.timestamps_supported())
    }

    pub fn with_options(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        config: &ClusterConfig,
        use_compute: bool,
        use_timestamps: bool,
    ) -> Result<Self> {
        Self::validate(config, &device.limits())?;

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cluster Params Buffer"),
            size: std::mem::size_of::<ClusterParamsGpu>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let cull_params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cluster Cull Params Buffer"),
            size: std::mem::size_of::<CullParamsGpu>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let cluster_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cluster Buffer"),
            size: (CLUSTER_COUNT * std::mem::size_of::<ClusterGpu>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let max_lights = config.max_lights.max(1);
        let light_capacity = INITIAL_LIGHT_CAPACITY.min(max_lights);
        let light_buffer = create_light_buffer(device, light_capacity);

        let fragment_layout = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Cluster Fragment BGL"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::FRAGMENT),
                storage_entry(1, wgpu::ShaderStages::FRAGMENT, true),
                storage_entry(2, wgpu::ShaderStages::FRAGMENT, true),
            ],
        }));
        let fragment_bind_group = create_three_buffer_bind_group(
            device,
            "Cluster Fragment BG",
            &fragment_layout,
            [&params_buffer, &cluster_buffer, &light_buffer],
        );

        let compute = if use_compute {
            Some(create_compute_resources(device, &params_buffer, &cull_params_buffer, &cluster_buffer, &light_buffer))
        } else {
            debug!("Compute shaders unavailable; clusters are built on the CPU");
            None
        };
        let cpu_grid = if compute.is_none() { Some(ClusterGrid::new()) } else { None };
        let timer = (use_compute && use_timestamps).then(|| GpuPassTimer::new(device, queue));

        Ok(Self {
            compute,
            cpu_grid,
            params_buffer,
            cull_params_buffer,
            cluster_buffer,
            light_buffer,
            light_capacity,
            max_lights,
            fragment_layout,
            fragment_bind_group,
            timer,
            light_staging: Vec::new(),
            truncation_warned: false,
            dispatch: ClusterDispatchState::new(),
        })
    }

    pub fn fragment_layout(&self) -> &Arc<wgpu::BindGroupLayout> {
        &self.fragment_layout
    }

    pub fn fragment_bind_group(&self) -> &wgpu::BindGroup {
        &self.fragment_bind_group
    }

    pub fn cluster_buffer(&self) -> &wgpu::Buffer {
        &self.cluster_buffer
    }

    pub fn light_buffer(&self) -> &wgpu::Buffer {
        &self.light_buffer
    }

    pub fn light_capacity(&self) -> u32 {
        self.light_capacity
    }

    pub fn uses_compute(&self) -> bool {
        self.compute.is_some()
    }

    /// Stages encoded by the last `compute` on the GPU path.
    pub fn dispatch_state(&self) -> &ClusterDispatchState {
        &self.dispatch
    }

    /// CPU grid of the last frame when the fallback path is active.
    pub fn cpu_grid(&self) -> Option<&ClusterGrid> {
        self.cpu_grid.as_ref()
    }

    /// Uploads lights and parameters, then encodes gather, barrier, cull, barrier.
    pub fn compute(&mut self, params: ClusterComputeParams<'_>) -> Result<ClusterFrameStats> {
        let ClusterComputeParams { device, queue, encoder, camera, viewport, lights } = params;

        let light_count = lights.len().min(self.max_lights as usize);
        let lights_dropped = (lights.len() - light_count) as u32;
        if lights_dropped > 0 && !self.truncation_warned {
            warn!(
                "{} point lights exceed the storage budget of {}; {} ignored",
                lights.len(),
                self.max_lights,
                lights_dropped
            );
            self.truncation_warned = true;
        }
        let lights = &lights[..light_count];
        self.ensure_light_capacity(device, light_count as u32);
        if !lights.is_empty() {
            self.light_staging.clear();
            self.light_staging.extend(lights.iter().map(PointLight::to_gpu));
            queue.write_buffer(&self.light_buffer, 0, bytemuck::cast_slice(&self.light_staging));
        }

        let cluster_params = ClusterParams::from_camera(camera, viewport);
        let view = camera.view_matrix();
        queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&cluster_params.to_gpu()));
        let cull_params =
            CullParamsGpu { view: view.to_cols_array_2d(), light_count: light_count as u32, _padding: [0; 3] };
        queue.write_buffer(&self.cull_params_buffer, 0, bytemuck::bytes_of(&cull_params));

        let mut stats = ClusterFrameStats { lights_uploaded: light_count as u32, lights_dropped, cpu_cull: None };
        self.dispatch.reset();
        match (self.compute.as_ref(), self.cpu_grid.as_mut()) {
            (Some(resources), _) => {
                if let Some(timer) = self.timer.as_mut() {
                    timer.begin_frame();
                }
                encode_cluster_passes(encoder, resources, self.timer.as_ref(), &mut self.dispatch)?;
                if let Some(timer) = self.timer.as_ref() {
                    timer.resolve(encoder);
                }
            }
            (None, Some(grid)) => {
                grid.gather(&cluster_params);
                stats.cpu_cull = Some(grid.cull(lights, view));
                queue.write_buffer(&self.cluster_buffer, 0, bytemuck::cast_slice(&grid.to_gpu()));
            }
            (None, None) => return Err(anyhow!("Cluster resources missing")),
        }
        Ok(stats)
    }

    /// Call once the command buffer holding this frame's cluster passes was submitted.
    pub fn after_submit(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.after_submit();
        }
    }

    /// Non-blocking; returns the most recent completed timestamp readback.
    pub fn poll_timings(&mut self, device: &wgpu::Device) -> Option<ClusterTimings> {
        self.timer.as_mut().and_then(|timer| timer.poll(device))
    }

    pub fn last_timings(&self) -> Option<ClusterTimings> {
        self.timer.as_ref().and_then(GpuPassTimer::latest)
    }

    pub fn gather_time_ms(&self) -> Option<f32> {
        self.last_timings().map(|timings| timings.gather_ms)
    }

    pub fn cull_time_ms(&self) -> Option<f32> {
        self.last_timings().map(|timings| timings.cull_ms)
    }

    fn ensure_light_capacity(&mut self, device: &wgpu::Device, required: u32) {
        if required <= self.light_capacity {
            return;
        }
        let capacity = required.next_power_of_two().min(self.max_lights);
        debug!("Growing point light buffer from {} to {} lights", self.light_capacity, capacity);
        self.light_capacity = capacity;
        self.light_buffer = create_light_buffer(device, capacity);
        self.fragment_bind_group = create_three_buffer_bind_group(
            device,
            "Cluster Fragment BG",
            &self.fragment_layout,
            [&self.params_buffer, &self.cluster_buffer, &self.light_buffer],
        );
        if let Some(resources) = self.compute.as_mut() {
            resources.cull_bind_group = create_three_buffer_bind_group(
                device,
                "Cluster Cull BG",
                &resources.cull_layout,
                [&self.cull_params_buffer, &self.cluster_buffer, &self.light_buffer],
            );
        }
    }
}

fn encode_cluster_passes(
    encoder: &mut wgpu::CommandEncoder,
    resources: &ComputeResources,
    timer: Option<&GpuPassTimer>,
    state: &mut ClusterDispatchState,
) -> Result<()> {
    state.run(ClusterStage::Gather, || {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(GATHER_PASS_LABEL),
            timestamp_writes: timer.and_then(|timer| timer.pass_writes(0)),
        });
        pass.set_pipeline(&resources.gather_pipeline);
        pass.set_bind_group(0, &resources.gather_bind_group, &[]);
        pass.dispatch_workgroups(GRID_X, GRID_Y, GRID_Z);
    })?;
    // Ending the pass makes the bounds visible to the next dispatch.
    state.record(ClusterStage::GatherBarrier)?;

    state.run(ClusterStage::Cull, || {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(CULL_PASS_LABEL),
            timestamp_writes: timer.and_then(|timer| timer.pass_writes(1)),
        });
        pass.set_pipeline(&resources.cull_pipeline);
        pass.set_bind_group(0, &resources.cull_bind_group, &[]);
        pass.dispatch_workgroups((CLUSTER_COUNT as u32).div_ceil(CULL_WORKGROUP_SIZE), 1, 1);
    })?;
    state.record(ClusterStage::CullBarrier)?;

    ensure!(state.is_complete(), "Cluster passes were not fully encoded");
    Ok(())
}

fn create_compute_resources(
    device: &wgpu::Device,
    params_buffer: &wgpu::Buffer,
    cull_params_buffer: &wgpu::Buffer,
    cluster_buffer: &wgpu::Buffer,
    light_buffer: &wgpu::Buffer,
) -> ComputeResources {
    let gather_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Cluster Gather Shader"),
        source: wgpu::ShaderSource::Wgsl(
            concat!(
                include_str!("../../assets/shaders/cluster_common.wgsl"),
                include_str!("../../assets/shaders/gather_clusters.wgsl"),
            )
            .into(),
        ),
    });
    let cull_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Cluster Cull Shader"),
        source: wgpu::ShaderSource::Wgsl(
            concat!(
                include_str!("../../assets/shaders/cluster_common.wgsl"),
                include_str!("../../assets/shaders/cull_lights.wgsl"),
            )
            .into(),
        ),
    });

    let gather_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Cluster Gather BGL"),
        entries: &[uniform_entry(0, wgpu::ShaderStages::COMPUTE), storage_entry(1, wgpu::ShaderStages::COMPUTE, false)],
    });
    let cull_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Cluster Cull BGL"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::COMPUTE),
            storage_entry(1, wgpu::ShaderStages::COMPUTE, false),
            storage_entry(2, wgpu::ShaderStages::COMPUTE, true),
        ],
    });

    let gather_pipeline = create_compute_pipeline(device, "Cluster Gather", &gather_layout, &gather_shader);
    let cull_pipeline = create_compute_pipeline(device, "Cluster Cull", &cull_layout, &cull_shader);

    let gather_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Cluster Gather BG"),
        layout: &gather_layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: params_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: cluster_buffer.as_entire_binding() },
        ],
    });
    let cull_bind_group = create_three_buffer_bind_group(
        device,
        "Cluster Cull BG",
        &cull_layout,
        [cull_params_buffer, cluster_buffer, light_buffer],
    );

    ComputeResources { gather_pipeline, cull_pipeline, gather_bind_group, cull_layout, cull_bind_group }
}

fn create_compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    module: &wgpu::ShaderModule,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{label} Pipeline Layout")),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&format!("{label} Pipeline")),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some("main"),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    })
}

fn create_light_buffer(device: &wgpu::Device, capacity: u32) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Point Light Buffer"),
        size: capacity.max(1) as u64 * std::mem::size_of::<PointLightGpu>() as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn create_three_buffer_bind_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    buffers: [&wgpu::Buffer; 3],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry { binding: binding as u32, resource: buffer.as_entire_binding() })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor { label: Some(label), layout, entries: &entries })
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_light_budget_over_binding_size() {
        let limits = wgpu::Limits { max_storage_buffer_binding_size: 48 * 16, ..wgpu::Limits::default() };
        let ok = ClusterConfig { max_lights: 16 };
        assert!(ClusteredShading::validate(&ok, &limits).is_ok());
        let too_many = ClusterConfig { max_lights: 17 };
        assert!(matches!(
            ClusteredShading::validate(&too_many, &limits),
            Err(RenderSetupError::LightBudgetExceeded { max_lights: 17, required: 816, available: 768 })
        ));
    }

    #[test]
    fn validate_requires_fragment_storage_buffers() {
        let limits = wgpu::Limits { max_storage_buffers_per_shader_stage: 1, ..wgpu::Limits::default() };
        assert!(matches!(
            ClusteredShading::validate(&ClusterConfig::default(), &limits),
            Err(RenderSetupError::StorageBufferLimit { required: 2, available: 1 })
        ));
    }
}
