pub mod cluster_grid;
pub mod gpu_context;
pub mod gpu_timer;
pub mod light_clusters;
pub mod mesh_pass;
pub mod shadow_pass;

use anyhow::Result;
use log::debug;
use std::ops::RangeInclusive;
use thiserror::Error;

use crate::camera3d::Camera3D;
use crate::config::RendererConfig;
use crate::culling::{CullingMode, FrustumCulling};
use crate::mesh::GpuMesh;
use crate::scene::{MeshInstance, Scene};

pub use cluster_grid::{ClusterCullStats, ClusterGpu, ClusterGrid, ClusterParams, CLUSTER_COUNT, MAX_LIGHTS_PER_CLUSTER};
pub use gpu_context::{GpuContext, RenderTargets};
pub use gpu_timer::{ClusterTimings, GpuPassSummary, GpuTimingAccumulator};
pub use light_clusters::{ClusterComputeParams, ClusterFrameStats, ClusteredShading};
pub use mesh_pass::{DrawBatch, DrawUniforms, ForwardBindings, MeshPass};
pub use shadow_pass::{ShadowManager, ShadowPassStats, ShadowUniform};

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub const MAX_SHADOW_CASCADES: usize = 4;
pub const SHADOW_RESOLUTION_RANGE: RangeInclusive<u32> = 256..=8192;

/// Render-target and device configuration problems detected at setup time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderSetupError {
    #[error("shadow cascade count must be at least 1")]
    ZeroCascades,
    #[error("{requested} shadow cascades requested; at most {max} are supported")]
    TooManyCascades { requested: u32, max: u32 },
    #[error("shadow resolution {resolution} outside [{min}, {max}]")]
    ShadowResolutionOutOfRange { resolution: u32, min: u32, max: u32 },
    #[error("shadow resolution {resolution} exceeds the device 2D texture limit {limit}")]
    ShadowResolutionAboveDeviceLimit { resolution: u32, limit: u32 },
    #[error("{requested} shadow layers exceed the device array layer limit {limit}")]
    ArrayLayerLimit { requested: u32, limit: u32 },
    #[error("shadow map has no layer view for cascade {cascade}")]
    MissingLayerView { cascade: usize },
    #[error("{max_lights} lights need {required} bytes of storage; the device binds at most {available}")]
    LightBudgetExceeded { max_lights: u32, required: u64, available: u64 },
    #[error("clustered lighting needs {required} storage buffers per stage; the device allows {available}")]
    StorageBufferLimit { required: u32, available: u32 },
    #[error("viewport {width}x{height} has a zero dimension")]
    ZeroViewport { width: u32, height: u32 },
}

/// What a draw submission writes. Replaces a global material override: the
/// depth-only mode draws shadow casters with the depth pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderMode {
    Color,
    DepthOnly,
}

impl RenderMode {
    pub fn includes(self, instance: &MeshInstance) -> bool {
        match self {
            RenderMode::Color => true,
            RenderMode::DepthOnly => instance.casts_shadows,
        }
    }

    pub fn culling_mode(self) -> CullingMode {
        match self {
            RenderMode::Color => CullingMode::Camera,
            RenderMode::DepthOnly => CullingMode::Shadow,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub instances: u32,
    pub camera_visible: u32,
    pub shadow_casters_visible: u32,
    pub shadow_draws: u32,
    pub lights: u32,
    pub lights_dropped: u32,
    /// Last completed GPU measurement of the cluster passes, possibly from an earlier frame.
    pub cluster_timings: Option<ClusterTimings>,
    pub cpu_clusters: Option<ClusterCullStats>,
}

/// Owns every pass and encodes one frame: cascade fitting and culling update,
/// cascade depth passes, cluster gather and cull, then the forward pass.
pub struct FrameRenderer {
    culling: FrustumCulling,
    draw_uniforms: DrawUniforms,
    shadows: ShadowManager,
    clusters: ClusteredShading,
    mesh_pass: MeshPass,
    meshes: Vec<GpuMesh>,
    timing: GpuTimingAccumulator,
}

impl FrameRenderer {
    pub fn new(gpu: &GpuContext, config: &RendererConfig) -> Result<Self> {
        let device = gpu.device();
        let draw_uniforms = DrawUniforms::new(device);
        let shadows = ShadowManager::new(device, &config.shadow, draw_uniforms.layout())?;
        let clusters = ClusteredShading::new(gpu, &config.clusters)?;
        let mesh_pass =
            MeshPass::new(device, draw_uniforms.layout(), clusters.fragment_layout(), shadows.sample_layout());
        Ok(Self {
            culling: FrustumCulling::new(config.culling.enabled),
            draw_uniforms,
            shadows,
            clusters,
            mesh_pass,
            meshes: Vec::new(),
            timing: GpuTimingAccumulator::default(),
        })
    }

    pub fn culling(&self) -> &FrustumCulling {
        &self.culling
    }

    pub fn culling_mut(&mut self) -> &mut FrustumCulling {
        &mut self.culling
    }

    pub fn shadows(&self) -> &ShadowManager {
        &self.shadows
    }

    pub fn shadows_mut(&mut self) -> &mut ShadowManager {
        &mut self.shadows
    }

    pub fn clusters(&self) -> &ClusteredShading {
        &self.clusters
    }

    pub fn timing_summary(&self) -> Vec<GpuPassSummary> {
        self.timing.summary()
    }

    /// Uploads scene meshes added since the last call.
    pub fn upload_meshes(&mut self, device: &wgpu::Device, scene: &Scene) {
        let start = self.meshes.len();
        for (index, mesh) in scene.meshes().iter().enumerate().skip(start) {
            self.meshes.push(GpuMesh::upload(device, mesh, &format!("Mesh {index}")));
        }
        if self.meshes.len() > start {
            debug!("Uploaded {} mesh(es)", self.meshes.len() - start);
        }
    }

    pub fn render_frame(
        &mut self,
        gpu: &GpuContext,
        scene: &Scene,
        camera: &Camera3D,
        targets: &RenderTargets,
    ) -> Result<FrameStats> {
        let device = gpu.device();
        let queue = gpu.queue();
        if let Some(timings) = self.clusters.poll_timings(device) {
            self.timing.record_frame(&timings.as_pass_timings());
        }
        self.upload_meshes(device, scene);

        let object_bounds = scene.all_object_bounds();
        let cascades = self.shadows.update_cascades(camera, scene.sun(), &object_bounds);
        self.culling.update(camera, cascades);
        self.shadows.write_uniforms(queue);
        self.draw_uniforms.write(device, queue, scene.instances());
        self.mesh_pass.write_frame(queue, camera, scene.sun());

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Visibility Frame Encoder") });
        let batch = DrawBatch { instances: scene.instances(), meshes: &self.meshes, uniforms: &self.draw_uniforms };

        self.culling.set_mode(RenderMode::DepthOnly.culling_mode());
        let shadow_stats = self.shadows.render(&mut encoder, &self.culling, &batch)?;

        let cluster_stats = self.clusters.compute(ClusterComputeParams {
            device,
            queue,
            encoder: &mut encoder,
            camera,
            viewport: targets.size(),
            lights: scene.point_lights(),
        })?;

        self.culling.set_mode(RenderMode::Color.culling_mode());
        let culling = &self.culling;
        let camera_visible = self.mesh_pass.draw(
            &mut encoder,
            targets,
            &batch,
            ForwardBindings { clusters: self.clusters.fragment_bind_group(), shadows: self.shadows.sample_bind_group() },
            RenderMode::Color,
            |instance| culling.is_visible(&instance.bounds, instance.model),
        )?;

        queue.submit(Some(encoder.finish()));
        self.clusters.after_submit();

        Ok(FrameStats {
            instances: scene.instances().len() as u32,
            camera_visible,
            shadow_casters_visible: shadow_stats.casters_visible,
            shadow_draws: shadow_stats.draws,
            lights: cluster_stats.lights_uploaded,
            lights_dropped: cluster_stats.lights_dropped,
            cluster_timings: self.clusters.last_timings(),
            cpu_clusters: cluster_stats.cpu_cull,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Aabb, BoundingSphere};
    use crate::mesh::MeshBounds;
    use crate::scene::MeshHandle;
    use glam::{Mat4, Vec3};

    fn instance(casts_shadows: bool) -> MeshInstance {
        MeshInstance {
            mesh: MeshHandle(0),
            bounds: MeshBounds {
                aabb: Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)),
                sphere: BoundingSphere::new(Vec3::ZERO, 0.87),
            },
            model: Mat4::IDENTITY,
            color: Vec3::ONE,
            casts_shadows,
        }
    }

    #[test]
    fn depth_only_mode_skips_non_casters() {
        assert!(RenderMode::DepthOnly.includes(&instance(true)));
        assert!(!RenderMode::DepthOnly.includes(&instance(false)));
        assert!(RenderMode::Color.includes(&instance(false)));
    }

    #[test]
    fn render_modes_select_culling_frusta() {
        assert_eq!(RenderMode::Color.culling_mode(), CullingMode::Camera);
        assert_eq!(RenderMode::DepthOnly.culling_mode(), CullingMode::Shadow);
    }

    #[test]
    fn setup_errors_describe_the_limit() {
        let err = RenderSetupError::TooManyCascades { requested: 6, max: 4 };
        assert_eq!(err.to_string(), "6 shadow cascades requested; at most 4 are supported");
    }
}
