use glam::{UVec3, Vec3};
use kestrel_visibility::camera3d::{Camera3D, OrbitCamera};
use kestrel_visibility::config::{ClusterConfig, RendererConfig};
use kestrel_visibility::light::PointLight;
use kestrel_visibility::renderer::{
    ClusterComputeParams, ClusterGpu, ClusterGrid, ClusterParams, ClusteredShading, FrameRenderer, GpuContext,
    RenderTargets, CLUSTER_COUNT, MAX_LIGHTS_PER_CLUSTER,
};
use kestrel_visibility::scene::Scene;
use winit::dpi::PhysicalSize;

fn gpu() -> Option<GpuContext> {
    match pollster::block_on(GpuContext::headless()) {
        Ok(gpu) => Some(gpu),
        Err(err) => {
            eprintln!("skipping GPU test: {err:?}");
            None
        }
    }
}

fn small_config() -> RendererConfig {
    let mut config = RendererConfig::default();
    config.viewport.width = 160;
    config.viewport.height = 90;
    config.shadow.resolution = 512;
    config.clusters.max_lights = 64;
    config
}

fn orbit_camera(size: PhysicalSize<u32>) -> Camera3D {
    let mut camera = Camera3D::new(
        Vec3::new(0.0, 10.0, 20.0),
        Vec3::ZERO,
        60f32.to_radians(),
        size.width as f32 / size.height as f32,
        0.1,
        120.0,
    );
    let mut orbit = OrbitCamera::new(Vec3::ZERO, 24.0);
    orbit.pitch_radians = -0.5;
    orbit.apply(&mut camera);
    camera
}

#[test]
fn demo_scene_renders_several_frames() {
    let Some(gpu) = gpu() else { return };
    let config = small_config();
    let size = PhysicalSize::new(config.viewport.width, config.viewport.height);
    let targets = RenderTargets::new(gpu.device(), size).expect("targets");
    let mut renderer = FrameRenderer::new(&gpu, &config).expect("renderer");
    let scene = Scene::demo(3, 6);
    let camera = orbit_camera(size);

    for _ in 0..3 {
        let stats = renderer.render_frame(&gpu, &scene, &camera, &targets).expect("frame");
        assert_eq!(stats.instances, 10);
        assert!(stats.camera_visible > 0 && stats.camera_visible <= stats.instances);
        assert!(stats.shadow_casters_visible <= 9);
        assert!(stats.shadow_draws <= 9 * renderer.shadows().cascade_count() as u32);
        assert_eq!(stats.lights, 6);
        assert_eq!(stats.lights_dropped, 0);
    }
    assert_eq!(renderer.shadows().cascades().len(), 4);
    assert_eq!(renderer.shadows().splits().len(), 5);
}

#[test]
fn zero_sized_targets_are_rejected() {
    let Some(gpu) = gpu() else { return };
    assert!(RenderTargets::new(gpu.device(), PhysicalSize::new(0, 90)).is_err());
}

#[test]
fn cpu_fallback_fills_clusters_and_truncates_lights() {
    let Some(gpu) = gpu() else { return };
    let mut config = small_config();
    config.clusters.max_lights = 4;
    let mut clusters =
        ClusteredShading::with_options(gpu.device(), gpu.queue(), &config.clusters, false, false).expect("clusters");
    assert!(!clusters.uses_compute());

    let size = PhysicalSize::new(config.viewport.width, config.viewport.height);
    let camera = orbit_camera(size);
    let scene = Scene::demo(2, 7);
    let mut encoder = gpu.device().create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    let stats = clusters
        .compute(ClusterComputeParams {
            device: gpu.device(),
            queue: gpu.queue(),
            encoder: &mut encoder,
            camera: &camera,
            viewport: size,
            lights: scene.point_lights(),
        })
        .expect("cluster pass");
    gpu.queue().submit(Some(encoder.finish()));

    assert_eq!(stats.lights_uploaded, 4);
    assert_eq!(stats.lights_dropped, 3);
    let cull = stats.cpu_cull.expect("cpu path reports stats");
    assert!(cull.assignments > 0);
    let grid = clusters.cpu_grid().expect("cpu grid");
    assert_eq!(grid.len(), CLUSTER_COUNT);
    assert!(grid.clusters().iter().all(|cluster| cluster.light_indices().iter().all(|&index| index < 4)));
}

#[test]
fn reconfigured_shadows_render_two_cascades() {
    let Some(gpu) = gpu() else { return };
    let config = small_config();
    let size = PhysicalSize::new(config.viewport.width, config.viewport.height);
    let targets = RenderTargets::new(gpu.device(), size).expect("targets");
    let mut renderer = FrameRenderer::new(&gpu, &config).expect("renderer");
    let scene = Scene::demo(3, 2);
    let camera = orbit_camera(size);
    renderer.render_frame(&gpu, &scene, &camera, &targets).expect("frame");
    assert_eq!(renderer.shadows().layer_count(), 4);
    assert_eq!(renderer.shadows().uniform().params[1], 4.0);

    let mut shadow = config.shadow.clone();
    shadow.cascade_count = 2;
    shadow.resolution = 1024;
    renderer.shadows_mut().reconfigure(gpu.device(), &shadow).expect("reconfigure");
    let shadows = renderer.shadows();
    assert_eq!((shadows.cascade_count(), shadows.layer_count(), shadows.resolution()), (2, 2, 1024));
    assert!(shadows.layer_view(1).is_some() && shadows.layer_view(2).is_none());
    assert!(shadows.cascades().is_empty() && shadows.splits().is_empty());

    let stats = renderer.render_frame(&gpu, &scene, &camera, &targets).expect("frame after reconfigure");
    assert!(stats.shadow_draws <= 2 * stats.instances);
    let shadows = renderer.shadows();
    assert_eq!(shadows.cascades().len(), 2);
    assert_eq!(shadows.splits().len(), 3);
    let uniform = shadows.uniform();
    assert_eq!(uniform.params[1], 2.0);
    assert_eq!(uniform.cascade_params[1][0], shadows.splits()[2]);
    assert!(uniform.light_view_proj[2..].iter().flatten().flatten().all(|&v| v == 0.0));

    let mut broken = shadow.clone();
    broken.cascade_count = 0;
    assert!(renderer.shadows_mut().reconfigure(gpu.device(), &broken).is_err());
    assert_eq!(renderer.shadows().layer_count(), 2);
}

#[test]
fn compute_kernels_match_the_cpu_grid() {
    let Some(gpu) = gpu() else { return };
    if !gpu.compute_supported() {
        eprintln!("skipping GPU test: no compute support");
        return;
    }
    let mut clusters =
        ClusteredShading::with_options(gpu.device(), gpu.queue(), &ClusterConfig { max_lights: 256 }, true, false)
            .expect("clusters");
    assert!(clusters.uses_compute());

    let camera = Camera3D::new(Vec3::ZERO, Vec3::NEG_Z, 60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
    let viewport = PhysicalSize::new(1280, 720);
    let params = ClusterParams::from_camera(&camera, viewport);
    let (cell_min, cell_max) = params.cell_bounds(UVec3::new(6, 6, 10));
    let center = (cell_min + cell_max) * 0.5;
    let lights: Vec<PointLight> = (0..200)
        .map(|_| {
            let mut light = PointLight::new(center, Vec3::ONE, 1.0, 0.7, 1.8);
            light.radius = 1e-3;
            light
        })
        .collect();

    let mut encoder = gpu.device().create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    let stats = clusters
        .compute(ClusterComputeParams {
            device: gpu.device(),
            queue: gpu.queue(),
            encoder: &mut encoder,
            camera: &camera,
            viewport,
            lights: &lights,
        })
        .expect("cluster pass");
    assert_eq!(stats.lights_uploaded, 200);
    assert!(stats.cpu_cull.is_none());
    assert!(clusters.dispatch_state().is_complete());

    let size = clusters.cluster_buffer().size();
    let readback = gpu.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("Cluster Readback Buffer"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    encoder.copy_buffer_to_buffer(clusters.cluster_buffer(), 0, &readback, 0, size);
    gpu.queue().submit(Some(encoder.finish()));
    readback.slice(..).map_async(wgpu::MapMode::Read, |result| result.expect("map cluster readback"));
    gpu.device().poll(wgpu::PollType::wait_indefinitely()).expect("poll");
    let from_gpu: Vec<ClusterGpu> = readback
        .slice(..)
        .get_mapped_range()
        .chunks_exact(std::mem::size_of::<ClusterGpu>())
        .map(bytemuck::pod_read_unaligned::<ClusterGpu>)
        .collect();
    readback.unmap();

    let mut grid = ClusterGrid::new();
    grid.gather(&params);
    grid.cull(&lights, camera.view_matrix());
    assert_eq!(from_gpu.len(), CLUSTER_COUNT);

    let target = params.flat_index(UVec3::new(6, 6, 10));
    assert_eq!(from_gpu[target].count as usize, MAX_LIGHTS_PER_CLUSTER);
    for (index, (gpu_cluster, cpu_cluster)) in from_gpu.iter().zip(grid.clusters()).enumerate() {
        assert_eq!(gpu_cluster.count, cpu_cluster.count(), "cluster {index}");
        let count = gpu_cluster.count as usize;
        assert_eq!(&gpu_cluster.light_indices[..count], cpu_cluster.light_indices(), "cluster {index}");
        for (gpu_point, cpu_point) in
            [(gpu_cluster.min_point, cpu_cluster.min_point), (gpu_cluster.max_point, cpu_cluster.max_point)]
        {
            let gpu_point = Vec3::new(gpu_point[0], gpu_point[1], gpu_point[2]);
            let tolerance = 1e-3 * cpu_point.abs().max_element().max(1.0);
            let error = (gpu_point - cpu_point).abs().max_element();
            assert!(error < tolerance, "cluster {index}: {gpu_point} vs {cpu_point}");
        }
    }
}
