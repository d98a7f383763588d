use anyhow::{Context, Result};
use glam::{Vec2, Vec3};
use log::{debug, info};
use std::path::PathBuf;
use winit::dpi::PhysicalSize;

use crate::camera3d::{Camera3D, OrbitCamera};
use crate::cli::CliOverrides;
use crate::config::RendererConfig;
use crate::renderer::{FrameRenderer, FrameStats, GpuContext, RenderTargets};
use crate::scene::Scene;

pub const DEFAULT_CONFIG_PATH: &str = "config/renderer.json";
pub const DEFAULT_FRAMES: u32 = 120;

const DEMO_GRID: u32 = 8;
const DEMO_LIGHTS: u32 = 48;
const ORBIT_RADIUS: f32 = 32.0;
const ORBIT_PITCH: f32 = -0.45;

/// Renders the demo scene headlessly for the requested number of frames while
/// orbiting the camera, logging per-frame visibility stats.
pub async fn run_with_overrides(cli: CliOverrides) -> Result<Vec<FrameStats>> {
    let config_path = cli.config_path().cloned().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = RendererConfig::load_or_default(&config_path);
    let overrides = cli.config_overrides();
    if !overrides.is_empty() {
        info!("CLI overrides applied: {}", overrides.applied_fields().join(", "));
        config.apply_overrides(&overrides);
    }

    let gpu = GpuContext::headless().await?;
    let size = PhysicalSize::new(config.viewport.width, config.viewport.height);
    let targets = RenderTargets::new(gpu.device(), size)?;
    let mut renderer = FrameRenderer::new(&gpu, &config).context("Failed to create frame renderer")?;

    let scene = Scene::demo(DEMO_GRID, DEMO_LIGHTS);
    let aspect = size.width as f32 / size.height as f32;
    let mut camera =
        Camera3D::new(Vec3::new(0.0, 12.0, ORBIT_RADIUS), Vec3::ZERO, 60f32.to_radians(), aspect, 0.1, 200.0);
    let mut orbit = OrbitCamera::new(Vec3::ZERO, ORBIT_RADIUS);
    orbit.pitch_radians = ORBIT_PITCH;

    let frames = cli.frames().unwrap_or(DEFAULT_FRAMES).max(1);
    let step = std::f32::consts::TAU / frames as f32;
    let mut history = Vec::with_capacity(frames as usize);
    for frame in 0..frames {
        orbit.orbit(Vec2::new(step, 0.0));
        orbit.apply(&mut camera);
        let stats = renderer.render_frame(&gpu, &scene, &camera, &targets)?;
        debug!(
            "frame {frame}: {}/{} visible, {} casters, {} shadow draws, {} lights",
            stats.camera_visible, stats.instances, stats.shadow_casters_visible, stats.shadow_draws, stats.lights
        );
        history.push(stats);
    }

    if let Some(last) = history.last() {
        info!(
            "Rendered {frames} frame(s): {}/{} instances visible, {} shadow draws over {} cascade(s), {} lights",
            last.camera_visible,
            last.instances,
            last.shadow_draws,
            renderer.shadows().cascade_count(),
            last.lights
        );
    }
    let summary = renderer.timing_summary();
    if summary.is_empty() {
        info!("No GPU cluster timings available (timestamps unsupported or readback pending)");
    } else {
        info!("Cluster pass timings:\n{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(history)
}
