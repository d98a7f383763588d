use glam::{Mat4, UVec3, Vec2, Vec3};
use log::debug;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use winit::dpi::PhysicalSize;

use crate::camera3d::Camera3D;
use crate::light::PointLight;

pub const GRID_X: u32 = 12;
pub const GRID_Y: u32 = 12;
pub const GRID_Z: u32 = 24;
pub const CLUSTER_COUNT: usize = (GRID_X * GRID_Y * GRID_Z) as usize;
pub const MAX_LIGHTS_PER_CLUSTER: usize = 128;
/// Invocations per workgroup in `cull_lights.wgsl`.
pub const CULL_WORKGROUP_SIZE: u32 = 128;

/// Mirrors `Cluster` in the WGSL kernels (560 bytes with trailing padding).
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClusterGpu {
    pub min_point: [f32; 4],
    pub max_point: [f32; 4],
    pub count: u32,
    pub light_indices: [u32; MAX_LIGHTS_PER_CLUSTER],
    pub _padding: [u32; 3],
}

/// Gather-pass inputs, laid out as `ClusterParams` in `cluster_common.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClusterParamsGpu {
    pub inverse_projection: [[f32; 4]; 4],
    pub grid_size: [u32; 4],
    pub screen_dimensions: [u32; 2],
    pub z_near: f32,
    pub z_far: f32,
}

/// Cull-pass inputs (`CullParams` in `cull_lights.wgsl`).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CullParamsGpu {
    pub view: [[f32; 4]; 4],
    pub light_count: u32,
    pub _padding: [u32; 3],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterParams {
    pub z_near: f32,
    pub z_far: f32,
    /// OpenGL-convention inverse projection.
    pub inverse_projection: Mat4,
    pub grid_size: UVec3,
    pub screen_dimensions: [u32; 2],
}

impl ClusterParams {
    /// Default grid over the camera's depth range and the given viewport.
    pub fn from_camera(camera: &Camera3D, viewport: PhysicalSize<u32>) -> Self {
        Self {
            z_near: camera.near,
            z_far: camera.far,
            inverse_projection: camera.projection_matrix().inverse(),
            grid_size: UVec3::new(GRID_X, GRID_Y, GRID_Z),
            screen_dimensions: [viewport.width.max(1), viewport.height.max(1)],
        }
    }

    pub fn to_gpu(&self) -> ClusterParamsGpu {
        ClusterParamsGpu {
            inverse_projection: self.inverse_projection.to_cols_array_2d(),
            grid_size: [self.grid_size.x, self.grid_size.y, self.grid_size.z, 0],
            screen_dimensions: self.screen_dimensions,
            z_near: self.z_near,
            z_far: self.z_far,
        }
    }

    pub fn cluster_count(&self) -> usize {
        (self.grid_size.x * self.grid_size.y * self.grid_size.z) as usize
    }

    fn tile_size(&self) -> Vec2 {
        Vec2::new(self.screen_dimensions[0] as f32, self.screen_dimensions[1] as f32)
            / Vec2::new(self.grid_size.x as f32, self.grid_size.y as f32)
    }

    /// View-space distance of the near face of Z slice `slice`.
    pub fn slice_depth(&self, slice: u32) -> f32 {
        let fraction = slice as f32 / self.grid_size.z as f32;
        self.z_near * (self.z_far / self.z_near).powf(fraction)
    }

    pub fn slice_for_depth(&self, view_depth: f32) -> u32 {
        let ratio = (view_depth.max(self.z_near) / self.z_near).ln() / (self.z_far / self.z_near).ln();
        let slice = (ratio * self.grid_size.z as f32).floor() as i32;
        slice.clamp(0, self.grid_size.z as i32 - 1) as u32
    }

    /// Cluster holding a fragment at `frag_coord` (pixels, y down) with positive
    /// view depth. Same formula as `cluster_index` in `cluster_common.wgsl`.
    pub fn cluster_index_for(&self, frag_coord: Vec2, view_depth: f32) -> usize {
        let max_tile = Vec2::new(self.grid_size.x as f32 - 1.0, self.grid_size.y as f32 - 1.0);
        let tile = (frag_coord / self.tile_size()).floor().clamp(Vec2::ZERO, max_tile);
        let slice = self.slice_for_depth(view_depth);
        self.flat_index(UVec3::new(tile.x as u32, tile.y as u32, slice))
    }

    pub fn flat_index(&self, cell: UVec3) -> usize {
        (cell.x + cell.y * self.grid_size.x + cell.z * self.grid_size.x * self.grid_size.y) as usize
    }

    fn screen_to_view(&self, screen: Vec2) -> Vec3 {
        let dims = Vec2::new(self.screen_dimensions[0] as f32, self.screen_dimensions[1] as f32);
        let ndc = Vec2::new(screen.x / dims.x * 2.0 - 1.0, 1.0 - screen.y / dims.y * 2.0);
        self.inverse_projection.project_point3(ndc.extend(-1.0))
    }

    /// View-space box of one cell; the gather kernel computes the same bounds.
    pub fn cell_bounds(&self, cell: UVec3) -> (Vec3, Vec3) {
        let tile = self.tile_size();
        let min_screen = Vec2::new(cell.x as f32, cell.y as f32) * tile;
        let max_screen = Vec2::new((cell.x + 1) as f32, (cell.y + 1) as f32) * tile;
        let min_view = self.screen_to_view(min_screen);
        let max_view = self.screen_to_view(max_screen);
        let near = self.slice_depth(cell.z);
        let far = self.slice_depth(cell.z + 1);
        let points = [
            scale_to_depth(min_view, near),
            scale_to_depth(min_view, far),
            scale_to_depth(max_view, near),
            scale_to_depth(max_view, far),
        ];
        let min = points.iter().fold(Vec3::splat(f32::INFINITY), |acc, p| acc.min(*p));
        let max = points.iter().fold(Vec3::splat(f32::NEG_INFINITY), |acc, p| acc.max(*p));
        (min, max)
    }
}

/// Slides a point of the near plane along its eye ray to view depth `depth`.
fn scale_to_depth(near_point: Vec3, depth: f32) -> Vec3 {
    near_point * (depth / -near_point.z)
}

/// One grid cell: view-space box plus a capacity-clamped light list.
#[derive(Debug)]
pub struct Cluster {
    pub min_point: Vec3,
    pub max_point: Vec3,
    count: AtomicU32,
    light_indices: [AtomicU32; MAX_LIGHTS_PER_CLUSTER],
}

impl Cluster {
    fn empty() -> Self {
        Self {
            min_point: Vec3::ZERO,
            max_point: Vec3::ZERO,
            count: AtomicU32::new(0),
            light_indices: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn light_indices(&self) -> Vec<u32> {
        self.light_indices[..self.count() as usize].iter().map(|slot| slot.load(Ordering::Acquire)).collect()
    }

    /// Returns false once the cell holds `MAX_LIGHTS_PER_CLUSTER` lights.
    pub fn try_push(&self, light_index: u32) -> bool {
        let reserved = self.count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            ((count as usize) < MAX_LIGHTS_PER_CLUSTER).then_some(count + 1)
        });
        match reserved {
            Ok(slot) => {
                self.light_indices[slot as usize].store(light_index, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        let closest = center.clamp(self.min_point, self.max_point);
        closest.distance_squared(center) <= radius * radius
    }

    pub fn to_gpu(&self) -> ClusterGpu {
        let mut light_indices = [0u32; MAX_LIGHTS_PER_CLUSTER];
        let count = self.count();
        for (dst, src) in light_indices.iter_mut().zip(&self.light_indices[..count as usize]) {
            *dst = src.load(Ordering::Acquire);
        }
        ClusterGpu {
            min_point: self.min_point.extend(0.0).to_array(),
            max_point: self.max_point.extend(0.0).to_array(),
            count,
            light_indices,
            _padding: [0; 3],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterCullStats {
    pub assignments: u32,
    pub dropped_assignments: u32,
    pub overflowing_clusters: u32,
}

/// CPU implementation of the gather and cull kernels over a fixed arena of cells.
#[derive(Debug)]
pub struct ClusterGrid {
    grid_size: UVec3,
    clusters: Vec<Cluster>,
}

impl Default for ClusterGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterGrid {
    pub fn new() -> Self {
        Self::with_dimensions(UVec3::new(GRID_X, GRID_Y, GRID_Z))
    }

    pub fn with_dimensions(grid_size: UVec3) -> Self {
        let grid_size = grid_size.max(UVec3::ONE);
        let count = (grid_size.x * grid_size.y * grid_size.z) as usize;
        Self { grid_size, clusters: (0..count).map(|_| Cluster::empty()).collect() }
    }

    pub fn grid_size(&self) -> UVec3 {
        self.grid_size
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster(&self, index: usize) -> Option<&Cluster> {
        self.clusters.get(index)
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Rewrites every cell's bounds and empties its light list.
    pub fn gather(&mut self, params: &ClusterParams) {
        let params = ClusterParams { grid_size: self.grid_size, ..*params };
        for z in 0..self.grid_size.z {
            for y in 0..self.grid_size.y {
                for x in 0..self.grid_size.x {
                    let cell = UVec3::new(x, y, z);
                    let (min, max) = params.cell_bounds(cell);
                    let cluster = &mut self.clusters[params.flat_index(cell)];
                    cluster.min_point = min;
                    cluster.max_point = max;
                    cluster.reset();
                }
            }
        }
    }

    /// Appends each light to every cell its view-space sphere touches.
    pub fn cull(&self, lights: &[PointLight], view: Mat4) -> ClusterCullStats {
        let view_lights: Vec<(Vec3, f32)> =
            lights.iter().map(|light| (view.transform_point3(light.position), light.radius)).collect();
        let mut stats = ClusterCullStats::default();
        for cluster in &self.clusters {
            let mut overflowed = false;
            for (index, (center, radius)) in view_lights.iter().enumerate() {
                if !cluster.intersects_sphere(*center, *radius) {
                    continue;
                }
                if cluster.try_push(index as u32) {
                    stats.assignments += 1;
                } else {
                    stats.dropped_assignments += 1;
                    overflowed = true;
                }
            }
            if overflowed {
                stats.overflowing_clusters += 1;
            }
        }
        if stats.overflowing_clusters > 0 {
            debug!(
                "{} cluster(s) exceeded {} lights; {} assignment(s) dropped",
                stats.overflowing_clusters, MAX_LIGHTS_PER_CLUSTER, stats.dropped_assignments
            );
        }
        stats
    }

    pub fn to_gpu(&self) -> Vec<ClusterGpu> {
        self.clusters.iter().map(Cluster::to_gpu).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStage {
    Gather,
    GatherBarrier,
    Cull,
    CullBarrier,
}

const STAGE_ORDER: [ClusterStage; 4] =
    [ClusterStage::Gather, ClusterStage::GatherBarrier, ClusterStage::Cull, ClusterStage::CullBarrier];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cluster stage {found:?} encoded while {expected:?} was pending")]
pub struct ClusterOrderError {
    pub expected: Option<ClusterStage>,
    pub found: ClusterStage,
}

/// Tracks the encoded order of one frame's cluster work; the cull pass must
/// never observe partially written bounds.
#[derive(Clone, Debug, Default)]
pub struct ClusterDispatchState {
    recorded: usize,
}

impl ClusterDispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: ClusterStage) -> Result<(), ClusterOrderError> {
        let expected = STAGE_ORDER.get(self.recorded).copied();
        if expected != Some(stage) {
            return Err(ClusterOrderError { expected, found: stage });
        }
        self.recorded += 1;
        Ok(())
    }

    /// Records `stage` and runs `encode` for it; out-of-order stages encode nothing.
    pub fn run<T>(&mut self, stage: ClusterStage, encode: impl FnOnce() -> T) -> Result<T, ClusterOrderError> {
        self.record(stage)?;
        Ok(encode())
    }

    pub fn reset(&mut self) {
        self.recorded = 0;
    }

    /// True once the second barrier was recorded, so the colour pass may read the buffers.
    pub fn is_complete(&self) -> bool {
        self.recorded == STAGE_ORDER.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ClusterParams {
        let proj = Mat4::perspective_rh_gl(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        ClusterParams {
            z_near: 0.1,
            z_far: 100.0,
            inverse_projection: proj.inverse(),
            grid_size: UVec3::new(GRID_X, GRID_Y, GRID_Z),
            screen_dimensions: [1280, 720],
        }
    }

    #[test]
    fn gpu_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<ClusterGpu>(), 560);
        assert_eq!(std::mem::size_of::<ClusterParamsGpu>(), 96);
        assert_eq!(std::mem::size_of::<CullParamsGpu>(), 80);
    }

    #[test]
    fn slices_span_near_to_far() {
        let params = params();
        assert!((params.slice_depth(0) - 0.1).abs() < 1e-6);
        assert!((params.slice_depth(GRID_Z) - 100.0).abs() < 1e-3);
        assert_eq!(params.slice_for_depth(0.01), 0);
        assert_eq!(params.slice_for_depth(1000.0), GRID_Z - 1);
    }

    #[test]
    fn try_push_clamps_at_capacity() {
        let cluster = Cluster::empty();
        for index in 0..MAX_LIGHTS_PER_CLUSTER as u32 {
            assert!(cluster.try_push(index));
        }
        assert!(!cluster.try_push(999));
        assert_eq!(cluster.count(), MAX_LIGHTS_PER_CLUSTER as u32);
        assert_eq!(cluster.light_indices().last(), Some(&(MAX_LIGHTS_PER_CLUSTER as u32 - 1)));
    }

    #[test]
    fn gather_resets_counts() {
        let mut grid = ClusterGrid::new();
        grid.gather(&params());
        let light = PointLight::new(Vec3::new(0.0, 0.0, -5.0), Vec3::ONE, 1.0, 0.7, 1.8);
        let stats = grid.cull(&[light], Mat4::IDENTITY);
        assert!(stats.assignments > 0);
        grid.gather(&params());
        assert!(grid.clusters().iter().all(|cluster| cluster.count() == 0));
    }

    #[test]
    fn dispatch_state_rejects_cull_before_barrier() {
        let mut state = ClusterDispatchState::new();
        state.record(ClusterStage::Gather).expect("gather first");
        let err = state.record(ClusterStage::Cull).unwrap_err();
        assert_eq!(err.expected, Some(ClusterStage::GatherBarrier));
        assert!(!state.is_complete());
    }

    #[test]
    fn dispatch_state_skips_passes_out_of_order() {
        let mut state = ClusterDispatchState::new();
        let mut encoded = Vec::new();
        assert!(state.run(ClusterStage::Cull, || encoded.push(ClusterStage::Cull)).is_err());
        assert!(encoded.is_empty());

        state.run(ClusterStage::Gather, || encoded.push(ClusterStage::Gather)).expect("gather");
        state.record(ClusterStage::GatherBarrier).expect("barrier");
        state.run(ClusterStage::Cull, || encoded.push(ClusterStage::Cull)).expect("cull");
        assert_eq!(encoded, [ClusterStage::Gather, ClusterStage::Cull]);
        assert!(!state.is_complete());

        state.reset();
        assert!(state.run(ClusterStage::Cull, || encoded.push(ClusterStage::Cull)).is_err());
        assert_eq!(encoded.len(), 2);
    }
}
