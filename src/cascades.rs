use glam::{Mat4, Vec2, Vec3};
use smallvec::SmallVec;

use crate::camera3d::Camera3D;
use crate::geometry::{extract_frustum_planes, Aabb, FrustumPlanes};

const SPLIT_EPS: f32 = 1e-4;

/// Box triangles indexed into `Aabb::corners`, two per face.
const AABB_TRIANGLES: [[usize; 3]; 12] = [
    [0, 1, 2],
    [1, 3, 2],
    [4, 5, 6],
    [5, 7, 6],
    [0, 2, 4],
    [2, 6, 4],
    [1, 3, 5],
    [3, 7, 5],
    [0, 1, 4],
    [1, 5, 4],
    [2, 3, 6],
    [3, 7, 6],
];

type ClipPolygon = SmallVec<[Vec3; 8]>;

/// One slice of the camera frustum rendered into its own shadow-map layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowCascade {
    pub near_split: f32,
    pub far_split: f32,
    /// `ortho * light_view`, OpenGL clip depth.
    pub light_space_matrix: Mat4,
    /// World units covered by one shadow texel along light-space X.
    pub texel_size: f32,
}

impl ShadowCascade {
    pub fn frustum_planes(&self) -> FrustumPlanes {
        extract_frustum_planes(self.light_space_matrix)
    }

    pub fn contains_depth(&self, view_depth: f32) -> bool {
        view_depth >= self.near_split && view_depth <= self.far_split
    }
}

/// `cascade_count + 1` split depths blending a logarithmic (`lambda = 1`) and a
/// uniform (`lambda = 0`) distribution. The first entry is `near`, the last is `far`.
pub fn compute_cascade_splits(cascade_count: u32, near: f32, far: f32, lambda: f32) -> Vec<f32> {
    let count = cascade_count.max(1) as usize;
    let lambda = lambda.clamp(0.0, 1.0);
    let mut splits = Vec::with_capacity(count + 1);
    splits.push(near);
    for i in 1..=count {
        let fraction = i as f32 / count as f32;
        let log = near * (far / near).powf(fraction);
        let lin = near + (far - near) * fraction;
        let split = lambda * log + (1.0 - lambda) * lin;
        let previous = splits[i - 1];
        splits.push(if split > previous { split } else { previous + SPLIT_EPS });
    }
    splits[count] = far;
    splits
}

/// World-space corners of the camera frustum restricted to `[near, far]`.
pub fn frustum_slice_corners(camera: &Camera3D, near: f32, far: f32) -> [Vec3; 8] {
    let inv = (camera.projection_for_range(near, far) * camera.view_matrix()).inverse();
    Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)).corners().map(|ndc| inv.project_point3(ndc))
}

/// Light-space bounds of world points; only x/y feed the orthographic extent.
pub fn compute_ortho_extents(light_view: Mat4, world_corners: &[Vec3]) -> Aabb {
    Aabb::from_points(world_corners.iter().map(|corner| light_view.transform_point3(*corner)))
        .unwrap_or(Aabb::new(Vec3::ZERO, Vec3::ZERO))
}

#[derive(Clone, Copy)]
enum ClipEdge {
    MinX(f32),
    MaxX(f32),
    MinY(f32),
    MaxY(f32),
}

impl ClipEdge {
    fn value(self) -> f32 {
        match self {
            ClipEdge::MinX(v) | ClipEdge::MaxX(v) | ClipEdge::MinY(v) | ClipEdge::MaxY(v) => v,
        }
    }

    fn coord(self, p: Vec3) -> f32 {
        match self {
            ClipEdge::MinX(_) | ClipEdge::MaxX(_) => p.x,
            ClipEdge::MinY(_) | ClipEdge::MaxY(_) => p.y,
        }
    }

    fn inside(self, p: Vec3) -> bool {
        match self {
            ClipEdge::MinX(v) | ClipEdge::MinY(v) => self.coord(p) >= v,
            ClipEdge::MaxX(v) | ClipEdge::MaxY(v) => self.coord(p) <= v,
        }
    }
}

fn clip_polygon(polygon: &ClipPolygon, edge: ClipEdge) -> ClipPolygon {
    let mut clipped = ClipPolygon::new();
    for (i, &current) in polygon.iter().enumerate() {
        let next = polygon[(i + 1) % polygon.len()];
        let current_inside = edge.inside(current);
        if current_inside {
            clipped.push(current);
        }
        if current_inside != edge.inside(next) {
            let a = edge.coord(current);
            let t = (edge.value() - a) / (edge.coord(next) - a);
            clipped.push(current.lerp(next, t));
        }
    }
    clipped
}

/// Tight light-space depth range of `scene_aabb` inside the XY footprint
/// `[ortho_min, ortho_max]`. Returns `(near, far)` as distances in front of the
/// light, or `None` when no part of the box lies within the footprint.
pub fn compute_near_far(light_view: Mat4, ortho_min: Vec2, ortho_max: Vec2, scene_aabb: &Aabb) -> Option<(f32, f32)> {
    let corners = scene_aabb.corners().map(|corner| light_view.transform_point3(corner));
    let edges = [
        ClipEdge::MinX(ortho_min.x),
        ClipEdge::MaxX(ortho_max.x),
        ClipEdge::MinY(ortho_min.y),
        ClipEdge::MaxY(ortho_max.y),
    ];

    let mut min_z = f32::INFINITY;
    let mut max_z = f32::NEG_INFINITY;
    for triangle in &AABB_TRIANGLES {
        let mut polygon: ClipPolygon = triangle.iter().map(|&index| corners[index]).collect();
        for edge in edges {
            if polygon.is_empty() {
                break;
            }
            polygon = clip_polygon(&polygon, edge);
        }
        for vertex in &polygon {
            min_z = min_z.min(vertex.z);
            max_z = max_z.max(vertex.z);
        }
    }
    if !min_z.is_finite() || !max_z.is_finite() {
        return None;
    }

    // The light looks down -Z.
    let near = (-max_z).max(0.0);
    let far = (-min_z).max(near);
    Some((near, far))
}

/// Pulls `near` toward the light so no object corner is clipped by the near plane.
pub fn clamp_near_to_objects(light_view: Mat4, near: f32, object_bounds: &[Aabb]) -> f32 {
    object_bounds
        .iter()
        .flat_map(|aabb| aabb.corners())
        .map(|corner| -light_view.transform_point3(corner).z)
        .fold(near, f32::min)
}

/// Explicit mantissa bits kept in a snapped texel size.
const TEXEL_MANTISSA_BITS: u32 = 6;
/// Relative error tolerated when an already snapped texel is measured again.
const TEXEL_SLACK: f32 = 1.0 / 4096.0;

/// Rounds a positive texel size up to a short mantissa, so `texel * resolution`
/// is exact and re-measuring a snapped extent lands on the same texel.
fn quantize_texel(texel: f32) -> f32 {
    let mask = (1u32 << (23 - TEXEL_MANTISSA_BITS)) - 1;
    let bits = (texel * (1.0 - TEXEL_SLACK)).to_bits();
    if bits & mask == 0 {
        f32::from_bits(bits)
    } else {
        f32::from_bits((bits | mask) + 1)
    }
}

/// Resizes the extent to a whole number of quantized texels and rounds its
/// minimum onto the texel grid. Snapping a snapped extent returns it unchanged.
pub fn snap_ortho_to_texels(ortho_min: Vec2, ortho_max: Vec2, resolution: u32) -> (Vec2, Vec2) {
    let size = ortho_max - ortho_min;
    if resolution == 0 || !size.is_finite() || size.x <= 0.0 || size.y <= 0.0 {
        return (ortho_min, ortho_max);
    }
    let raw = size / resolution as f32;
    let texel = Vec2::new(quantize_texel(raw.x), quantize_texel(raw.y));
    let extent = texel * resolution as f32;
    let center = (ortho_min + ortho_max) * 0.5;
    let min = ((center - extent * 0.5) / texel).round() * texel;
    (min, min + extent)
}

/// Fits the orthographic light projection for cascade `cascade_index`.
/// `splits` must hold at least `cascade_index + 2` entries.
pub fn compute_cascade_matrix(
    cascade_index: usize,
    camera: &Camera3D,
    light_view: Mat4,
    resolution: u32,
    splits: &[f32],
    object_bounds: &[Aabb],
) -> ShadowCascade {
    let near_split = splits[cascade_index];
    let far_split = splits[cascade_index + 1];

    let world_corners = frustum_slice_corners(camera, near_split, far_split);
    let slice_light = compute_ortho_extents(light_view, &world_corners);
    let (extent_min, extent_max) = (slice_light.min.truncate(), slice_light.max.truncate());

    let slice_world = Aabb::from_points(world_corners).unwrap_or(Aabb::new(camera.position, camera.position));
    let scene_aabb = object_bounds.iter().fold(slice_world, |acc, aabb| acc.union(aabb));
    let (near, far) = compute_near_far(light_view, extent_min, extent_max, &scene_aabb)
        .unwrap_or(((-slice_light.max.z).max(0.0), (-slice_light.min.z).max(0.0)));
    // Only ever moves toward the light, so `near <= far` still holds.
    let near = clamp_near_to_objects(light_view, near, object_bounds);

    let (ortho_min, ortho_max) = snap_ortho_to_texels(extent_min, extent_max, resolution);
    let ortho = Mat4::orthographic_rh_gl(ortho_min.x, ortho_max.x, ortho_min.y, ortho_max.y, near, far);
    ShadowCascade {
        near_split,
        far_split,
        light_space_matrix: ortho * light_view,
        texel_size: (ortho_max.x - ortho_min.x) / resolution.max(1) as f32,
    }
}

pub fn compute_cascades(
    camera: &Camera3D,
    light_view: Mat4,
    resolution: u32,
    splits: &[f32],
    object_bounds: &[Aabb],
) -> Vec<ShadowCascade> {
    (0..splits.len().saturating_sub(1))
        .map(|index| compute_cascade_matrix(index, camera, light_view, resolution, splits, object_bounds))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::DirectionalLight;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> Camera3D {
        Camera3D::new(Vec3::ZERO, Vec3::NEG_Z, 60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0)
    }

    #[test]
    fn splits_blend_log_and_linear() {
        let linear = compute_cascade_splits(4, 1.0, 101.0, 0.0);
        assert!((linear[1] - 26.0).abs() < 1e-4);
        let log = compute_cascade_splits(2, 1.0, 100.0, 1.0);
        assert!((log[1] - 10.0).abs() < 1e-3);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn single_cascade_spans_full_range() {
        assert_eq!(compute_cascade_splits(1, 0.5, 80.0, 0.7), vec![0.5, 80.0]);
    }

    #[test]
    fn clipping_keeps_only_the_footprint() {
        // Light at the origin looking down -Z: light space equals world space.
        let view = Mat4::IDENTITY;
        let scene = Aabb::new(Vec3::new(-10.0, -10.0, -30.0), Vec3::new(10.0, 10.0, -5.0));
        let (near, far) =
            compute_near_far(view, Vec2::splat(-1.0), Vec2::splat(1.0), &scene).expect("box overlaps footprint");
        assert!((near - 5.0).abs() < 1e-4);
        assert!((far - 30.0).abs() < 1e-4);

        let outside = compute_near_far(view, Vec2::splat(20.0), Vec2::splat(21.0), &scene);
        assert!(outside.is_none());
    }

    #[test]
    fn clipping_uses_interior_of_slanted_faces() {
        // Rotated box: a diamond in light XZ with tips at distance sqrt(2).
        let view = Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4);
        let scene = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let (near, far) = compute_near_far(view, Vec2::new(0.4, -0.1), Vec2::new(0.6, 0.1), &scene)
            .expect("footprint overlaps box");
        let expected = std::f32::consts::SQRT_2 - 0.4;
        assert!((far - expected).abs() < 1e-4, "far = {far}");
        assert_eq!(near, 0.0);
    }

    #[test]
    fn near_clamp_reaches_casters_behind_slice() {
        let view = Mat4::IDENTITY;
        let caster = Aabb::new(Vec3::new(50.0, 50.0, 20.0), Vec3::new(51.0, 51.0, 21.0));
        let near = clamp_near_to_objects(view, 4.0, &[caster]);
        assert!((near + 21.0).abs() < 1e-4);
        assert_eq!(clamp_near_to_objects(view, 4.0, &[]), 4.0);
    }

    #[test]
    fn snapping_keeps_a_power_of_two_texel() {
        let (min, max) = snap_ortho_to_texels(Vec2::new(-4.7, -8.0), Vec2::new(11.3, 8.0), 1024);
        assert_eq!(max - min, Vec2::splat(16.0));
        assert_eq!(min.x, -301.0 / 64.0);
        assert_eq!(snap_ortho_to_texels(min, max, 1024), (min, max));
    }

    #[test]
    fn snapping_twice_matches_snapping_once() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..20_000 {
            let min = Vec2::new(rng.gen_range(-500.0..500.0), rng.gen_range(-500.0..500.0));
            let max = min + Vec2::new(rng.gen_range(2.0..200.0), rng.gen_range(2.0..200.0));
            let size = max - min;
            let resolution = rng.gen_range(512..=4096);
            let (once_min, once_max) = snap_ortho_to_texels(min, max, resolution);
            let (twice_min, twice_max) = snap_ortho_to_texels(once_min, once_max, resolution);
            assert_eq!((twice_min, twice_max), (once_min, once_max), "{min} + {size} at {resolution}");

            let raw = size / resolution as f32;
            let texel = Vec2::new(quantize_texel(raw.x), quantize_texel(raw.y));
            assert!(texel.cmpge(raw * (1.0 - 1.0 / 4096.0)).all() && texel.cmple(raw * 1.02).all());
            let drift = (once_max - once_min - texel * resolution as f32).abs();
            assert!(drift.cmplt(size / 4096.0).all(), "{drift}");
            let steps = once_min / texel;
            assert!((steps - steps.round()).abs().max_element() < 0.1, "{steps} texels");
            let slack = texel * 0.5 + size / 2048.0;
            assert!(once_min.cmple(min + slack).all() && once_max.cmpge(max - slack).all());
        }
    }

    #[test]
    fn snapping_ignores_degenerate_extent() {
        let (min, max) = snap_ortho_to_texels(Vec2::ONE, Vec2::ONE, 2048);
        assert_eq!((min, max), (Vec2::ONE, Vec2::ONE));
    }

    #[test]
    fn cascade_without_objects_still_covers_slice() {
        let camera = camera();
        let light_view = DirectionalLight::new(Vec3::new(-0.3, -1.0, -0.2), Vec3::ONE).light_view(100.0);
        let splits = compute_cascade_splits(4, camera.near, camera.far, 0.5);
        let cascades = compute_cascades(&camera, light_view, 2048, &splits, &[]);
        assert_eq!(cascades.len(), 4);
        for cascade in &cascades {
            let corners = frustum_slice_corners(&camera, cascade.near_split, cascade.far_split);
            for corner in corners {
                let clip = cascade.light_space_matrix.project_point3(corner);
                assert!(clip.x.abs() <= 1.0 + 1e-2 && clip.y.abs() <= 1.0 + 1e-2, "{clip:?}");
                assert!(clip.z >= -1.0 - 1e-2 && clip.z <= 1.0 + 1e-2, "{clip:?}");
            }
            assert!(cascade.texel_size > 0.0);
            assert!(!cascade.light_space_matrix.to_cols_array().iter().any(|v| !v.is_finite()));
        }
    }

    #[test]
    fn casters_behind_the_light_keep_a_forward_depth_range() {
        let camera = camera();
        let light_view = DirectionalLight::new(Vec3::new(0.0, -1.0, 0.0), Vec3::ONE).light_view(20.0);
        // Above the light position, so its corners sit behind the light plane.
        let caster = Aabb::new(Vec3::new(-1.0, 60.0, -30.0), Vec3::new(1.0, 62.0, -28.0));
        let splits = compute_cascade_splits(2, camera.near, camera.far, 0.5);
        for cascade in compute_cascades(&camera, light_view, 1024, &splits, &[caster]) {
            let ortho = cascade.light_space_matrix * light_view.inverse();
            assert!(ortho.z_axis.z < 0.0, "depth axis flipped: {ortho:?}");
            assert!(ortho.to_cols_array().iter().all(|v| v.is_finite()));
            let clip = cascade.light_space_matrix.project_point3(caster.center());
            assert!(clip.z >= -1.0 - 1e-3, "{clip:?}");
        }
    }
}
