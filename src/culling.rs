use glam::{Mat4, Vec3};

use crate::camera3d::Camera3D;
use crate::cascades::ShadowCascade;
use crate::geometry::{FrustumPlane, FrustumPlanes};
use crate::mesh::MeshBounds;

/// Selects which frustum set `FrustumCulling::is_visible` tests against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CullingMode {
    #[default]
    Camera,
    /// Visible when inside any shadow cascade frustum.
    Shadow,
}

#[derive(Clone, Debug)]
pub struct FrustumCulling {
    enabled: bool,
    mode: CullingMode,
    camera_planes: FrustumPlanes,
    cascade_planes: Vec<FrustumPlanes>,
}

impl Default for FrustumCulling {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FrustumCulling {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            mode: CullingMode::Camera,
            camera_planes: [FrustumPlane::new(Vec3::ZERO, 0.0); 6],
            cascade_planes: Vec::new(),
        }
    }

    /// Refreshes every frustum from current state. Call once per frame after the
    /// camera moved and the cascades were fitted.
    pub fn update(&mut self, camera: &Camera3D, cascades: &[ShadowCascade]) {
        self.camera_planes = camera.frustum_planes();
        self.cascade_planes.clear();
        self.cascade_planes.extend(cascades.iter().map(ShadowCascade::frustum_planes));
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        self.enabled
    }

    pub fn mode(&self) -> CullingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CullingMode) {
        self.mode = mode;
    }

    pub fn set_shadow(&mut self, shadow: bool) {
        self.mode = if shadow { CullingMode::Shadow } else { CullingMode::Camera };
    }

    pub fn camera_planes(&self) -> &FrustumPlanes {
        &self.camera_planes
    }

    pub fn cascade_planes(&self, cascade: usize) -> Option<&FrustumPlanes> {
        self.cascade_planes.get(cascade)
    }

    pub fn cascade_count(&self) -> usize {
        self.cascade_planes.len()
    }

    pub fn is_visible(&self, bounds: &MeshBounds, model: Mat4) -> bool {
        if !self.enabled {
            return true;
        }
        match self.mode {
            CullingMode::Camera => is_visible_in(bounds, model, &self.camera_planes),
            CullingMode::Shadow => self.cascade_planes.iter().any(|planes| is_visible_in(bounds, model, planes)),
        }
    }

    /// Test against a single cascade, used while rendering that cascade's layer.
    /// Unknown cascades reject everything.
    pub fn is_visible_in_cascade(&self, cascade: usize, bounds: &MeshBounds, model: Mat4) -> bool {
        if !self.enabled {
            return true;
        }
        self.cascade_planes.get(cascade).is_some_and(|planes| is_visible_in(bounds, model, planes))
    }
}

/// Sphere rejection followed by the eight-corner test. Conservative: it may
/// accept boxes that straddle two planes without touching the frustum, never
/// the reverse.
pub fn is_visible_in(bounds: &MeshBounds, model: Mat4, planes: &FrustumPlanes) -> bool {
    let center = bounds.sphere.world_center(model);
    let radius = bounds.sphere.radius;
    if planes.iter().any(|plane| plane.distance_to_point(center) < -radius) {
        return false;
    }

    let corners = bounds.aabb.corners().map(|corner| model.transform_point3(corner));
    !planes.iter().any(|plane| corners.iter().all(|corner| plane.distance_to_point(*corner) < 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Aabb, BoundingSphere};

    fn unit_bounds() -> MeshBounds {
        MeshBounds {
            aabb: Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
            sphere: BoundingSphere::new(Vec3::ZERO, 3f32.sqrt()),
        }
    }

    fn culling() -> FrustumCulling {
        let camera = Camera3D::new(Vec3::ZERO, Vec3::NEG_Z, 60f32.to_radians(), 1.0, 0.1, 100.0);
        let mut culling = FrustumCulling::default();
        culling.update(&camera, &[]);
        culling
    }

    #[test]
    fn camera_mode_accepts_inside_and_rejects_behind() {
        let culling = culling();
        let bounds = unit_bounds();
        assert!(culling.is_visible(&bounds, Mat4::from_translation(Vec3::new(0.0, 0.0, -20.0))));
        assert!(!culling.is_visible(&bounds, Mat4::from_translation(Vec3::new(0.0, 0.0, 20.0))));
        assert!(culling.is_visible(&bounds, Mat4::from_translation(Vec3::new(0.0, 0.0, -100.5))));
    }

    #[test]
    fn corner_test_rejects_what_the_sphere_lets_through() {
        // Long thin box beside the frustum: its loose sphere crosses the left plane.
        let bounds = MeshBounds {
            aabb: Aabb::new(Vec3::new(-0.1, -0.1, -10.0), Vec3::new(0.1, 0.1, 10.0)),
            sphere: BoundingSphere::new(Vec3::ZERO, 10.0),
        };
        let model = Mat4::from_translation(Vec3::new(-15.0, 0.0, -10.0));
        let culling = culling();
        let center = bounds.sphere.world_center(model);
        assert!(culling.camera_planes().iter().all(|plane| plane.distance_to_point(center) >= -10.0));
        assert!(!culling.is_visible(&bounds, model));
    }

    #[test]
    fn disabled_culling_accepts_everything() {
        let mut culling = culling();
        assert!(!culling.toggle());
        assert!(culling.is_visible(&unit_bounds(), Mat4::from_translation(Vec3::new(0.0, 0.0, 500.0))));
        assert!(culling.is_visible_in_cascade(7, &unit_bounds(), Mat4::IDENTITY));
    }

    #[test]
    fn shadow_mode_without_cascades_rejects() {
        let mut culling = culling();
        culling.set_shadow(true);
        assert_eq!(culling.mode(), CullingMode::Shadow);
        assert!(!culling.is_visible(&unit_bounds(), Mat4::from_translation(Vec3::new(0.0, 0.0, -20.0))));
        assert!(culling.cascade_planes(0).is_none());
    }
}
