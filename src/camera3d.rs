use glam::{Mat4, Quat, Vec2, Vec3};
use winit::dpi::PhysicalSize;

use crate::geometry::{extract_frustum_planes, FrustumPlanes};

const DEFAULT_UP: Vec3 = Vec3::Y;

/// Remaps OpenGL clip depth ([-1, 1]) to the [0, 1] range wgpu rasterizes.
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Mat4 = Mat4::from_cols_array(&[
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
]);

/// Perspective camera. View and projection are derived on demand from the current
/// fields, so culling and cascade fitting never see stale matrices.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub aspect_ratio: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, aspect_ratio: f32, near: f32, far: f32) -> Self {
        Self { position, target, up: DEFAULT_UP, fov_y_radians, aspect_ratio, near, far }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection_for_range(self.near, self.far)
    }

    /// Projection with the camera's fov and aspect but a custom depth range; used to
    /// carve cascade slices out of the view frustum.
    pub fn projection_for_range(&self, near: f32, far: f32) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y_radians, self.aspect_ratio.max(0.0001), near, far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn gpu_view_projection(&self) -> Mat4 {
        OPENGL_TO_WGPU_MATRIX * self.view_projection()
    }

    pub fn frustum_planes(&self) -> FrustumPlanes {
        extract_frustum_planes(self.view_projection())
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    /// Updates the aspect ratio; returns whether it changed.
    pub fn resize(&mut self, viewport: PhysicalSize<u32>) -> bool {
        if viewport.width == 0 || viewport.height == 0 {
            return false;
        }
        let aspect = viewport.width as f32 / viewport.height as f32;
        if (aspect - self.aspect_ratio).abs() <= f32::EPSILON {
            return false;
        }
        self.aspect_ratio = aspect;
        true
    }
}

/// Orbit-style controller storing yaw/pitch around a target.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub radius: f32,
    pub yaw_radians: f32,
    pub pitch_radians: f32,
}

impl OrbitCamera {
    pub fn new(target: Vec3, radius: f32) -> Self {
        Self { target, radius: radius.max(0.01), yaw_radians: 0.0, pitch_radians: 0.0 }
    }

    /// Writes the orbit position into an existing camera, keeping its lens settings.
    pub fn apply(&self, camera: &mut Camera3D) {
        let rotation = Quat::from_euler(glam::EulerRot::YXZ, self.yaw_radians, self.pitch_radians, 0.0);
        camera.position = self.target + rotation * Vec3::new(0.0, 0.0, self.radius);
        camera.target = self.target;
    }

    pub fn orbit(&mut self, delta: Vec2) {
        self.yaw_radians += delta.x;
        self.pitch_radians = (self.pitch_radians + delta.y)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> Camera3D {
        Camera3D::new(Vec3::ZERO, Vec3::NEG_Z, 60.0_f32.to_radians(), 16.0 / 9.0, 0.1, 100.0)
    }

    #[test]
    fn camera3d_view_projection_is_finite() {
        let camera = Camera3D::new(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, 60.0_f32.to_radians(), 1.5, 0.1, 1000.0);
        let vp = camera.view_projection();
        assert!(!vp.to_cols_array().iter().any(|v| v.is_nan() || v.is_infinite()));
    }

    #[test]
    fn frustum_planes_face_inward() {
        let camera = test_camera();
        let planes = camera.frustum_planes();
        let inside = Vec3::new(0.0, 0.0, -50.0);
        for plane in &planes {
            assert!(plane.distance_to_point(inside) > 0.0);
            assert!((plane.normal.length() - 1.0).abs() < 1e-5);
        }
        // near plane sits at z = -near
        assert!(planes[4].distance_to_point(Vec3::new(0.0, 0.0, -0.1)).abs() < 1e-4);
        // far plane sits at z = -far
        assert!(planes[5].distance_to_point(Vec3::new(0.0, 0.0, -100.0)).abs() < 1e-2);
    }

    #[test]
    fn gpu_matrix_maps_depth_into_unit_range() {
        let camera = test_camera();
        let near = camera.gpu_view_projection().project_point3(Vec3::new(0.0, 0.0, -0.1));
        let far = camera.gpu_view_projection().project_point3(Vec3::new(0.0, 0.0, -100.0));
        assert!(near.z.abs() < 1e-3);
        assert!((far.z - 1.0).abs() < 1e-3);
    }

    #[test]
    fn resize_only_reports_real_changes() {
        let mut camera = test_camera();
        assert!(!camera.resize(PhysicalSize::new(1920, 1080)));
        assert!(camera.resize(PhysicalSize::new(800, 800)));
        assert!((camera.aspect_ratio - 1.0).abs() < f32::EPSILON);
        assert!(!camera.resize(PhysicalSize::new(0, 600)));
    }

    #[test]
    fn orbit_camera_orbits_target() {
        let mut orbit = OrbitCamera::new(Vec3::ZERO, 5.0);
        orbit.orbit(Vec2::new(0.5, 0.25));
        let mut camera = test_camera();
        orbit.apply(&mut camera);
        assert!((camera.position.distance(Vec3::ZERO) - 5.0).abs() < 1e-4);
        assert_eq!(camera.target, Vec3::ZERO);
    }
}
