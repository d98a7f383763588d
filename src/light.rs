use glam::{Mat4, Vec3};
use log::warn;

/// Radius used when the attenuation coefficients never fall below the visibility
/// threshold.
pub const LIGHT_RADIUS_FALLBACK: f32 = 1000.0;

/// Brightness denominator: a light stops contributing once its attenuated intensity
/// drops under 5/256 of its brightest channel.
const VISIBILITY_THRESHOLD: f32 = 256.0 / 5.0;

/// Sun-style light. `direction` points from the light into the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3) -> Self {
        Self { direction, color }
    }

    pub fn normalized_direction(&self) -> Vec3 {
        let dir = self.direction.normalize_or_zero();
        if dir.length_squared() < 1e-4 {
            Vec3::new(-0.4, -0.8, -0.35).normalize()
        } else {
            dir
        }
    }

    /// Light-space basis looking at the origin from `distance` units up-light.
    pub fn light_view(&self, distance: f32) -> Mat4 {
        let dir = self.normalized_direction();
        let up = if dir.dot(Vec3::Y).abs() > 0.99 { Vec3::X } else { Vec3::Y };
        Mat4::look_at_rh(-dir * distance, Vec3::ZERO, up)
    }
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self { direction: Vec3::new(-0.4, -0.8, -0.35).normalize(), color: Vec3::splat(1.0) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub constant: f32,
    pub linear: f32,
    pub quadratic: f32,
    pub radius: f32,
}

impl PointLight {
    pub fn new(position: Vec3, color: Vec3, constant: f32, linear: f32, quadratic: f32) -> Self {
        let radius = light_radius(color, constant, linear, quadratic);
        Self { position, color, constant, linear, quadratic, radius }
    }

    pub fn to_gpu(&self) -> PointLightGpu {
        PointLightGpu {
            position_radius: [self.position.x, self.position.y, self.position.z, self.radius],
            color_constant: [self.color.x, self.color.y, self.color.z, self.constant],
            attenuation: [self.linear, self.quadratic, 0.0, 0.0],
        }
    }
}

/// Distance at which `1 / (c + l*d + q*d^2)` scaled by the brightest channel falls to
/// the visibility threshold.
pub fn light_radius(color: Vec3, constant: f32, linear: f32, quadratic: f32) -> f32 {
    let max_channel = color.max_element();
    let rhs = constant - VISIBILITY_THRESHOLD * max_channel;
    if quadratic.abs() <= f32::EPSILON {
        if linear > f32::EPSILON {
            return (-rhs / linear).max(0.0);
        }
        warn!("Point light has no distance attenuation; using fallback radius {LIGHT_RADIUS_FALLBACK}");
        return LIGHT_RADIUS_FALLBACK;
    }
    let discriminant = linear * linear - 4.0 * quadratic * rhs;
    if discriminant < 0.0 {
        warn!(
            "Point light attenuation (c={constant}, l={linear}, q={quadratic}) has no real cutoff; using fallback radius {LIGHT_RADIUS_FALLBACK}"
        );
        return LIGHT_RADIUS_FALLBACK;
    }
    let radius = (-linear + discriminant.sqrt()) / (2.0 * quadratic);
    if radius.is_finite() {
        radius.max(0.0)
    } else {
        LIGHT_RADIUS_FALLBACK
    }
}

/// Layout shared with `cull_lights.wgsl` and `forward_clustered.wgsl` (48 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PointLightGpu {
    pub position_radius: [f32; 4],
    pub color_constant: [f32; 4],
    pub attenuation: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_matches_closed_form() {
        let light = PointLight::new(Vec3::ZERO, Vec3::new(1.0, 0.5, 0.2), 1.0, 0.7, 1.8);
        let rhs: f32 = 1.0 - 256.0 / 5.0;
        let expected = (-0.7 + (0.49 - 4.0 * 1.8 * rhs).sqrt()) / (2.0 * 1.8);
        assert!((light.radius - expected).abs() < 1e-4);
        let attenuation = 1.0 / (1.0 + 0.7 * light.radius + 1.8 * light.radius * light.radius);
        assert!((attenuation - 5.0 / 256.0).abs() < 1e-4);
    }

    #[test]
    fn negative_discriminant_uses_finite_fallback() {
        let radius = light_radius(Vec3::splat(0.01), 100.0, 0.0, 1.0);
        assert_eq!(radius, LIGHT_RADIUS_FALLBACK);
    }

    #[test]
    fn linear_only_attenuation_solves_linear_equation() {
        let radius = light_radius(Vec3::ONE, 1.0, 0.5, 0.0);
        assert!((radius - (51.2 - 1.0) / 0.5).abs() < 1e-3);
    }

    #[test]
    fn gpu_layout_is_48_bytes() {
        assert_eq!(std::mem::size_of::<PointLightGpu>(), 48);
    }

    #[test]
    fn light_view_places_light_up_light_of_origin() {
        let light = DirectionalLight::new(Vec3::new(0.0, -1.0, -1.0), Vec3::ONE);
        let view = light.light_view(100.0);
        let origin = view.transform_point3(Vec3::ZERO);
        assert!((origin.z + 100.0).abs() < 1e-3);
        let straight_down = DirectionalLight::new(Vec3::NEG_Y, Vec3::ONE).light_view(50.0);
        assert!(!straight_down.to_cols_array().iter().any(|v| v.is_nan()));
    }
}
