use glam::{Mat4, Vec3, Vec4};

/// Plane in Hessian normal form. Points with a negative distance lie outside the
/// frustum the plane belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrustumPlane {
    pub normal: Vec3,
    pub distance: f32,
}

impl FrustumPlane {
    pub const fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    pub fn from_vec4(coefficients: Vec4) -> Self {
        Self { normal: coefficients.truncate(), distance: coefficients.w }
    }

    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    /// Scales normal and distance by the same factor so `|normal| == 1`.
    pub fn normalized(&self) -> Self {
        let length = self.normal.length();
        if length <= f32::EPSILON {
            return *self;
        }
        Self { normal: self.normal / length, distance: self.distance / length }
    }
}

/// Planes ordered left, right, bottom, top, near, far.
pub type FrustumPlanes = [FrustumPlane; 6];

/// Gribb–Hartmann extraction for a clip matrix with OpenGL depth ([-1, 1]).
pub fn extract_frustum_planes(view_proj: Mat4) -> FrustumPlanes {
    let row0 = view_proj.row(0);
    let row1 = view_proj.row(1);
    let row2 = view_proj.row(2);
    let row3 = view_proj.row(3);
    [
        FrustumPlane::from_vec4(row3 + row0).normalized(),
        FrustumPlane::from_vec4(row3 - row0).normalized(),
        FrustumPlane::from_vec4(row3 + row1).normalized(),
        FrustumPlane::from_vec4(row3 - row1).normalized(),
        FrustumPlane::from_vec4(row3 + row2).normalized(),
        FrustumPlane::from_vec4(row3 - row2).normalized(),
    ]
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Returns `None` for an empty iterator.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = Vec3>,
    {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb { min: self.min.min(other.min), max: self.max.max(other.max) }
    }

    /// Corner `i` takes `max` on axis x when bit 0 is set, y for bit 1, z for bit 2,
    /// so the z axis varies slowest.
    pub fn corners(&self) -> [Vec3; 8] {
        let (min, max) = (self.min, self.max);
        [
            Vec3::new(min.x, min.y, min.z),
            Vec3::new(max.x, min.y, min.z),
            Vec3::new(min.x, max.y, min.z),
            Vec3::new(max.x, max.y, min.z),
            Vec3::new(min.x, min.y, max.z),
            Vec3::new(max.x, min.y, max.z),
            Vec3::new(min.x, max.y, max.z),
            Vec3::new(max.x, max.y, max.z),
        ]
    }

    /// Box enclosing the eight corners after an affine transform.
    pub fn transformed(&self, model: Mat4) -> Aabb {
        let corners = self.corners().map(|corner| model.transform_point3(corner));
        let mut min = corners[0];
        let mut max = corners[0];
        for corner in &corners[1..] {
            min = min.min(*corner);
            max = max.max(*corner);
        }
        Aabb { min, max }
    }
}

/// The radius is not scaled by the model matrix, so only uniform scale is exact.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn world_center(&self, model: Mat4) -> Vec3 {
        model.transform_point3(self.center)
    }
}
