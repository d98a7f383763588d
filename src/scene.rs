use glam::{Mat4, Quat, Vec3};

use crate::geometry::Aabb;
use crate::light::{DirectionalLight, PointLight};
use crate::mesh::{Mesh, MeshBounds};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub usize);

/// One placement of a mesh. `bounds` is copied from the mesh so culling never
/// has to look the mesh up.
#[derive(Clone, Copy, Debug)]
pub struct MeshInstance {
    pub mesh: MeshHandle,
    pub bounds: MeshBounds,
    pub model: Mat4,
    pub color: Vec3,
    pub casts_shadows: bool,
}

impl MeshInstance {
    pub fn world_aabb(&self) -> Aabb {
        self.bounds.aabb.transformed(self.model)
    }
}

/// Scene collaborator: owns CPU meshes, their instances and the light list.
#[derive(Debug, Default)]
pub struct Scene {
    meshes: Vec<Mesh>,
    instances: Vec<MeshInstance>,
    point_lights: Vec<PointLight>,
    sun: DirectionalLight,
}

impl Scene {
    pub fn new(sun: DirectionalLight) -> Self {
        Self { sun, ..Default::default() }
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshHandle {
        self.meshes.push(mesh);
        MeshHandle(self.meshes.len() - 1)
    }

    pub fn mesh(&self, handle: MeshHandle) -> Option<&Mesh> {
        self.meshes.get(handle.0)
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    /// Returns `None` when the handle does not name a mesh of this scene.
    pub fn spawn(&mut self, mesh: MeshHandle, model: Mat4) -> Option<usize> {
        let bounds = self.mesh(mesh)?.bounds;
        self.instances.push(MeshInstance { mesh, bounds, model, color: Vec3::splat(0.8), casts_shadows: true });
        Some(self.instances.len() - 1)
    }

    pub fn instances(&self) -> &[MeshInstance] {
        &self.instances
    }

    pub fn add_point_light(&mut self, light: PointLight) {
        self.point_lights.push(light);
    }

    pub fn point_lights(&self) -> &[PointLight] {
        &self.point_lights
    }

    pub fn sun(&self) -> &DirectionalLight {
        &self.sun
    }

    /// World-space boxes of every instance, consumed by shadow near/far fitting.
    pub fn all_object_bounds(&self) -> Vec<Aabb> {
        self.instances.iter().map(MeshInstance::world_aabb).collect()
    }

    /// Ground slab, a `grid` x `grid` field of cubes and a ring of coloured point lights.
    pub fn demo(grid: u32, light_count: u32) -> Self {
        let mut scene = Scene::new(DirectionalLight::default());
        let ground = scene.add_mesh(Mesh::plane(1.0));
        let cube = scene.add_mesh(Mesh::cube(1.0));

        let extent = grid as f32 * 3.0;
        if let Some(index) = scene.spawn(ground, Mat4::from_scale(Vec3::new(extent * 2.0, 1.0, extent * 2.0))) {
            scene.instances[index].casts_shadows = false;
            scene.instances[index].color = Vec3::new(0.45, 0.5, 0.45);
        }
        let half = (grid as f32 - 1.0) * 0.5;
        for x in 0..grid {
            for z in 0..grid {
                let height = 1.0 + ((x * 7 + z * 3) % 4) as f32;
                let position = Vec3::new((x as f32 - half) * 3.0, height * 0.5, (z as f32 - half) * 3.0);
                let model =
                    Mat4::from_scale_rotation_translation(Vec3::new(1.0, height, 1.0), Quat::IDENTITY, position);
                if let Some(index) = scene.spawn(cube, model) {
                    scene.instances[index].color = Vec3::new(0.6 + height * 0.08, 0.6, 0.75 - height * 0.08);
                }
            }
        }

        let palette = [Vec3::new(1.0, 0.3, 0.2), Vec3::new(0.2, 0.8, 1.0), Vec3::new(1.0, 0.9, 0.4)];
        for i in 0..light_count {
            let angle = i as f32 / light_count.max(1) as f32 * std::f32::consts::TAU;
            let radius = extent * 0.5;
            let position = Vec3::new(angle.cos() * radius, 2.0, angle.sin() * radius);
            let color = palette[i as usize % palette.len()];
            scene.add_point_light(PointLight::new(position, color, 1.0, 0.35, 0.44));
        }
        scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_rejects_unknown_mesh() {
        let mut scene = Scene::default();
        assert!(scene.spawn(MeshHandle(3), Mat4::IDENTITY).is_none());
        let cube = scene.add_mesh(Mesh::cube(1.0));
        assert_eq!(scene.spawn(cube, Mat4::IDENTITY), Some(0));
    }

    #[test]
    fn object_bounds_are_in_world_space() {
        let mut scene = Scene::default();
        let cube = scene.add_mesh(Mesh::cube(2.0));
        scene.spawn(cube, Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        let bounds = scene.all_object_bounds();
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[0].min, Vec3::new(9.0, -1.0, -1.0));
        assert_eq!(bounds[0].max, Vec3::new(11.0, 1.0, 1.0));
    }

    #[test]
    fn demo_scene_has_ground_cubes_and_lights() {
        let scene = Scene::demo(3, 5);
        assert_eq!(scene.instances().len(), 1 + 9);
        assert_eq!(scene.point_lights().len(), 5);
        assert!(!scene.instances()[0].casts_shadows);
        assert!(scene.point_lights().iter().all(|light| light.radius > 0.0 && light.radius.is_finite()));
    }
}
