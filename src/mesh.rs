use glam::Vec3;
use wgpu::util::DeviceExt;

use crate::geometry::{Aabb, BoundingSphere};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3) -> Self {
        Self { position: position.to_array(), normal: normal.to_array() }
    }

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x3 },
            ],
        }
    }
}

/// Model-space bounds computed once when the mesh is built.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshBounds {
    pub aabb: Aabb,
    pub sphere: BoundingSphere,
}

impl MeshBounds {
    /// Sphere is centred on the box centre with the radius of the farthest vertex.
    pub fn from_positions<I>(positions: I) -> Self
    where
        I: IntoIterator<Item = Vec3>,
        I::IntoIter: Clone,
    {
        let iter = positions.into_iter();
        let Some(aabb) = Aabb::from_points(iter.clone()) else {
            return Self {
                aabb: Aabb::new(Vec3::ZERO, Vec3::ZERO),
                sphere: BoundingSphere::new(Vec3::ZERO, 0.0),
            };
        };
        let center = aabb.center();
        let radius = iter.fold(0.0_f32, |radius, pos| radius.max(pos.distance(center)));
        Self { aabb, sphere: BoundingSphere::new(center, radius) }
    }

    pub fn from_vertices(vertices: &[MeshVertex]) -> Self {
        Self::from_positions(vertices.iter().map(|v| Vec3::from_array(v.position)))
    }
}

#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub bounds: MeshBounds,
}

impl Mesh {
    pub fn new(vertices: Vec<MeshVertex>, indices: Vec<u32>) -> Self {
        let bounds = MeshBounds::from_vertices(&vertices);
        Self { vertices, indices, bounds }
    }

    pub fn cube(size: f32) -> Self {
        let hs = size * 0.5;
        let positions = [
            Vec3::new(-hs, -hs, -hs),
            Vec3::new(hs, -hs, -hs),
            Vec3::new(hs, hs, -hs),
            Vec3::new(-hs, hs, -hs),
            Vec3::new(-hs, -hs, hs),
            Vec3::new(hs, -hs, hs),
            Vec3::new(hs, hs, hs),
            Vec3::new(-hs, hs, hs),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut write_face = |indices: [usize; 4], normal: Vec3| {
            for &index in &indices {
                vertices.push(MeshVertex::new(positions[index], normal));
            }
        };

        write_face([0, 3, 2, 1], Vec3::NEG_Z); // back
        write_face([4, 5, 6, 7], Vec3::Z); // front
        write_face([0, 4, 7, 3], Vec3::NEG_X); // left
        write_face([1, 2, 6, 5], Vec3::X); // right
        write_face([3, 7, 6, 2], Vec3::Y); // top
        write_face([0, 1, 5, 4], Vec3::NEG_Y); // bottom

        let mut indices = Vec::with_capacity(36);
        for face in 0..6 {
            let base = face * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self::new(vertices, indices)
    }

    /// Square in the XZ plane facing +Y.
    pub fn plane(size: f32) -> Self {
        let hs = size * 0.5;
        let vertices = vec![
            MeshVertex::new(Vec3::new(-hs, 0.0, -hs), Vec3::Y),
            MeshVertex::new(Vec3::new(-hs, 0.0, hs), Vec3::Y),
            MeshVertex::new(Vec3::new(hs, 0.0, hs), Vec3::Y),
            MeshVertex::new(Vec3::new(hs, 0.0, -hs), Vec3::Y),
        ];
        Self::new(vertices, vec![0, 1, 2, 0, 2, 3])
    }
}

/// Vertex/index buffers for a mesh plus the CPU bounds culling needs.
#[derive(Debug)]
pub struct GpuMesh {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
    pub bounds: MeshBounds,
}

impl GpuMesh {
    pub fn upload(device: &wgpu::Device, mesh: &Mesh, label: &str) -> Self {
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label} Vertex Buffer")),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label} Index Buffer")),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self { vertex_buffer, index_buffer, index_count: mesh.indices.len() as u32, bounds: mesh.bounds }
    }
}
