// src/mesh.rs
// Triangle mesh container and procedural builders for the BLAS.
// This file exists to own the triangle/centroid arrays the BVH indexes into and to supply deterministic test meshes.
// RELEVANT FILES:src/blas.rs,src/types.rs

use anyhow::Result;
use glam::Vec3A;

use crate::types::Triangle;

/// Owned triangle array. Centroids are maintained by construction; code that
/// mutates vertices through `triangles_mut` must keep them consistent (or
/// rebuild triangles through `Triangle::new`) before the next build/refit.
#[derive(Debug, Clone, Default)]
pub struct TriMesh {
    tris: Vec<Triangle>,
}

impl TriMesh {
    pub fn new(tris: Vec<Triangle>) -> Self {
        Self { tris }
    }

    /// Assemble triangles from indexed vertex data (CCW winding assumed).
    pub fn from_vertices(vertices: &[[f32; 3]], indices: &[[u32; 3]]) -> Self {
        let tris = indices
            .iter()
            .map(|idx| {
                Triangle::new(
                    Vec3A::from(vertices[idx[0] as usize]),
                    Vec3A::from(vertices[idx[1] as usize]),
                    Vec3A::from(vertices[idx[2] as usize]),
                )
            })
            .collect();
        Self { tris }
    }

    pub fn triangle_count(&self) -> u32 {
        self.tris.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.tris.is_empty()
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.tris
    }

    pub fn triangles_mut(&mut self) -> &mut [Triangle] {
        &mut self.tris
    }

    /// Displace the whole mesh, keeping centroids consistent.
    pub fn translate(&mut self, offset: Vec3A) {
        for tri in &mut self.tris {
            tri.v0 += offset;
            tri.v1 += offset;
            tri.v2 += offset;
            tri.centroid += offset;
        }
    }
}

/// Reject meshes the builders cannot accept and warn about geometry that is
/// legal but degrades tree quality. NaN coordinates remain the caller's
/// responsibility.
pub fn validate_mesh(mesh: &TriMesh) -> Result<()> {
    if mesh.is_empty() {
        anyhow::bail!("mesh has no triangles");
    }

    let degenerate = mesh
        .tris
        .iter()
        .filter(|t| t.normal().length_squared() <= f32::EPSILON)
        .count();
    if degenerate > 0 {
        log::warn!("mesh contains {} degenerate triangles", degenerate);
    }

    Ok(())
}

/// Deterministic procedural meshes for tests and benchmarks.
pub mod mesh_builders {
    use super::*;

    /// Single triangle in the z = 0 plane.
    pub fn triangle() -> TriMesh {
        TriMesh::from_vertices(
            &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.5, 1.0, 0.0]],
            &[[0, 1, 2]],
        )
    }

    /// Unit quad in the z = 0 plane, two triangles.
    pub fn quad() -> TriMesh {
        TriMesh::from_vertices(
            &[
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            &[[0, 1, 2], [0, 2, 3]],
        )
    }

    /// Axis-aligned unit cube, 12 triangles.
    pub fn cube() -> TriMesh {
        let vertices = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        let indices = [
            [0, 1, 2],
            [0, 2, 3],
            [1, 5, 6],
            [1, 6, 2],
            [5, 4, 7],
            [5, 7, 6],
            [4, 0, 3],
            [4, 3, 7],
            [3, 2, 6],
            [3, 6, 7],
            [4, 5, 1],
            [4, 1, 0],
        ];
        TriMesh::from_vertices(&vertices, &indices)
    }

    /// `nx * ny` quads in the y = 0 plane, `2 * nx * ny` triangles.
    pub fn grid(nx: u32, ny: u32) -> TriMesh {
        let mut vertices = Vec::new();
        for j in 0..=ny {
            for i in 0..=nx {
                vertices.push([i as f32, 0.0, j as f32]);
            }
        }
        let mut indices = Vec::new();
        for j in 0..ny {
            for i in 0..nx {
                let base = j * (nx + 1) + i;
                indices.push([base, base + 1, base + nx + 1]);
                indices.push([base + 1, base + nx + 2, base + nx + 1]);
            }
        }
        TriMesh::from_vertices(&vertices, &indices)
    }
}
