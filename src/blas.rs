// src/blas.rs
// Per-mesh bounding volume hierarchy: binned SAH build, refit, and ray traversal.
// This file exists to provide the bottom-level acceleration structure the TLAS dispatches into.
// RELEVANT FILES:src/types.rs,src/mesh.rs,src/instance.rs,src/tlas.rs

use std::time::Instant;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::Vec3A;

use crate::mesh::{validate_mesh, TriMesh};
use crate::types::{Aabb, Hit, Ray, Triangle};

/// Bin count for the binned SAH split search.
const BINS: usize = 8;

/// Traversal stack depth; enough for any binary tree the builder can emit.
const STACK_SIZE: usize = 64;

/// BVH node, 32 bytes. A node is a leaf iff `tri_count > 0`; empty leaves do
/// not exist. For interior nodes `left_first` is the left child index and the
/// right child is `left_first + 1`. For leaves it is the start of the node's
/// range in the triangle index array.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_first: u32,
    pub aabb_max: [f32; 3],
    pub tri_count: u32,
}

impl BvhNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }

    #[inline]
    pub fn bmin(&self) -> Vec3A {
        Vec3A::from(self.aabb_min)
    }

    #[inline]
    pub fn bmax(&self) -> Vec3A {
        Vec3A::from(self.aabb_max)
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::new(self.bmin(), self.bmax())
    }

    fn set_aabb(&mut self, aabb: &Aabb) {
        self.aabb_min = aabb.min.to_array();
        self.aabb_max = aabb.max.to_array();
    }

    /// SAH cost of keeping this node as a leaf.
    fn leaf_cost(&self) -> f32 {
        self.aabb().half_area() * self.tri_count as f32
    }
}

const _: () = {
    assert!(std::mem::size_of::<BvhNode>() == 32);
};

/// Statistics from the most recent `build`.
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub build_time_ms: f32,
    pub node_count: u32,
    pub leaf_count: u32,
    pub max_depth: u32,
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: u32,
}

impl Default for Bin {
    fn default() -> Self {
        Self {
            bounds: Aabb::empty(),
            count: 0,
        }
    }
}

/// Bounding volume hierarchy over one mesh's triangles (the BLAS).
///
/// Owns its mesh; arrays are sized once for `2N - 1` nodes and reused across
/// rebuilds. After `build`, the leaves' ranges partition `[0, N)` exactly.
#[derive(Debug)]
pub struct Bvh {
    mesh: TriMesh,
    nodes: Vec<BvhNode>,
    tri_idx: Vec<u32>,
    nodes_used: u32,
    stats: BuildStats,
}

impl Bvh {
    pub fn new(mesh: TriMesh) -> Self {
        let n = mesh.triangle_count() as usize;
        Self {
            mesh,
            nodes: vec![BvhNode::zeroed(); (2 * n).saturating_sub(1).max(1)],
            tri_idx: (0..n as u32).collect(),
            nodes_used: 0,
            stats: BuildStats::default(),
        }
    }

    pub fn mesh(&self) -> &TriMesh {
        &self.mesh
    }

    /// Mutable triangle access for animation. Node bounds are stale until the
    /// next `refit` or `build`.
    pub fn mesh_mut(&mut self) -> &mut TriMesh {
        &mut self.mesh
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes[..self.nodes_used as usize]
    }

    pub fn tri_indices(&self) -> &[u32] {
        &self.tri_idx
    }

    pub fn node_count(&self) -> u32 {
        self.nodes_used
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Root AABB in mesh-local space. Only meaningful after `build`.
    pub fn world_bounds(&self) -> Aabb {
        self.nodes[0].aabb()
    }

    /// Build the hierarchy with a binned SAH (8 bins per axis). Subdivision
    /// stops where the best split would not beat the leaf cost.
    pub fn build(&mut self) -> Result<()> {
        validate_mesh(&self.mesh)?;
        let start = Instant::now();

        let n = self.mesh.triangle_count();
        for (i, slot) in self.tri_idx.iter_mut().enumerate() {
            *slot = i as u32;
        }
        self.stats = BuildStats::default();
        self.nodes[0] = BvhNode {
            aabb_min: [0.0; 3],
            left_first: 0,
            aabb_max: [0.0; 3],
            tri_count: n,
        };
        self.nodes_used = 1;
        self.update_node_bounds(0);
        self.subdivide(0, 0);

        self.stats.build_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        self.stats.node_count = self.nodes_used;
        log::debug!(
            "built BLAS: {} tris, {} nodes, {} leaves, depth {}, {:.2}ms",
            n,
            self.stats.node_count,
            self.stats.leaf_count,
            self.stats.max_depth,
            self.stats.build_time_ms
        );
        Ok(())
    }

    /// Recompute node bounds bottom-up without changing topology. Valid after
    /// triangle displacement that keeps the leaf assignment reasonable.
    pub fn refit(&mut self) {
        for i in (0..self.nodes_used as usize).rev() {
            if self.nodes[i].is_leaf() {
                self.update_node_bounds(i);
            } else {
                let left = self.nodes[self.nodes[i].left_first as usize].aabb();
                let right = self.nodes[self.nodes[i].left_first as usize + 1].aabb();
                self.nodes[i].set_aabb(&left.union(&right));
            }
        }
    }

    /// Closest-hit traversal. `instance_idx` lands in the high bits of the
    /// hit record's packed index. Read-only on the structure; callers may
    /// intersect the same BVH from many threads with per-thread rays.
    pub fn intersect(&self, ray: &mut Ray, instance_idx: u32) {
        if self.nodes_used == 0 {
            return;
        }
        let mut stack = [0u32; STACK_SIZE];
        let mut sp = 0usize;
        let mut node_idx = 0u32;
        loop {
            let node = &self.nodes[node_idx as usize];
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let prim = self.tri_idx[(node.left_first + i) as usize];
                    intersect_tri(
                        ray,
                        &self.mesh.triangles()[prim as usize],
                        Hit::pack(instance_idx, prim),
                    );
                }
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
                continue;
            }

            let mut near = node.left_first;
            let mut far = near + 1;
            let mut near_dist = {
                let c = &self.nodes[near as usize];
                ray.aabb_distance(c.bmin(), c.bmax())
            };
            let mut far_dist = {
                let c = &self.nodes[far as usize];
                ray.aabb_distance(c.bmin(), c.bmax())
            };
            if near_dist > far_dist {
                std::mem::swap(&mut near, &mut far);
                std::mem::swap(&mut near_dist, &mut far_dist);
            }
            if near_dist == f32::INFINITY {
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
            } else {
                node_idx = near;
                if far_dist < f32::INFINITY {
                    stack[sp] = far;
                    sp += 1;
                }
            }
        }
    }

    fn update_node_bounds(&mut self, node_idx: usize) {
        let node = self.nodes[node_idx];
        let mut aabb = Aabb::empty();
        for i in 0..node.tri_count {
            let tri = &self.mesh.triangles()[self.tri_idx[(node.left_first + i) as usize] as usize];
            aabb.grow(tri.v0);
            aabb.grow(tri.v1);
            aabb.grow(tri.v2);
        }
        self.nodes[node_idx].set_aabb(&aabb);
    }

    /// Binned SAH split search. Returns `(axis, position, cost)`; the cost is
    /// infinite when no axis has centroid spread. Ties resolve to the lower
    /// axis, then the lower plane.
    fn find_best_split_plane(&self, node: &BvhNode) -> (usize, f32, f32) {
        let first = node.left_first as usize;
        let count = node.tri_count as usize;
        let tris = self.mesh.triangles();

        let mut best_axis = 0usize;
        let mut best_pos = 0.0f32;
        let mut best_cost = f32::INFINITY;

        for axis in 0..3 {
            let mut cmin = f32::INFINITY;
            let mut cmax = f32::NEG_INFINITY;
            for i in 0..count {
                let c = tris[self.tri_idx[first + i] as usize].centroid[axis];
                cmin = cmin.min(c);
                cmax = cmax.max(c);
            }
            if cmin == cmax {
                continue;
            }

            let mut bins = [Bin::default(); BINS];
            let scale = BINS as f32 / (cmax - cmin);
            for i in 0..count {
                let tri = &tris[self.tri_idx[first + i] as usize];
                let bin = (((tri.centroid[axis] - cmin) * scale) as usize).min(BINS - 1);
                bins[bin].count += 1;
                bins[bin].bounds.grow(tri.v0);
                bins[bin].bounds.grow(tri.v1);
                bins[bin].bounds.grow(tri.v2);
            }

            let mut left_area = [0.0f32; BINS - 1];
            let mut right_area = [0.0f32; BINS - 1];
            let mut left_count = [0u32; BINS - 1];
            let mut right_count = [0u32; BINS - 1];
            let mut left_box = Aabb::empty();
            let mut right_box = Aabb::empty();
            let mut left_sum = 0u32;
            let mut right_sum = 0u32;
            for i in 0..BINS - 1 {
                left_sum += bins[i].count;
                left_count[i] = left_sum;
                left_box.grow_aabb(&bins[i].bounds);
                left_area[i] = left_box.half_area();

                right_sum += bins[BINS - 1 - i].count;
                right_count[BINS - 2 - i] = right_sum;
                right_box.grow_aabb(&bins[BINS - 1 - i].bounds);
                right_area[BINS - 2 - i] = right_box.half_area();
            }

            let plane_width = (cmax - cmin) / BINS as f32;
            for plane in 0..BINS - 1 {
                if left_count[plane] == 0 || right_count[plane] == 0 {
                    continue;
                }
                let cost = left_area[plane] * left_count[plane] as f32
                    + right_area[plane] * right_count[plane] as f32;
                if cost < best_cost {
                    best_axis = axis;
                    best_pos = cmin + plane_width * (plane + 1) as f32;
                    best_cost = cost;
                }
            }
        }

        (best_axis, best_pos, best_cost)
    }

    fn subdivide(&mut self, node_idx: usize, depth: u32) {
        self.stats.max_depth = self.stats.max_depth.max(depth);
        let node = self.nodes[node_idx];

        let (axis, split_pos, split_cost) = self.find_best_split_plane(&node);
        if split_cost >= node.leaf_cost() {
            self.stats.leaf_count += 1;
            return;
        }

        // In-place partition of the index range by centroid side.
        let first = node.left_first as i64;
        let mut i = first;
        let mut j = first + node.tri_count as i64 - 1;
        while i <= j {
            let c = self.mesh.triangles()[self.tri_idx[i as usize] as usize].centroid[axis];
            if c < split_pos {
                i += 1;
            } else {
                self.tri_idx.swap(i as usize, j as usize);
                j -= 1;
            }
        }

        let left_count = (i - first) as u32;
        if left_count == 0 || left_count == node.tri_count {
            // All centroids landed in one bin range; keep the leaf.
            self.stats.leaf_count += 1;
            return;
        }

        let left_idx = self.nodes_used as usize;
        self.nodes_used += 2;
        self.nodes[left_idx] = BvhNode {
            aabb_min: [0.0; 3],
            left_first: node.left_first,
            aabb_max: [0.0; 3],
            tri_count: left_count,
        };
        self.nodes[left_idx + 1] = BvhNode {
            aabb_min: [0.0; 3],
            left_first: i as u32,
            aabb_max: [0.0; 3],
            tri_count: node.tri_count - left_count,
        };
        self.nodes[node_idx].left_first = left_idx as u32;
        self.nodes[node_idx].tri_count = 0;

        self.update_node_bounds(left_idx);
        self.update_node_bounds(left_idx + 1);
        self.subdivide(left_idx, depth + 1);
        self.subdivide(left_idx + 1, depth + 1);
    }
}

/// Moeller-Trumbore intersection; improves the ray's hit record in place.
fn intersect_tri(ray: &mut Ray, tri: &Triangle, inst_prim: u32) {
    let edge1 = tri.v1 - tri.v0;
    let edge2 = tri.v2 - tri.v0;
    let h = ray.dir.cross(edge2);
    let a = edge1.dot(h);
    if a > -1e-7 && a < 1e-7 {
        return; // ray parallel to the triangle plane
    }
    let f = 1.0 / a;
    let s = ray.origin - tri.v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return;
    }
    let q = s.cross(edge1);
    let v = f * ray.dir.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return;
    }
    let t = f * edge2.dot(q);
    if t > 1e-4 && t < ray.hit.t {
        ray.hit = Hit {
            t,
            u,
            v,
            inst_prim,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::mesh_builders;

    #[test]
    fn node_layout_is_frozen() {
        assert_eq!(std::mem::size_of::<BvhNode>(), 32);
    }

    #[test]
    fn single_triangle_builds_leaf_root() {
        let mut bvh = Bvh::new(mesh_builders::triangle());
        bvh.build().unwrap();
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.nodes()[0].is_leaf());
        assert_eq!(bvh.nodes()[0].tri_count, 1);
    }

    #[test]
    fn cube_build_covers_all_triangles() {
        let mut bvh = Bvh::new(mesh_builders::cube());
        bvh.build().unwrap();
        assert!(bvh.world_bounds().is_valid());

        let mut seen = vec![0u32; 12];
        for node in bvh.nodes() {
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    seen[bvh.tri_indices()[(node.left_first + i) as usize] as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "leaf ranges must cover each triangle once");
    }

    #[test]
    fn empty_mesh_build_fails() {
        let mut bvh = Bvh::new(TriMesh::default());
        assert!(bvh.build().is_err());
    }

    #[test]
    fn intersect_finds_nearest_of_stacked_quads() {
        let mut far_quad = mesh_builders::quad();
        far_quad.translate(Vec3A::new(0.0, 0.0, 3.0));
        let mut tris = mesh_builders::quad().triangles().to_vec();
        tris.extend_from_slice(far_quad.triangles());

        let mut bvh = Bvh::new(TriMesh::new(tris));
        bvh.build().unwrap();

        let mut ray = Ray::new(Vec3A::new(0.5, 0.5, -1.0), Vec3A::Z);
        bvh.intersect(&mut ray, 3);
        assert!((ray.hit.t - 1.0).abs() < 1e-6);
        assert_eq!(ray.hit.instance(), 3);
        assert!(ray.hit.prim() < 2, "must hit the near quad");
    }
}
