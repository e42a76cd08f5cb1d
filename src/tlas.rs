// src/tlas.rs
// Top-level acceleration structure over BLAS instances.
// This file exists to cluster instance AABBs into a traversable hierarchy, by mutual-nearest-neighbor agglomeration or a fast median split.
// RELEVANT FILES:src/kdtree.rs,src/instance.rs,src/blas.rs

use std::time::Instant;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::Vec3A;

use crate::instance::BvhInstance;
use crate::kdtree::KdTree;
use crate::types::{dominant_axis, Aabb, Ray};

const STACK_SIZE: usize = 64;

/// TLAS node, 32 bytes. A node is a leaf iff `left_right == 0`; leaves store
/// the BLAS-instance index in `blas`. Interior nodes pack two u16 child
/// indices into `left_right`, which caps a scene at 65535 TLAS nodes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TlasNode {
    pub aabb_min: [f32; 3],
    pub left_right: u32,
    pub aabb_max: [f32; 3],
    pub blas: u32,
}

impl TlasNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.left_right == 0
    }

    #[inline]
    pub fn left(&self) -> u32 {
        self.left_right & 0xffff
    }

    #[inline]
    pub fn right(&self) -> u32 {
        self.left_right >> 16
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

    fn leaf(aabb: &Aabb, blas: u32) -> Self {
        Self {
            aabb_min: aabb.min.to_array(),
            left_right: 0,
            aabb_max: aabb.max.to_array(),
            blas,
        }
    }

    fn interior(aabb: &Aabb, left_right: u32) -> Self {
        Self {
            aabb_min: aabb.min.to_array(),
            left_right,
            aabb_max: aabb.max.to_array(),
            blas: 0,
        }
    }
}

const _: () = {
    assert!(std::mem::size_of::<TlasNode>() == 32);
};

/// Top-level BVH over BLAS instances.
///
/// Node slot 0 is unused during construction; both builders copy the
/// finished root there, so traversal always starts at node 0. Instance
/// leaves occupy slots `1..=N` and merged nodes follow, `2N` slots total.
#[derive(Debug)]
pub struct Tlas<'a> {
    blas: &'a [BvhInstance<'a>],
    nodes: Vec<TlasNode>,
    nodes_used: u32,
    kdtree: KdTree,
}

impl<'a> Tlas<'a> {
    pub fn new(blas: &'a [BvhInstance<'a>]) -> Self {
        let n = blas.len();
        Self {
            blas,
            nodes: vec![TlasNode::zeroed(); (2 * n).max(2)],
            nodes_used: 0,
            kdtree: KdTree::new(n as u32),
        }
    }

    pub fn nodes(&self) -> &[TlasNode] {
        &self.nodes[..self.nodes_used as usize]
    }

    pub fn node_count(&self) -> u32 {
        self.nodes_used
    }

    pub fn instances(&self) -> &'a [BvhInstance<'a>] {
        self.blas
    }

    /// High-quality agglomerative build: repeatedly merge the mutual nearest
    /// pair (by merged half surface area), tracking candidates through the
    /// kD-tree. The "is A still best for B?" chase step keeps merges mutual,
    /// and seeding the search with the current pair's area prunes harder as
    /// candidates improve.
    pub fn build(&mut self) -> Result<()> {
        let n = self.init_leaves()?;
        let start = Instant::now();
        if n == 1 {
            self.nodes[0] = self.nodes[1];
            self.nodes_used = 2;
            return Ok(());
        }

        let leaf_bounds: Vec<Aabb> = (1..=n).map(|i| self.nodes[i as usize].aabb()).collect();
        self.kdtree.rebuild(&leaf_bounds);

        let mut live = n;
        let mut a = 1u32;
        let mut best_b = a;
        let mut best_sa = f32::INFINITY;
        self.kdtree.find_nearest(a, &mut best_b, &mut best_sa);

        let root = loop {
            // Chase: does best_b consider anything (strictly) better than a?
            let mut candidate = a;
            let mut candidate_sa = best_sa;
            self.kdtree.find_nearest(best_b, &mut candidate, &mut candidate_sa);

            if candidate != a {
                a = best_b;
                best_b = candidate;
                best_sa = candidate_sa;
                continue;
            }

            // a and best_b are mutual nearest neighbors; merge them.
            let merged = self.nodes[a as usize]
                .aabb()
                .union(&self.nodes[best_b as usize].aabb());
            let new_idx = self.nodes_used;
            self.nodes_used += 1;
            self.nodes[new_idx as usize] = TlasNode::interior(&merged, (a << 16) | best_b);

            live -= 1;
            if live == 1 {
                // Final merge; the kD-tree has served its purpose and would
                // otherwise be asked to empty itself below its one-instance
                // minimum.
                break new_idx;
            }
            self.kdtree.remove_leaf(a);
            self.kdtree.remove_leaf(best_b);
            self.kdtree.add(new_idx, &merged);

            a = new_idx;
            best_b = a;
            best_sa = f32::INFINITY;
            self.kdtree.find_nearest(a, &mut best_b, &mut best_sa);
        };

        self.nodes[0] = self.nodes[root as usize];
        log::debug!(
            "built TLAS: {} instances, {} nodes, {:.2}ms",
            n,
            self.nodes_used,
            start.elapsed().as_secs_f32() * 1000.0
        );
        Ok(())
    }

    /// Fast fallback build: recursive median split of the instance leaves on
    /// the dominant axis of their centroid bounds, nodes emitted post-order.
    /// Lower quality than the agglomerative build, O(N log N) with small
    /// constants, no kD-tree involved.
    pub fn build_quick(&mut self) -> Result<()> {
        let n = self.init_leaves()?;
        let start = Instant::now();
        if n == 1 {
            self.nodes[0] = self.nodes[1];
            self.nodes_used = 2;
            return Ok(());
        }

        let mut order: Vec<u32> = (1..=n).collect();
        let root = self.subdivide_quick(&mut order);
        self.nodes[0] = self.nodes[root as usize];
        log::debug!(
            "built TLAS (quick): {} instances, {} nodes, {:.2}ms",
            n,
            self.nodes_used,
            start.elapsed().as_secs_f32() * 1000.0
        );
        Ok(())
    }

    /// Closest-hit traversal; leaves dispatch into their BLAS instance.
    /// Read-only, safe from many threads with per-thread rays.
    pub fn intersect(&self, ray: &mut Ray) {
        if self.nodes_used == 0 {
            return;
        }
        let mut stack = [0u32; STACK_SIZE];
        let mut sp = 0usize;
        let mut node_idx = 0u32;
        loop {
            let node = &self.nodes[node_idx as usize];
            if node.is_leaf() {
                self.blas[node.blas as usize].intersect(ray);
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
                continue;
            }

            let mut near = node.left();
            let mut far = node.right();
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

    /// Write one TLAS leaf per instance into slots `1..=N` and position the
    /// allocation cursor after them. Returns the instance count.
    fn init_leaves(&mut self) -> Result<u32> {
        if self.blas.is_empty() {
            anyhow::bail!("cannot build a TLAS over zero instances");
        }
        let n = self.blas.len() as u32;
        for (i, instance) in self.blas.iter().enumerate() {
            self.nodes[i + 1] = TlasNode::leaf(instance.bounds(), i as u32);
        }
        self.nodes_used = n + 1;
        Ok(n)
    }

    fn subdivide_quick(&mut self, order: &mut [u32]) -> u32 {
        if order.len() == 1 {
            return order[0];
        }

        let mut centroid_bounds = Aabb::empty();
        for &i in order.iter() {
            centroid_bounds.grow(self.nodes[i as usize].aabb().center());
        }
        let axis = dominant_axis(centroid_bounds.extent());
        order.sort_unstable_by(|&l, &r| {
            let cl = self.nodes[l as usize].aabb().center()[axis];
            let cr = self.nodes[r as usize].aabb().center()[axis];
            cl.partial_cmp(&cr).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mid = order.len() / 2;
        let (left_half, right_half) = order.split_at_mut(mid);
        let left = self.subdivide_quick(left_half);
        let right = self.subdivide_quick(right_half);

        let merged = self.nodes[left as usize]
            .aabb()
            .union(&self.nodes[right as usize].aabb());
        let new_idx = self.nodes_used;
        self.nodes_used += 1;
        self.nodes[new_idx as usize] = TlasNode::interior(&merged, (right << 16) | left);
        new_idx
    }
}
