// src/kdtree.rs
// Dynamic kD-tree over instance centroids with cached cluster minima for nearest-pair pruning.
// This file exists to push the agglomerative TLAS build's best-pair search from O(N^2) toward near-linearithmic.
// RELEVANT FILES:src/tlas.rs,src/types.rs

use glam::Vec3A;

use crate::types::{dominant_axis, half_area, Aabb};

/// Search stack depth for `find_nearest`.
const STACK_SIZE: usize = 60;

/// Nodes with more instances than this get the balanced split position
/// instead of the plain centroid-range midpoint.
const BALANCE_THRESHOLD: u32 = 150;

/// Low-3-bit `parax` value tagging a leaf.
const LEAF_TAG: u32 = 7;

/// kD-tree node, 64 bytes.
///
/// `left`/`right` double as `first`/`count` when the node is a leaf; `parax`
/// packs the parent index (bits 3..) with the split axis (bits 0..3), where
/// the axis field holding 7 marks a leaf. Rust has no anonymous unions, so
/// the leaf view goes through the `first`/`count` accessors.
///
/// `bmin`/`bmax` bound the *centroids* of the instances below this node, not
/// their full boxes. `min_size` is the componentwise minimum half-extent of
/// any instance below; together they admit a conservative lower bound on the
/// merged surface area with any instance in the subtree.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KdNode {
    left: u32,
    right: u32,
    parax: u32,
    split_pos: f32,
    bmin: Vec3A,
    bmax: Vec3A,
    min_size: Vec3A,
}

impl KdNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.parax & 7 == LEAF_TAG
    }

    #[inline]
    pub fn parent(&self) -> u32 {
        self.parax >> 3
    }

    /// Split axis of an interior node.
    #[inline]
    pub fn split_axis(&self) -> usize {
        debug_assert!(!self.is_leaf());
        (self.parax & 7) as usize
    }

    #[inline]
    pub fn split_pos(&self) -> f32 {
        self.split_pos
    }

    #[inline]
    pub fn left(&self) -> u32 {
        debug_assert!(!self.is_leaf());
        self.left
    }

    #[inline]
    pub fn right(&self) -> u32 {
        debug_assert!(!self.is_leaf());
        self.right
    }

    /// Start of a leaf's range in the index array.
    #[inline]
    pub fn first(&self) -> u32 {
        debug_assert!(self.is_leaf());
        self.left
    }

    /// Number of instances in a leaf.
    #[inline]
    pub fn count(&self) -> u32 {
        debug_assert!(self.is_leaf());
        self.right
    }

    pub fn centroid_bmin(&self) -> Vec3A {
        self.bmin
    }

    pub fn centroid_bmax(&self) -> Vec3A {
        self.bmax
    }

    pub fn min_size(&self) -> Vec3A {
        self.min_size
    }
}

impl Default for KdNode {
    fn default() -> Self {
        Self {
            left: 0,
            right: 0,
            parax: 0,
            split_pos: 0.0,
            bmin: Vec3A::ZERO,
            bmax: Vec3A::ZERO,
            min_size: Vec3A::ZERO,
        }
    }
}

const _: () = {
    assert!(std::mem::size_of::<KdNode>() == 64);
    assert!(std::mem::align_of::<KdNode>() == 16);
};

/// Centroid kD-tree over TLAS instance nodes.
///
/// Arena-owned flat arrays, sized once for an initial instance count `N`:
/// the tree serves the agglomerative TLAS build, whose node indices range
/// over `1..2N`. `rebuild` initializes from scratch; `remove_leaf` then
/// `add` reuse the two freed node slots, so clustering never grows the
/// arena. All instance identifiers here are TLAS node indices (slot 0 of
/// the bounds array is reserved, matching the TLAS's unused node 0).
#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    bounds: Vec<Aabb>,
    tlas_idx: Vec<u32>,
    leaf: Vec<u32>,
    node_ptr: u32,
    tlas_count: u32,
    blas_count: u32,
    freed: Option<[u32; 2]>,
}

impl KdTree {
    /// Allocate for `n` initial instances.
    pub fn new(n: u32) -> Self {
        let slots = 2 * (n as usize + 1);
        Self {
            nodes: vec![KdNode::default(); slots],
            bounds: vec![Aabb::empty(); slots],
            tlas_idx: vec![0; slots],
            leaf: vec![0; slots],
            node_ptr: 1,
            tlas_count: 0,
            blas_count: n,
            freed: None,
        }
    }

    /// Build from scratch over the initial instances. `leaf_bounds[i]` is
    /// the world AABB of the instance stored at TLAS node `i + 1`.
    pub fn rebuild(&mut self, leaf_bounds: &[Aabb]) {
        assert_eq!(leaf_bounds.len() as u32, self.blas_count);
        self.tlas_count = self.blas_count;
        for (i, aabb) in leaf_bounds.iter().enumerate() {
            self.tlas_idx[i] = i as u32 + 1;
            self.bounds[i + 1] = *aabb;
        }
        self.nodes[0] = KdNode {
            left: 0,
            right: self.blas_count,
            parax: LEAF_TAG,
            ..KdNode::default()
        };
        self.node_ptr = 1;
        self.freed = None;
        self.subdivide(0);
        self.min_refit();
    }

    /// Find the instance `b != a` minimizing the half surface area of
    /// `union(bounds[a], bounds[b])`. `best_b`/`best_sa` seed the search
    /// (pass `f32::INFINITY` for an unseeded query) and receive the result;
    /// the winner is also returned. Only subtrees whose surface-area lower
    /// bound beats the running best are entered.
    pub fn find_nearest(&self, a: u32, best_b: &mut u32, best_sa: &mut f32) -> u32 {
        let ba = &self.bounds[a as usize];
        let pa = ba.center();
        let ext_a = ba.max - ba.min;
        let half_ext_a = 0.5 * ext_a;

        let mut stack = [0u32; STACK_SIZE];
        let mut sp = 0usize;
        let mut n = 0u32;
        loop {
            loop {
                let node = &self.nodes[n as usize];
                if node.is_leaf() {
                    for i in 0..node.right {
                        let b = self.tlas_idx[(node.left + i) as usize];
                        if b == a {
                            continue;
                        }
                        let bb = &self.bounds[b as usize];
                        let size = ba.max.max(bb.max) - ba.min.min(bb.min);
                        let sa = half_area(size);
                        if sa < *best_sa {
                            *best_sa = sa;
                            *best_b = b;
                        }
                    }
                    break;
                }

                // Children sorted by centroid distance along the split axis.
                let mut near = node.left;
                let mut far = node.right;
                if pa[(node.parax & 7) as usize] > node.split_pos {
                    std::mem::swap(&mut near, &mut far);
                }
                let sa_near = self.merge_lower_bound(near, pa, ext_a, half_ext_a);
                let sa_far = self.merge_lower_bound(far, pa, ext_a, half_ext_a);

                match (sa_near < *best_sa, sa_far < *best_sa) {
                    (true, true) => {
                        debug_assert!(sp < STACK_SIZE);
                        stack[sp] = far;
                        sp += 1;
                        n = near;
                    }
                    (true, false) => n = near,
                    (false, true) => n = far,
                    (false, false) => break,
                }
            }
            if sp == 0 {
                break;
            }
            sp -= 1;
            n = stack[sp];
        }
        *best_b
    }

    /// Insert the instance stored at TLAS node `idx`. Consumes the two node
    /// slots released by the previous `remove_leaf`, or claims fresh ones,
    /// then refits the ancestor chain (covering any refit deferred by
    /// `remove_leaf`).
    pub fn add(&mut self, idx: u32, aabb: &Aabb) {
        self.bounds[idx as usize] = *aabb;
        let c = aabb.center();
        self.tlas_idx[self.tlas_count as usize] = idx;
        self.tlas_count += 1;

        let (leaf_idx, mut int_idx) = match self.freed.take() {
            Some([l, i]) => (l, i),
            None => {
                let l = self.claim_fresh_pair();
                (l, l + 1)
            }
        };
        {
            let ln = &mut self.nodes[leaf_idx as usize];
            ln.left = self.tlas_count - 1;
            ln.right = 1;
            ln.parax = LEAF_TAG;
            ln.bmin = c;
            ln.bmax = c;
            ln.min_size = 0.5 * (aabb.max - aabb.min);
        }
        self.leaf[idx as usize] = leaf_idx;

        // Descend to the leaf the new centroid belongs to, splice the new
        // interior node in above it, and split on the axis of greatest
        // centroid separation.
        let mut nidx = 0u32;
        loop {
            let node = self.nodes[nidx as usize];
            if !node.is_leaf() {
                let axis = (node.parax & 7) as usize;
                nidx = if c[axis] < node.split_pos {
                    node.left
                } else {
                    node.right
                };
                continue;
            }

            let sibling_center;
            if nidx == 0 {
                // The root is the only node: the old root moves into the
                // spare slot as the sibling and the root becomes interior.
                self.nodes[int_idx as usize] = node;
                self.nodes[int_idx as usize].parax &= 7;
                self.nodes[leaf_idx as usize].parax = LEAF_TAG;
                sibling_center = 0.5 * (node.bmin + node.bmax);
                for j in 0..node.right {
                    let inst = self.tlas_idx[(node.left + j) as usize];
                    self.leaf[inst as usize] = int_idx;
                }
                nidx = int_idx;
                int_idx = 0;
                self.nodes[0].parax = 0;
            } else {
                let parent_idx = (node.parax >> 3) as usize;
                if self.nodes[parent_idx].left == nidx {
                    self.nodes[parent_idx].left = int_idx;
                } else {
                    self.nodes[parent_idx].right = int_idx;
                }
                self.nodes[int_idx as usize].parax = node.parax & !7;
                self.nodes[nidx as usize].parax = (int_idx << 3) | LEAF_TAG;
                self.nodes[leaf_idx as usize].parax = (int_idx << 3) | LEAF_TAG;
                sibling_center = 0.5 * (node.bmin + node.bmax);
            }

            let axis = dominant_axis(c - sibling_center);
            let split_pos = ((sibling_center + c) * 0.5)[axis];
            let int_node = &mut self.nodes[int_idx as usize];
            int_node.parax += axis as u32;
            int_node.split_pos = split_pos;
            if c[axis] < split_pos {
                int_node.left = leaf_idx;
                int_node.right = nidx;
            } else {
                int_node.left = nidx;
                int_node.right = leaf_idx;
            }
            break;
        }

        self.recurse_refit(self.leaf[idx as usize]);
    }

    /// Remove the instance stored at TLAS node `idx`. Releases two node
    /// slots into `freed`; ancestor refit is deferred to the next `add`.
    pub fn remove_leaf(&mut self, idx: u32) {
        let to_delete = self.leaf[idx as usize];
        let node = self.nodes[to_delete as usize];
        if node.right > 1 {
            // Multiple instances share this leaf (failed splits); swap-remove
            // from the range and hand out fresh slots instead of tree nodes.
            for j in 0..node.right {
                if self.tlas_idx[(node.left + j) as usize] == idx {
                    self.tlas_idx[(node.left + j) as usize] =
                        self.tlas_idx[(node.left + node.right - 1) as usize];
                    break;
                }
            }
            self.nodes[to_delete as usize].right = node.right - 1;
            let fresh = self.claim_fresh_pair();
            self.freed = Some([fresh, fresh + 1]);
            return;
        }

        // Promote the sibling over the parent. The sibling keeps its own
        // axis/leaf tag but inherits the parent's parent pointer.
        let parent_idx = node.parax >> 3;
        let parent = self.nodes[parent_idx as usize];
        let sibling = if parent.left == to_delete {
            parent.right
        } else {
            parent.left
        };
        self.nodes[sibling as usize].parax =
            (parent.parax & !7) | (self.nodes[sibling as usize].parax & 7);
        self.nodes[parent_idx as usize] = self.nodes[sibling as usize];

        let promoted = self.nodes[parent_idx as usize];
        if promoted.is_leaf() {
            for j in 0..promoted.right {
                let inst = self.tlas_idx[(promoted.left + j) as usize];
                self.leaf[inst as usize] = parent_idx;
            }
        } else {
            let l = promoted.left as usize;
            let r = promoted.right as usize;
            self.nodes[l].parax = (parent_idx << 3) | (self.nodes[l].parax & 7);
            self.nodes[r].parax = (parent_idx << 3) | (self.nodes[r].parax & 7);
        }
        self.freed = Some([sibling, to_delete]);
    }

    pub fn nodes(&self) -> &[KdNode] {
        &self.nodes
    }

    /// One past the highest node slot ever claimed.
    pub fn node_count(&self) -> u32 {
        self.node_ptr
    }

    pub fn tlas_indices(&self) -> &[u32] {
        &self.tlas_idx[..self.tlas_count as usize]
    }

    /// Leaf node currently holding the instance stored at TLAS node `idx`.
    pub fn leaf_containing(&self, idx: u32) -> u32 {
        self.leaf[idx as usize]
    }

    pub fn bounds_of(&self, idx: u32) -> &Aabb {
        &self.bounds[idx as usize]
    }

    fn claim_fresh_pair(&mut self) -> u32 {
        let slot = self.node_ptr;
        assert!(
            slot as usize + 1 < self.nodes.len(),
            "kd-tree node capacity exceeded; unmatched add/remove_leaf"
        );
        self.node_ptr += 2;
        slot
    }

    /// Lower bound on the half surface area of the union of the query box
    /// with any instance whose centroid lies under `child`. The closest such
    /// instance centers `v` away from the query center, and its half-extent
    /// is at least `min_size`; the union extent per axis is therefore at
    /// least `max(ext_a, v - (min_size + half_ext_a))`.
    #[inline]
    fn merge_lower_bound(&self, child: u32, pa: Vec3A, ext_a: Vec3A, half_ext_a: Vec3A) -> f32 {
        let node = &self.nodes[child as usize];
        let v = (node.bmin - pa).max(pa - node.bmax);
        let d = ext_a.max(v - (node.min_size + half_ext_a));
        half_area(d)
    }

    fn subdivide(&mut self, node_idx: u32) {
        let first = self.nodes[node_idx as usize].left;
        let count = self.nodes[node_idx as usize].right;

        let mut bmin = Vec3A::INFINITY;
        let mut bmax = Vec3A::NEG_INFINITY;
        let mut min_size = Vec3A::INFINITY;
        for i in 0..count {
            let b = &self.bounds[self.tlas_idx[(first + i) as usize] as usize];
            let c = b.center();
            min_size = min_size.min(0.5 * (b.max - b.min));
            bmin = bmin.min(c);
            bmax = bmax.max(c);
        }
        {
            let node = &mut self.nodes[node_idx as usize];
            node.bmin = bmin;
            node.bmax = bmax;
            node.min_size = min_size;
        }
        if count < 2 {
            return;
        }

        let axis = dominant_axis(bmax - bmin);
        let mut center = 0.5 * (bmin[axis] + bmax[axis]);
        if count > BALANCE_THRESHOLD {
            // Bias the plane toward an even partition on skewed input,
            // keeping the worst-case imbalance bounded.
            let mut left_count = 0u32;
            for i in 0..count {
                let b = &self.bounds[self.tlas_idx[(first + i) as usize] as usize];
                if b.center()[axis] <= center {
                    left_count += 1;
                }
            }
            let ratio = (left_count as f32 / count as f32).clamp(0.15, 0.85);
            center = ratio * bmin[axis] + (1.0 - ratio) * bmax[axis];
        }

        self.partition(node_idx, center, axis);
        let np = self.node_ptr as usize;
        if self.nodes[np].right == 0 || self.nodes[np + 1].right == 0 {
            return; // split failed, node stays a leaf
        }
        let left_idx = self.node_ptr;
        {
            let node = &mut self.nodes[node_idx as usize];
            node.left = left_idx;
            node.right = left_idx + 1;
            node.parax = (node.parax & !7) | axis as u32;
            node.split_pos = center;
        }
        self.node_ptr += 2;
        self.subdivide(left_idx);
        self.subdivide(left_idx + 1);
    }

    /// Two-pointer partition of the node's index range; writes the candidate
    /// children into the next two (unclaimed) node slots. Two-instance nodes
    /// are split 1/1 unconditionally so subdivision always makes progress.
    fn partition(&mut self, node_idx: u32, split_pos: f32, axis: usize) {
        let node_first = self.nodes[node_idx as usize].left;
        let n = self.nodes[node_idx as usize].right;
        let mut first = node_first as usize;
        let mut last = first + n as usize;
        if n < 3 {
            last = first + 1;
        } else {
            loop {
                let b = &self.bounds[self.tlas_idx[first] as usize];
                if b.center()[axis] > split_pos {
                    last -= 1;
                    self.tlas_idx.swap(first, last);
                } else {
                    first += 1;
                }
                if first >= last {
                    break;
                }
            }
        }

        let np = self.node_ptr as usize;
        debug_assert!(np + 1 < self.nodes.len());
        let tag = (node_idx << 3) | LEAF_TAG;
        let left_count = last as u32 - node_first;
        self.nodes[np].left = node_first;
        self.nodes[np].right = left_count;
        self.nodes[np].parax = tag;
        self.nodes[np + 1].left = last as u32;
        self.nodes[np + 1].right = n - left_count;
        self.nodes[np + 1].parax = tag;
    }

    /// Bottom-up pass over every claimed slot: leaves record their instances'
    /// back-pointers and cluster minima, interiors merge their children.
    fn min_refit(&mut self) {
        for i in (0..self.node_ptr as usize).rev() {
            let node = self.nodes[i];
            if node.is_leaf() {
                let mut bmin = Vec3A::INFINITY;
                let mut bmax = Vec3A::NEG_INFINITY;
                let mut min_size = Vec3A::INFINITY;
                for j in 0..node.right {
                    let idx = self.tlas_idx[(node.left + j) as usize];
                    self.leaf[idx as usize] = i as u32;
                    let b = &self.bounds[idx as usize];
                    let c = b.center();
                    min_size = min_size.min(0.5 * (b.max - b.min));
                    bmin = bmin.min(c);
                    bmax = bmax.max(c);
                }
                let node = &mut self.nodes[i];
                node.bmin = bmin;
                node.bmax = bmax;
                node.min_size = min_size;
            } else {
                self.refit_from_children(i as u32);
            }
        }
    }

    /// Refit every ancestor of `from`, walking the parent chain to the root.
    fn recurse_refit(&mut self, from: u32) {
        let mut idx = from;
        while idx != 0 {
            idx = self.nodes[idx as usize].parax >> 3;
            self.refit_from_children(idx);
        }
    }

    fn refit_from_children(&mut self, idx: u32) {
        let left = self.nodes[self.nodes[idx as usize].left as usize];
        let right = self.nodes[self.nodes[idx as usize].right as usize];
        let node = &mut self.nodes[idx as usize];
        node.bmin = left.bmin.min(right.bmin);
        node.bmax = left.bmax.max(right.bmax);
        node.min_size = left.min_size.min(right.min_size);
    }
}
