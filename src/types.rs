// src/types.rs
// Core value types for the acceleration structures - AABB, ray, hit record, triangle.
// This file exists to provide the layout-checked records shared by the BLAS, TLAS and kD-tree.
// RELEVANT FILES:src/blas.rs,src/tlas.rs,src/kdtree.rs

use bytemuck::{Pod, Zeroable};
use glam::Vec3A;

/// Number of bits of `Hit::inst_prim` reserved for the primitive index.
/// The remaining high 12 bits carry the instance index.
pub const PRIM_BITS: u32 = 20;
pub const PRIM_MASK: u32 = (1 << PRIM_BITS) - 1;

/// Axis-aligned bounding box over `Vec3A` (four-lane layout, padding lane unused).
///
/// The empty box uses the inverted-infinity sentinel so that `grow` and
/// `union` need no emptiness branch: IEEE min/max against +/-inf is the
/// identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3A,
    pub max: Vec3A,
}

impl Aabb {
    /// Empty AABB (inverted bounds for union operations).
    pub fn empty() -> Self {
        Self {
            min: Vec3A::INFINITY,
            max: Vec3A::NEG_INFINITY,
        }
    }

    pub fn new(min: Vec3A, max: Vec3A) -> Self {
        Self { min, max }
    }

    /// Expand to include a point.
    pub fn grow(&mut self, p: Vec3A) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Expand to include another AABB. No-op when `other` is empty.
    pub fn grow_aabb(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn center(&self) -> Vec3A {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3A {
        self.max - self.min
    }

    /// Half surface area, the SAH cost metric: `ex*ey + ey*ez + ez*ex`.
    pub fn half_area(&self) -> f32 {
        let e = self.max - self.min;
        e.x * e.y + e.y * e.z + e.z * e.x
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// True if every point of `other` lies inside `self`, with tolerance.
    pub fn contains_aabb(&self, other: &Aabb, eps: f32) -> bool {
        (0..3).all(|i| self.min[i] <= other.min[i] + eps && self.max[i] >= other.max[i] - eps)
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

/// Half surface area of a raw extent vector.
#[inline]
pub(crate) fn half_area(e: Vec3A) -> f32 {
    e.x * e.y + e.y * e.z + e.z * e.x
}

/// Axis (0/1/2) on which `v` has its largest absolute component.
#[inline]
pub(crate) fn dominant_axis(v: Vec3A) -> usize {
    let v = v.abs();
    if v.x > v.y && v.x > v.z {
        0
    } else if v.y > v.z {
        1
    } else {
        2
    }
}

/// Intersection record, 16 bytes.
///
/// `inst_prim` packs the instance index in the high 12 bits and the
/// primitive index in the low 20 bits. A miss is `t == f32::INFINITY`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Hit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub inst_prim: u32,
}

impl Hit {
    pub fn none() -> Self {
        Self {
            t: f32::INFINITY,
            u: 0.0,
            v: 0.0,
            inst_prim: 0,
        }
    }

    #[inline]
    pub fn pack(instance: u32, prim: u32) -> u32 {
        debug_assert!(instance < (1 << 12) && prim <= PRIM_MASK);
        (instance << PRIM_BITS) | prim
    }

    #[inline]
    pub fn instance(&self) -> u32 {
        self.inst_prim >> PRIM_BITS
    }

    #[inline]
    pub fn prim(&self) -> u32 {
        self.inst_prim & PRIM_MASK
    }

    #[inline]
    pub fn is_hit(&self) -> bool {
        self.t < f32::INFINITY
    }
}

impl Default for Hit {
    fn default() -> Self {
        Self::none()
    }
}

/// Ray prepared for SIMD slab tests, 64 bytes.
///
/// `rdir` is the componentwise reciprocal of `dir`; `Ray::new` computes it,
/// and anyone mutating `dir` afterwards must recompute it before traversal.
/// Zero direction components put infinities in `rdir`; the slab math stays
/// correct under IEEE arithmetic.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3A,
    pub dir: Vec3A,
    pub rdir: Vec3A,
    pub hit: Hit,
}

impl Ray {
    pub fn new(origin: Vec3A, dir: Vec3A) -> Self {
        Self {
            origin,
            dir,
            rdir: dir.recip(),
            hit: Hit::none(),
        }
    }

    /// Slab test against an AABB. Returns the entry distance, or
    /// `f32::INFINITY` when the box is missed or lies beyond the current
    /// closest hit. The entry distance can be negative when the origin is
    /// inside the box; traversal only uses it for near/far ordering.
    #[inline]
    pub fn aabb_distance(&self, bmin: Vec3A, bmax: Vec3A) -> f32 {
        let t0 = (bmin - self.origin) * self.rdir;
        let t1 = (bmax - self.origin) * self.rdir;
        let tmin = t0.min(t1).max_element();
        let tmax = t0.max(t1).min_element();
        if tmax < tmin.max(0.0) || tmin > self.hit.t {
            f32::INFINITY
        } else {
            tmin
        }
    }
}

/// Triangle with a cached centroid, maintained by the owning mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub v0: Vec3A,
    pub v1: Vec3A,
    pub v2: Vec3A,
    pub centroid: Vec3A,
}

impl Triangle {
    pub fn new(v0: Vec3A, v1: Vec3A, v2: Vec3A) -> Self {
        Self {
            v0,
            v1,
            v2,
            centroid: (v0 + v1 + v2) / 3.0,
        }
    }

    pub fn aabb(&self) -> Aabb {
        let mut aabb = Aabb::empty();
        aabb.grow(self.v0);
        aabb.grow(self.v1);
        aabb.grow(self.v2);
        aabb
    }

    /// Unnormalized geometric normal; zero for degenerate triangles.
    pub fn normal(&self) -> Vec3A {
        (self.v1 - self.v0).cross(self.v2 - self.v0)
    }
}

// Layout contracts: the hit record shares a cache line with the ray vectors.
const _: () = {
    assert!(std::mem::size_of::<Hit>() == 16);
    assert!(std::mem::size_of::<Ray>() == 64);
    assert!(std::mem::align_of::<Ray>() == 64);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_aabb_union_is_identity() {
        let mut a = Aabb::new(Vec3A::ZERO, Vec3A::ONE);
        a.grow_aabb(&Aabb::empty());
        assert_eq!(a.min, Vec3A::ZERO);
        assert_eq!(a.max, Vec3A::ONE);

        let mut e = Aabb::empty();
        assert!(!e.is_valid());
        e.grow(Vec3A::new(1.0, 2.0, 3.0));
        assert!(e.is_valid());
        assert_eq!(e.min, e.max);
    }

    #[test]
    fn half_area_of_unit_cube() {
        let a = Aabb::new(Vec3A::ZERO, Vec3A::ONE);
        assert_eq!(a.half_area(), 3.0);
        assert_eq!(a.center(), Vec3A::splat(0.5));
    }

    #[test]
    fn hit_packing_round_trips() {
        let packed = Hit::pack(0xabc, 0xf_ffff);
        let hit = Hit {
            t: 1.0,
            u: 0.0,
            v: 0.0,
            inst_prim: packed,
        };
        assert_eq!(hit.instance(), 0xabc);
        assert_eq!(hit.prim(), 0xf_ffff);
    }

    #[test]
    fn slab_test_handles_zero_direction_components() {
        // Direction with zero y/z: rdir holds infinities, the slab test must
        // still reject a box that is offset on those axes.
        let ray = Ray::new(Vec3A::ZERO, Vec3A::X);
        let d = ray.aabb_distance(Vec3A::splat(1.0), Vec3A::splat(2.0));
        assert_eq!(d, f32::INFINITY);

        // Same direction, box straddling the ray axis: entry at x = 1.
        let d = ray.aabb_distance(Vec3A::new(1.0, -1.0, -1.0), Vec3A::new(2.0, 1.0, 1.0));
        assert_eq!(d, 1.0);
    }

    #[test]
    fn triangle_centroid_is_vertex_mean() {
        let tri = Triangle::new(Vec3A::ZERO, Vec3A::new(3.0, 0.0, 0.0), Vec3A::new(0.0, 3.0, 0.0));
        assert_eq!(tri.centroid, Vec3A::new(1.0, 1.0, 0.0));
        assert!(tri.aabb().is_valid());
    }
}
