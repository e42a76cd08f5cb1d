// src/instance.rs
// Transform-wrapping reference to a BLAS with a cached world-space AABB.
// This file exists to bridge world-space rays into BLAS-local space and back.
// RELEVANT FILES:src/blas.rs,src/tlas.rs,src/types.rs

use glam::{Mat4, Vec3A};

use crate::blas::Bvh;
use crate::types::{Aabb, Ray};

/// Instance of a BLAS with an affine transform and world bounds.
///
/// `idx` is the instance index packed into hit records (12 bits, so at most
/// 4096 instances per scene). Rigid transforms and uniform scaling keep the
/// hit `t` interpretable as world distance in units of the ray direction;
/// see `set_transform`.
#[derive(Debug, Clone)]
pub struct BvhInstance<'a> {
    bvh: &'a Bvh,
    idx: u32,
    transform: Mat4,
    inv_transform: Mat4,
    bounds: Aabb,
}

impl<'a> BvhInstance<'a> {
    /// Wrap a built BLAS. The world AABB starts as the identity-transformed
    /// root bounds.
    pub fn new(bvh: &'a Bvh, idx: u32) -> Self {
        debug_assert!(idx < (1 << 12));
        let mut instance = Self {
            bvh,
            idx,
            transform: Mat4::IDENTITY,
            inv_transform: Mat4::IDENTITY,
            bounds: Aabb::empty(),
        };
        instance.set_transform(Mat4::IDENTITY);
        instance
    }

    /// Store the transform and its inverse, and recompute the world AABB from
    /// the eight transformed corners of the BLAS root box.
    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
        self.inv_transform = transform.inverse();

        let local = self.bvh.world_bounds();
        let mut bounds = Aabb::empty();
        for corner in 0..8u32 {
            let p = Vec3A::new(
                if corner & 1 != 0 { local.max.x } else { local.min.x },
                if corner & 2 != 0 { local.max.y } else { local.min.y },
                if corner & 4 != 0 { local.max.z } else { local.min.z },
            );
            bounds.grow(transform.transform_point3a(p));
        }
        self.bounds = bounds;
    }

    pub fn transform(&self) -> &Mat4 {
        &self.transform
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn bvh(&self) -> &'a Bvh {
        self.bvh
    }

    /// Intersect in BLAS-local space. The descent runs on a stack copy of the
    /// ray (origin via the inverse transform, direction via its linear part,
    /// reciprocal direction recomputed); only the hit record is written back.
    /// The parameterization is shared, so the local `t` is already the world
    /// `t` for any invertible affine transform.
    pub fn intersect(&self, ray: &mut Ray) {
        let mut local = Ray {
            origin: self.inv_transform.transform_point3a(ray.origin),
            dir: self.inv_transform.transform_vector3a(ray.dir),
            rdir: Vec3A::ZERO,
            hit: ray.hit,
        };
        local.rdir = local.dir.recip();

        self.bvh.intersect(&mut local, self.idx);
        ray.hit = local.hit;
    }
}
