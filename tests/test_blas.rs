// tests/test_blas.rs
// BLAS build and refit tests: coverage, bound soundness, SAH split quality, refit round-trips.
// This file exists to validate the binned-SAH builder's universal invariants and the refit contract.
// RELEVANT FILES:src/blas.rs,src/mesh.rs,src/types.rs

use anyhow::Result;
use glam::Vec3A;
use raybvh::{mesh_builders, Bvh, Ray, TriMesh, Triangle};

/// Small right triangle with its lower-left corner at `origin`.
fn small_tri(origin: Vec3A) -> Triangle {
    Triangle::new(
        origin,
        origin + Vec3A::new(0.05, 0.0, 0.0),
        origin + Vec3A::new(0.0, 0.05, 0.0),
    )
}

/// Two clusters of 100 triangles each: x in [0,1] and x in [10,11].
fn two_cluster_mesh() -> TriMesh {
    let mut tris = Vec::new();
    for cluster in 0..2 {
        let base_x = cluster as f32 * 10.0;
        for i in 0..100 {
            let x = base_x + (i % 10) as f32 * 0.095;
            let y = (i / 10) as f32 * 0.095;
            tris.push(small_tri(Vec3A::new(x, y, 0.0)));
        }
    }
    TriMesh::new(tris)
}

/// Number of triangles reachable below `node_idx`.
fn subtree_tri_count(bvh: &Bvh, node_idx: u32) -> u32 {
    let mut total = 0;
    let mut stack = vec![node_idx];
    while let Some(i) = stack.pop() {
        let node = &bvh.nodes()[i as usize];
        if node.is_leaf() {
            total += node.tri_count;
        } else {
            stack.push(node.left_first);
            stack.push(node.left_first + 1);
        }
    }
    total
}

/// Bound soundness: every interior node contains its children, every leaf
/// contains its triangles.
fn assert_bounds_sound(bvh: &Bvh) {
    for node in bvh.nodes() {
        if node.is_leaf() {
            for i in 0..node.tri_count {
                let tri = &bvh.mesh().triangles()
                    [bvh.tri_indices()[(node.left_first + i) as usize] as usize];
                assert!(
                    node.aabb().contains_aabb(&tri.aabb(), 1e-6),
                    "leaf must contain its triangles"
                );
            }
        } else {
            let left = &bvh.nodes()[node.left_first as usize];
            let right = &bvh.nodes()[node.left_first as usize + 1];
            assert!(node.aabb().contains_aabb(&left.aabb(), 1e-6));
            assert!(node.aabb().contains_aabb(&right.aabb(), 1e-6));
        }
    }
}

#[test]
fn build_covers_every_triangle_exactly_once() -> Result<()> {
    let mesh = mesh_builders::grid(16, 16);
    let n = mesh.triangle_count();
    let mut bvh = Bvh::new(mesh);
    bvh.build()?;

    let mut seen = vec![0u32; n as usize];
    for node in bvh.nodes() {
        if node.is_leaf() {
            for i in 0..node.tri_count {
                seen[bvh.tri_indices()[(node.left_first + i) as usize] as usize] += 1;
            }
        }
    }
    assert!(
        seen.iter().all(|&c| c == 1),
        "leaf ranges must partition the triangle set"
    );
    assert_bounds_sound(&bvh);
    assert!(bvh.node_count() <= 2 * n - 1);
    Ok(())
}

#[test]
fn sah_separates_two_clusters_at_the_root() -> Result<()> {
    let mut bvh = Bvh::new(two_cluster_mesh());
    bvh.build()?;

    let root = &bvh.nodes()[0];
    assert!(!root.is_leaf(), "200 spread triangles must split");

    let left = &bvh.nodes()[root.left_first as usize];
    let right = &bvh.nodes()[root.left_first as usize + 1];
    assert_eq!(subtree_tri_count(&bvh, root.left_first), 100);
    assert_eq!(subtree_tri_count(&bvh, root.left_first + 1), 100);

    // The split plane lies in the (1, 10) gap: one child stays below it,
    // the other above, on the x axis.
    let (lo, hi) = if left.aabb_max[0] < right.aabb_min[0] {
        (left, right)
    } else {
        (right, left)
    };
    assert!(lo.aabb_max[0] <= 1.2, "low cluster child leaks into the gap");
    assert!(hi.aabb_min[0] >= 9.8, "high cluster child leaks into the gap");
    Ok(())
}

#[test]
fn single_triangle_root_is_leaf() -> Result<()> {
    let mut bvh = Bvh::new(mesh_builders::triangle());
    bvh.build()?;
    assert_eq!(bvh.node_count(), 1);
    assert!(bvh.nodes()[0].is_leaf());
    Ok(())
}

#[test]
fn coincident_centroids_terminate_as_one_leaf() -> Result<()> {
    // 32 copies of the same triangle: every axis has zero centroid spread, so
    // no split plane exists and subdivision must stop without looping.
    let tri = small_tri(Vec3A::ZERO);
    let mut bvh = Bvh::new(TriMesh::new(vec![tri; 32]));
    bvh.build()?;
    assert_eq!(bvh.node_count(), 1);
    assert_eq!(bvh.nodes()[0].tri_count, 32);
    Ok(())
}

#[test]
fn coplanar_mesh_splits_on_nondegenerate_axis() -> Result<()> {
    // A planar grid has zero centroid spread on y; the builder must pick x or
    // z and still produce a deep tree.
    let mut bvh = Bvh::new(mesh_builders::grid(8, 8));
    bvh.build()?;
    assert!(bvh.node_count() > 1);
    assert!(bvh.stats().max_depth > 1);
    assert_bounds_sound(&bvh);
    Ok(())
}

#[test]
fn refit_without_motion_is_bitwise_identical() -> Result<()> {
    let mut bvh = Bvh::new(mesh_builders::grid(8, 8));
    bvh.build()?;
    let before = bvh.nodes().to_vec();
    bvh.refit();
    assert_eq!(bvh.nodes(), &before[..]);
    Ok(())
}

#[test]
fn refit_tracks_displaced_triangles() -> Result<()> {
    let mut bvh = Bvh::new(mesh_builders::grid(4, 4));
    bvh.build()?;
    let topology_before = bvh.node_count();

    bvh.mesh_mut().translate(Vec3A::new(0.0, 2.0, 0.0));
    bvh.refit();

    assert_eq!(bvh.node_count(), topology_before);
    assert!((bvh.world_bounds().min.y - 2.0).abs() < 1e-6);
    assert_bounds_sound(&bvh);
    Ok(())
}

#[test]
fn refit_preserves_hit_parameterization() -> Result<()> {
    // A quad at z = 5 is hit at t = 5; moving the mesh one unit toward the
    // ray origin and refitting must yield t = 4 with unchanged topology.
    let mut quad = mesh_builders::quad();
    quad.translate(Vec3A::new(0.0, 0.0, 5.0));
    let mut bvh = Bvh::new(quad);
    bvh.build()?;

    let mut ray = Ray::new(Vec3A::new(0.5, 0.5, 0.0), Vec3A::Z);
    bvh.intersect(&mut ray, 0);
    assert!((ray.hit.t - 5.0).abs() < 1e-6);

    bvh.mesh_mut().translate(Vec3A::new(0.0, 0.0, -1.0));
    bvh.refit();

    let mut ray = Ray::new(Vec3A::new(0.5, 0.5, 0.0), Vec3A::Z);
    bvh.intersect(&mut ray, 0);
    assert!((ray.hit.t - 4.0).abs() < 1e-5);
    Ok(())
}
