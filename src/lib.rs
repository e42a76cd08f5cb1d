//! Two-level acceleration structures for real-time ray tracing of dynamic
//! scenes: a binned-SAH BVH per mesh (BLAS), transform-wrapped instances, a
//! top-level BVH over instances (TLAS) with agglomerative and quick builders,
//! and the dynamic centroid kD-tree that drives agglomerative clustering.
//!
//! Construction and mutation (`build`, `build_quick`, `refit`,
//! `set_transform`, kD-tree `add`/`remove_leaf`) require exclusive access.
//! Traversal (`intersect`) is read-only and safe from many threads as long
//! as each thread owns its `Ray`.

pub mod blas;
pub mod instance;
pub mod kdtree;
pub mod mesh;
pub mod tlas;
pub mod types;

pub use blas::{BuildStats, Bvh, BvhNode};
pub use instance::BvhInstance;
pub use kdtree::{KdNode, KdTree};
pub use mesh::{mesh_builders, validate_mesh, TriMesh};
pub use tlas::{Tlas, TlasNode};
pub use types::{Aabb, Hit, Ray, Triangle};

pub use glam;
