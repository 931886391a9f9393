use thiserror::Error;

use crate::placement::Placement;

/// Failures constructing a [`crate::device_mesh::DeviceMesh`] or [`crate::spec::Spec`].
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("device mesh dimension {dim} has non-positive size {size}")]
    NonPositiveDimSize { dim: usize, size: i64 },

    #[error("rank {rank} is out of range for a mesh of total size {total}")]
    RankOutOfRange { rank: usize, total: i64 },

    #[error("spec has {got} placements but mesh has {expected} dimensions")]
    PlacementCountMismatch { expected: usize, got: usize },

    #[error("tensor dim {dim} used in a Shard placement but global_shape only has rank {rank}")]
    ShardDimOutOfRange { dim: u32, rank: usize },
}

/// Failures generating a transform plan from one [`crate::spec::Spec`] to another.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot redistribute across different device meshes")]
    CrossMeshUnsupported,

    #[error(
        "could not redistribute from {src:?} to {dst:?}: outer-to-inner pass could not reshard \
         mesh dim {mesh_dim} (current {current:?} -> target {target:?})"
    )]
    UnreachablePlan {
        src: Vec<Placement>,
        dst: Vec<Placement>,
        mesh_dim: usize,
        current: Placement,
        target: Placement,
    },
}

/// Failures executing a generated plan against a local tensor.
#[derive(Debug, Error)]
pub enum RedistributeError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(
        "unsupported transition on mesh dim {mesh_dim}: {from:?} -> {to:?} (is_backward={is_backward})"
    )]
    UnsupportedTransition {
        from: Placement,
        to: Placement,
        mesh_dim: usize,
        is_backward: bool,
    },

    #[error("collective failed: {0}")]
    CollectiveFailure(#[from] tch::TchError),

    #[error("spec invariant violated: {0}")]
    SpecInvariantViolated(String),
}
