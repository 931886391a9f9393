//! Walks a transform plan and issues the collective (or purely local) op for
//! each step against a worker's local shard.

use tch::Tensor;
use tracing::{debug, warn};

use crate::collective::ReduceOp;
use crate::device_mesh::DeviceMesh;
use crate::error::RedistributeError;
use crate::placement::Placement;
use crate::transform::TransformStep;

/// Executes `steps` against `local`, returning the new local shard.
///
/// `async_op`: when `false` (the default), every collective is waited on
/// before moving to the next step and before returning; the planner/executor
/// interface still models each collective as a [`crate::collective::PendingTensor`]
/// internally so a future backend that supports true overlap only has to
/// change `crate::collective`.
///
/// `is_backward`: selects the transpose semantics documented on
/// [`crate::redistribute`] — `Replicate -> Partial` becomes a no-op instead
/// of a partition-scaling, and `Shard -> Partial` is permitted (lowered to an
/// all-gather) instead of being rejected.
///
/// Workers outside the mesh (`mesh.coordinate_of_self() == None`) never reach
/// this function in normal use (callers check membership first), but calling
/// it anyway is safe: every step's collective would be skipped because
/// `mesh.communicator` is only consulted for dimensions this worker has a
/// communicator for, and a mesh this worker isn't part of has none.
pub fn execute(
    mut local: Tensor,
    steps: &[TransformStep],
    mesh: &DeviceMesh,
    async_op: bool,
    is_backward: bool,
) -> Result<Tensor, RedistributeError> {
    if !mesh.is_member() {
        warn!("worker is not a member of the mesh; redistribute is a no-op");
        return Ok(local);
    }

    for step in steps {
        let TransformStep {
            mesh_dim,
            from,
            to,
            logical_shape,
        } = step;
        let mesh_dim = *mesh_dim;

        if from == to {
            continue;
        }

        debug!(mesh_dim, ?from, ?to, is_backward, "redistribute step");

        local = match (from, to) {
            (_, Placement::Replicate) if from.is_partial() => from.reduce_value(&local, mesh, mesh_dim)?,
            (_, Placement::Replicate) if from.is_shard() => {
                from.to_replicate(&local, mesh, mesh_dim, logical_shape)?
            }
            (_, Placement::Shard(_)) if from.is_partial() => {
                from.reduce_shard_value(&local, mesh, mesh_dim, to)?
            }
            (Placement::Replicate, Placement::Shard(_)) => {
                let coord = mesh
                    .coordinate_of_self()
                    .expect("checked is_member above")[mesh_dim];
                to.replicate_to_shard(&local, mesh, mesh_dim, coord)
            }
            (Placement::Shard(d1), Placement::Shard(d2)) if d1 != d2 => {
                from.to_new_shard_dim(&local, mesh, mesh_dim, logical_shape, *d2)?
            }
            (Placement::Replicate, Placement::Partial(op)) => {
                if is_backward {
                    local
                } else {
                    partition_value(&local, mesh, mesh_dim, *op)
                }
            }
            (_, Placement::Partial(_)) if from.is_shard() && is_backward => {
                from.to_replicate(&local, mesh, mesh_dim, logical_shape)?
            }
            (Placement::Partial(op_a), Placement::Partial(op_b)) if op_a == op_b => local,
            _ => {
                return Err(RedistributeError::UnsupportedTransition {
                    from: *from,
                    to: *to,
                    mesh_dim,
                    is_backward,
                })
            }
        };
    }

    let _ = async_op; // every backend here materializes eagerly; kept for API parity with §6.
    Ok(local)
}

/// `Replicate -> Partial` on the forward path for a `Sum` partial: divide by
/// the mesh-dim size so that summing back across workers reproduces the
/// original replicated value.
fn partition_value(local: &Tensor, mesh: &DeviceMesh, mesh_dim: usize, op: ReduceOp) -> Tensor {
    match op {
        ReduceOp::Sum => local / mesh.size(mesh_dim),
        // Other ops have no meaningful "partition" inverse; keep the full
        // value on every worker, matching the reduction's own idempotence
        // (e.g. Max/Min/Product of identical copies reduces back to itself).
        _ => local.shallow_clone(),
    }
}
