//! The transform planner: the hardest part of this crate. Given a source and
//! destination [`Spec`], produces the ordered list of per-mesh-dim
//! [`TransformStep`]s that, applied in order, take one to the other.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::{debug, trace};

use crate::error::PlanError;
use crate::placement::Placement;
use crate::spec::Spec;

/// One collective (or local no-op) on a single mesh dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStep {
    pub mesh_dim: usize,
    pub from: Placement,
    pub to: Placement,
    /// Shape of the logical subtensor this worker holds after applying all
    /// *outer* mesh-dim placements, used to size padding/cropping correctly
    /// under uneven sharding.
    pub logical_shape: Vec<i64>,
}

type PlanCache = Mutex<HashMap<(Spec, Spec), Vec<TransformStep>>>;

fn plan_cache() -> &'static PlanCache {
    static CACHE: OnceLock<PlanCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Generates (or retrieves from the process-lifetime cache) the transform
/// plan from `src` to `dst`. `src.mesh` and `dst.mesh` must be the exact same
/// mesh (same worker set); cross-mesh redistribution is out of scope.
///
/// The cache key includes the whole `Spec`, and `Spec`'s `DeviceMesh` hashes
/// by identity, which itself encodes this worker's coordinate — so two
/// workers with differently-shaped local shards never collide in the shared
/// cache even though it has no explicit per-worker key.
pub fn plan(src: &Spec, dst: &Spec) -> Result<Vec<TransformStep>, PlanError> {
    if src.mesh != dst.mesh {
        return Err(PlanError::CrossMeshUnsupported);
    }

    let key = (src.clone(), dst.clone());
    if let Some(cached) = plan_cache().lock().unwrap().get(&key) {
        return Ok(cached.clone());
    }

    let steps = gen_transform_infos(src, dst)?;
    debug!(steps = steps.len(), "generated transform plan");
    plan_cache().lock().unwrap().insert(key, steps.clone());
    Ok(steps)
}

fn gen_transform_infos(src: &Spec, dst: &Spec) -> Result<Vec<TransformStep>, PlanError> {
    let mesh = &src.mesh;
    let ndim = mesh.ndim();
    let initial_logical_shape: Vec<i64> = src.shape().to_vec();

    if ndim == 1 {
        return Ok(vec![TransformStep {
            mesh_dim: 0,
            from: src.placements[0],
            to: dst.placements[0],
            logical_shape: initial_logical_shape,
        }]);
    }

    let my_coordinate = mesh.coordinate_of_self();
    let coord_at = |i: usize| my_coordinate.map(|c| c[i]).unwrap_or(0);

    let mut current_placements = src.placements.clone();
    let dst_placements = dst.placements.clone();

    let mut mesh_dims_to_logical_shape: Vec<Vec<i64>> = vec![initial_logical_shape];
    for i in 0..ndim {
        let current_logical_shape = mesh_dims_to_logical_shape[i].clone();
        match current_placements[i] {
            Placement::Shard(d) if i < ndim - 1 => {
                let mesh_dim_size = mesh.size(i);
                let (local_shard_size, _) = Placement::local_shard_size_on_dim(
                    current_logical_shape[d as usize],
                    mesh_dim_size,
                    coord_at(i),
                );
                let mut new_shape = current_logical_shape;
                new_shape[d as usize] = local_shard_size;
                mesh_dims_to_logical_shape.push(new_shape);
            }
            Placement::Shard(_) => {
                // last mesh dim: this entry is never read by any step.
            }
            _ => mesh_dims_to_logical_shape.push(current_logical_shape),
        }
    }

    let mut steps = Vec::new();

    if src.num_shards() > 1 {
        // Inner-to-outer: unwind nested/misaligned shardings before the
        // natural outer-to-inner pass tries to apply them.
        search_transform_infos(
            &mut current_placements,
            &dst_placements,
            ndim as isize - 1,
            ndim,
            &mesh_dims_to_logical_shape,
            &mut steps,
            false,
        )?;
    }

    search_transform_infos(
        &mut current_placements,
        &dst_placements,
        0,
        ndim,
        &mesh_dims_to_logical_shape,
        &mut steps,
        true,
    )?;

    Ok(steps)
}

/// Can mesh dim `i` be transformed from `current[i]` to `target[i]` in
/// isolation, without first replicating some other mesh dim?
fn reshardable_from_src_to_dst(current: &[Placement], target: &[Placement], mesh_dim: usize) -> bool {
    let current_placement = current[mesh_dim];

    if let Placement::Shard(d) = current_placement {
        for i in (0..current.len()).rev() {
            if current[i].is_shard_of(d) {
                if i != mesh_dim {
                    return false;
                }
                break;
            }
        }
    }

    let target_placement = target[mesh_dim];
    if !target_placement.is_shard() {
        return true;
    }

    let shard_dim = target_placement.shard_dim().unwrap();
    let current_sharding: Vec<usize> = (0..mesh_dim).filter(|&i| current[i].is_shard_of(shard_dim)).collect();
    let target_sharding: Vec<usize> = (0..mesh_dim).filter(|&i| target[i].is_shard_of(shard_dim)).collect();
    current_sharding == target_sharding
}

#[allow(clippy::too_many_arguments)]
fn search_transform_infos(
    current: &mut [Placement],
    target: &[Placement],
    idx: isize,
    ndim: usize,
    logical_shapes: &[Vec<i64>],
    steps: &mut Vec<TransformStep>,
    left_to_right: bool,
) -> Result<(), PlanError> {
    if current == target {
        return Ok(());
    }
    if idx < 0 || idx as usize >= ndim {
        return Ok(());
    }
    let i = idx as usize;
    let from = current[i];
    let to = target[i];

    if reshardable_from_src_to_dst(current, target, i) {
        if from != to {
            trace!(mesh_dim = i, ?from, ?to, "plan step");
            steps.push(TransformStep {
                mesh_dim: i,
                from,
                to,
                logical_shape: logical_shapes[i].clone(),
            });
            current[i] = to;
        }
        let next = if left_to_right { idx + 1 } else { idx - 1 };
        search_transform_infos(current, target, next, ndim, logical_shapes, steps, left_to_right)
    } else if !left_to_right {
        trace!(mesh_dim = i, ?from, "plan step: unshard before outer pass");
        steps.push(TransformStep {
            mesh_dim: i,
            from,
            to: Placement::Replicate,
            logical_shape: logical_shapes[i].clone(),
        });
        current[i] = Placement::Replicate;
        search_transform_infos(current, target, idx - 1, ndim, logical_shapes, steps, left_to_right)
    } else {
        Err(PlanError::UnreachablePlan {
            src: current.to_vec(),
            dst: target.to_vec(),
            mesh_dim: i,
            current: from,
            target: to,
        })
    }
}
