//! An immutable N-dimensional grid of workers.
//!
//! Generalizes the host crate's single flat `Communicator` (one NCCL group
//! for all of tensor parallelism) to one communicator *per mesh dimension*,
//! the way a 2D (data-parallel x tensor-parallel) topology needs a distinct
//! process group for each axis.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::trace;

use crate::collective::Communicator;
use crate::error::MeshError;

struct DeviceMeshInner {
    shape: Vec<i64>,
    coordinate: Option<Vec<i64>>,
    communicators: Vec<Option<Arc<Communicator>>>,
}

/// Cheaply `Clone`-able handle to a mesh. Two `DeviceMesh` values are `==`
/// only if they were cloned from the same construction (pointer identity),
/// matching the planner's requirement that `src_spec.mesh == dst_spec.mesh`
/// means "the same mesh", not merely "a mesh with the same shape".
#[derive(Clone)]
pub struct DeviceMesh(Arc<DeviceMeshInner>);

impl DeviceMesh {
    /// `shape[i]` is the number of workers along mesh dimension `i`.
    /// `coordinate` is this worker's position, or `None` if this worker does
    /// not participate in the mesh at all. `communicators[i]` is the
    /// process group spanning mesh dimension `i`; it must be `None` when
    /// `shape[i] == 1` and `Some` otherwise.
    pub fn new(
        shape: Vec<i64>,
        coordinate: Option<Vec<i64>>,
        communicators: Vec<Option<Arc<Communicator>>>,
    ) -> Result<Self, MeshError> {
        for (dim, &size) in shape.iter().enumerate() {
            if size <= 0 {
                return Err(MeshError::NonPositiveDimSize { dim, size });
            }
        }
        if let Some(coord) = &coordinate {
            for (dim, (&c, &size)) in coord.iter().zip(shape.iter()).enumerate() {
                if c < 0 || c >= size {
                    return Err(MeshError::RankOutOfRange {
                        rank: c as usize,
                        total: size,
                    });
                }
                let _ = dim;
            }
        }
        Ok(DeviceMesh(Arc::new(DeviceMeshInner {
            shape,
            coordinate,
            communicators,
        })))
    }

    /// Builds the coordinate of `rank` by row-major linearization over
    /// `shape`, i.e. the same convention `torch.unravel_index` uses. Returns
    /// a mesh with `coordinate = None` if `rank` is `None` or falls outside
    /// the mesh's total worker count.
    /// A rank at or beyond the mesh's total worker count is treated as "not
    /// a member of this mesh" (`coordinate() == None`) rather than an error:
    /// this is the normal case for a worker that sits outside a particular
    /// sub-mesh.
    pub fn from_rank(
        shape: Vec<i64>,
        rank: Option<usize>,
        communicators: Vec<Option<Arc<Communicator>>>,
    ) -> Result<Self, MeshError> {
        let total: i64 = shape.iter().product();
        let coordinate = match rank {
            None => None,
            Some(rank) if rank as i64 >= total => None,
            Some(rank) => {
                let mut remaining = rank as i64;
                let mut coord = vec![0i64; shape.len()];
                for i in (0..shape.len()).rev() {
                    coord[i] = remaining % shape[i];
                    remaining /= shape[i];
                }
                Some(coord)
            }
        };
        Self::new(shape, coordinate, communicators)
    }

    pub fn ndim(&self) -> usize {
        self.0.shape.len()
    }

    pub fn size(&self, mesh_dim: usize) -> i64 {
        self.0.shape[mesh_dim]
    }

    pub fn shape(&self) -> &[i64] {
        &self.0.shape
    }

    pub fn coordinate(&self) -> Option<&[i64]> {
        self.0.coordinate.as_deref()
    }

    /// `None` if this worker is not a member of the mesh; all redistribution
    /// operations must short-circuit to identity in that case.
    pub fn coordinate_of_self(&self) -> Option<&[i64]> {
        self.coordinate()
    }

    pub fn communicator(&self, mesh_dim: usize) -> Option<&Arc<Communicator>> {
        self.0.communicators[mesh_dim].as_ref()
    }

    pub fn is_member(&self) -> bool {
        self.0.coordinate.is_some()
    }
}

impl PartialEq for DeviceMesh {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DeviceMesh {}

impl Hash for DeviceMesh {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl std::fmt::Debug for DeviceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMesh")
            .field("shape", &self.0.shape)
            .field("coordinate", &self.0.coordinate)
            .finish()
    }
}

/// Test-only helper: builds `world_size` meshes over the same `shape`, one
/// per rank, all sharing loopback communicators so collectives issued by
/// different "workers" in the same process rendezvous with each other.
#[cfg(all(test, not(feature = "parallelism")))]
pub(crate) fn test_mesh_group(shape: Vec<i64>) -> Vec<DeviceMesh> {
    use crate::collective::CommunicatorId;

    let total: usize = shape.iter().product::<i64>() as usize;
    let mut per_dim_ids = Vec::with_capacity(shape.len());
    let mut dim_world_sizes = Vec::with_capacity(shape.len());
    for (dim, &size) in shape.iter().enumerate() {
        if size == 1 {
            per_dim_ids.push(None);
        } else {
            per_dim_ids.push(Some(CommunicatorId::new(size as usize)));
        }
        dim_world_sizes.push(size);
        trace!(dim, size, "allocated loopback group for mesh dim");
    }

    (0..total)
        .map(|rank| {
            let mesh = DeviceMesh::from_rank(shape.clone(), Some(rank), vec![]).unwrap();
            let coord = mesh.coordinate().unwrap().to_vec();
            let communicators = per_dim_ids
                .iter()
                .zip(coord.iter())
                .zip(dim_world_sizes.iter())
                .map(|((id, &c), &size)| {
                    id.as_ref().map(|id| {
                        Arc::new(Communicator::new(id.clone(), c as usize, size as usize))
                    })
                })
                .collect();
            DeviceMesh::new(shape.clone(), Some(coord), communicators).unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rank_linearizes_row_major() {
        let mesh = DeviceMesh::from_rank(vec![2, 3], Some(4), vec![None, None]).unwrap();
        assert_eq!(mesh.coordinate(), Some(&[1, 1][..]));
    }

    #[test]
    fn from_rank_out_of_range_is_not_a_member() {
        let mesh = DeviceMesh::from_rank(vec![2, 3], Some(6), vec![None, None]).unwrap();
        assert_eq!(mesh.coordinate(), None);
        assert!(!mesh.is_member());
    }

    #[test]
    fn mesh_equality_is_identity_not_structural() {
        let a = DeviceMesh::from_rank(vec![4], Some(0), vec![None]).unwrap();
        let b = DeviceMesh::from_rank(vec![4], Some(0), vec![None]).unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn non_member_has_no_coordinate() {
        let mesh = DeviceMesh::from_rank(vec![4], None, vec![None]).unwrap();
        assert_eq!(mesh.coordinate_of_self(), None);
        assert!(!mesh.is_member());
    }
}
