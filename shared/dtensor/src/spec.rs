//! The canonical description of how a tensor is partitioned: a mesh, one
//! placement per mesh dimension, and the global tensor metadata.

use crate::device_mesh::DeviceMesh;
use crate::error::MeshError;
use crate::meta::TensorMeta;
use crate::placement::Placement;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Spec {
    pub mesh: DeviceMesh,
    pub placements: Vec<Placement>,
    pub meta: TensorMeta,
}

impl Spec {
    pub fn new(
        mesh: DeviceMesh,
        placements: Vec<Placement>,
        meta: TensorMeta,
    ) -> Result<Self, MeshError> {
        if placements.len() != mesh.ndim() {
            return Err(MeshError::PlacementCountMismatch {
                expected: mesh.ndim(),
                got: placements.len(),
            });
        }
        for placement in &placements {
            if let Placement::Shard(dim) = placement {
                if *dim as usize >= meta.global_shape.len() {
                    return Err(MeshError::ShardDimOutOfRange {
                        dim: *dim,
                        rank: meta.global_shape.len(),
                    });
                }
            }
        }
        Ok(Spec {
            mesh,
            placements,
            meta,
        })
    }

    pub fn shape(&self) -> &[i64] {
        &self.meta.global_shape
    }

    /// Product of mesh sizes over every dimension that currently shards the
    /// tensor. `1` means the tensor is not split at all (fully replicated or
    /// partial on every sharding dimension).
    pub fn num_shards(&self) -> i64 {
        self.placements
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_shard())
            .map(|(i, _)| self.mesh.size(i))
            .product()
    }

    /// `true` if tensor dimension `d` is sharded by more than one mesh
    /// dimension (the nested-sharding case the planner must unwind before it
    /// can touch the outer one).
    pub fn is_nested_sharded(&self, dim: u32) -> bool {
        self.placements.iter().filter(|p| p.is_shard_of(dim)).count() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::ReduceOp;
    use crate::meta::DType;

    fn mesh_1d(size: i64) -> DeviceMesh {
        DeviceMesh::from_rank(vec![size], Some(0), vec![None]).unwrap()
    }

    #[test]
    fn num_shards_counts_only_sharded_dims() {
        let mesh = DeviceMesh::from_rank(vec![2, 3], Some(0), vec![None, None]).unwrap();
        let meta = TensorMeta::contiguous(vec![8, 8], DType::Float);
        let spec = Spec::new(
            mesh,
            vec![Placement::Shard(0), Placement::Partial(ReduceOp::Sum)],
            meta,
        )
        .unwrap();
        assert_eq!(spec.num_shards(), 2);
    }

    #[test]
    fn nested_sharding_detected() {
        let mesh = DeviceMesh::from_rank(vec![2, 2], Some(0), vec![None, None]).unwrap();
        let meta = TensorMeta::contiguous(vec![4, 4], DType::Float);
        let spec = Spec::new(mesh, vec![Placement::Shard(0), Placement::Shard(0)], meta).unwrap();
        assert!(spec.is_nested_sharded(0));
        assert!(!spec.is_nested_sharded(1));
    }

    #[test]
    fn rejects_placement_count_mismatch() {
        let mesh = mesh_1d(4);
        let meta = TensorMeta::contiguous(vec![8], DType::Float);
        let err = Spec::new(mesh, vec![Placement::Replicate, Placement::Replicate], meta);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_shard_dim_out_of_range() {
        let mesh = mesh_1d(4);
        let meta = TensorMeta::contiguous(vec![8], DType::Float);
        let err = Spec::new(mesh, vec![Placement::Shard(3)], meta);
        assert!(err.is_err());
    }
}
