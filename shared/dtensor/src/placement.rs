//! The placement algebra: how a single mesh dimension partitions a tensor.

use tch::Tensor;
use tracing::trace;

use crate::collective::{Collective, ReduceOp};
use crate::device_mesh::DeviceMesh;

/// How one mesh dimension partitions the tensor. A [`crate::spec::Spec`]
/// carries one of these per mesh dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// The full tensor is present on every worker along this mesh dim.
    Replicate,
    /// The tensor is split along `dim` into `mesh_size` contiguous chunks;
    /// the worker at coordinate `k` holds chunk `k`.
    Shard(u32),
    /// Every worker holds a tensor of the full logical shape; the logical
    /// value is the `op`-reduction across workers.
    Partial(ReduceOp),
}

impl Placement {
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    pub fn is_shard(&self) -> bool {
        matches!(self, Placement::Shard(_))
    }

    pub fn is_shard_of(&self, dim: u32) -> bool {
        matches!(self, Placement::Shard(d) if *d == dim)
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Placement::Partial(_))
    }

    pub fn shard_dim(&self) -> Option<u32> {
        match self {
            Placement::Shard(d) => Some(*d),
            _ => None,
        }
    }

    /// `base`/`rem` split of `logical_size` elements across `mesh_size`
    /// workers: the first `rem` workers get `base + 1`, the rest get `base`.
    /// Returns `(local_size, pad)` where `pad` is how many elements `coord`'s
    /// chunk is short of the even `ceil_div` chunk size every collective
    /// expects as input.
    pub fn local_shard_size_on_dim(logical_size: i64, mesh_size: i64, coord: i64) -> (i64, i64) {
        let base = logical_size / mesh_size;
        let rem = logical_size % mesh_size;
        let local = base + i64::from(coord < rem);
        let ceil = base + i64::from(rem > 0);
        (local, ceil - local)
    }

    /// The even `ceil_div` chunk size every padded collective expects as
    /// input, independent of which worker's chunk we're looking at.
    fn ceil_chunk_size(logical_size: i64, mesh_size: i64) -> i64 {
        let base = logical_size / mesh_size;
        let rem = logical_size % mesh_size;
        base + i64::from(rem > 0)
    }
}

impl Placement {
    /// `Partial -> Replicate`: an all-reduce with this placement's op.
    pub fn reduce_value(
        &self,
        local: &Tensor,
        mesh: &DeviceMesh,
        mesh_dim: usize,
    ) -> Result<Tensor, tch::TchError> {
        let op = match self {
            Placement::Partial(op) => *op,
            other => panic!("reduce_value called on non-Partial placement {other:?}"),
        };
        match mesh.communicator(mesh_dim) {
            Some(comm) => {
                trace!(mesh_dim, ?op, "all_reduce");
                Ok(local.all_reduce(comm, op)?.wait())
            }
            None => Ok(local.shallow_clone()),
        }
    }

    /// `Partial -> Shard(target.dim)`: a reduce-scatter with this placement's
    /// op, splitting along `target`'s tensor dim.
    pub fn reduce_shard_value(
        &self,
        local: &Tensor,
        mesh: &DeviceMesh,
        mesh_dim: usize,
        target: &Placement,
    ) -> Result<Tensor, tch::TchError> {
        let op = match self {
            Placement::Partial(op) => *op,
            other => panic!("reduce_shard_value called on non-Partial placement {other:?}"),
        };
        let target_dim = target.shard_dim().expect("target of reduce_shard_value must be Shard");
        match mesh.communicator(mesh_dim) {
            Some(comm) => {
                trace!(mesh_dim, ?op, target_dim, "reduce_scatter");
                Ok(local.reduce_scatter(comm, op, target_dim as i64)?.wait())
            }
            None => Ok(local.shallow_clone()),
        }
    }

    /// `Shard -> Replicate`: a padded all-gather, cropped back to
    /// `logical_shape[shard.dim]`.
    pub fn to_replicate(
        &self,
        local: &Tensor,
        mesh: &DeviceMesh,
        mesh_dim: usize,
        logical_shape: &[i64],
    ) -> Result<Tensor, tch::TchError> {
        let dim = self.shard_dim().expect("to_replicate called on non-Shard placement") as i64;
        let mesh_size = mesh.size(mesh_dim);
        let logical_size = logical_shape[dim as usize];
        let ceil = Placement::ceil_chunk_size(logical_size, mesh_size);
        let pad = ceil - local.size()[dim as usize];
        let padded = pad_dim(local, dim, pad);
        match mesh.communicator(mesh_dim) {
            Some(comm) => {
                trace!(mesh_dim, dim, "all_gather");
                let gathered = padded.all_gather(comm, dim)?.wait();
                Ok(crop_dim(&gathered, dim, logical_size))
            }
            None => Ok(crop_dim(&padded, dim, logical_size)),
        }
    }

    /// `Replicate -> Shard`: a local slice, no communication.
    pub fn replicate_to_shard(&self, local: &Tensor, mesh: &DeviceMesh, mesh_dim: usize, coord: i64) -> Tensor {
        let dim = self.shard_dim().expect("replicate_to_shard called on non-Shard placement") as i64;
        let mesh_size = mesh.size(mesh_dim);
        let logical_size = local.size()[dim as usize];
        let (local_size, _) = Placement::local_shard_size_on_dim(logical_size, mesh_size, coord);
        let offset: i64 = (0..coord)
            .map(|c| Placement::local_shard_size_on_dim(logical_size, mesh_size, c).0)
            .sum();
        local.narrow(dim, offset, local_size)
    }

    /// `Shard(d1) -> Shard(d2)`, `d1 != d2`: a padded all-to-all, cropped on
    /// the destination dim to this worker's chunk of `logical_shape[d2]`.
    pub fn to_new_shard_dim(
        &self,
        local: &Tensor,
        mesh: &DeviceMesh,
        mesh_dim: usize,
        logical_shape: &[i64],
        new_dim: u32,
    ) -> Result<Tensor, tch::TchError> {
        let src_dim = self.shard_dim().expect("to_new_shard_dim called on non-Shard placement") as i64;
        let dst_dim = new_dim as i64;
        let mesh_size = mesh.size(mesh_dim);
        let src_logical = logical_shape[src_dim as usize];
        let ceil = Placement::ceil_chunk_size(src_logical, mesh_size);
        let pad = ceil - local.size()[src_dim as usize];
        let padded = pad_dim(local, src_dim, pad);

        let coord = mesh.coordinate_of_self().map(|c| c[mesh_dim]).unwrap_or(0);
        let (dst_local_size, _) =
            Placement::local_shard_size_on_dim(logical_shape[dst_dim as usize], mesh_size, coord);

        match mesh.communicator(mesh_dim) {
            Some(comm) => {
                trace!(mesh_dim, src_dim, dst_dim, "all_to_all");
                let resplit = padded.all_to_all(comm, src_dim, dst_dim)?.wait();
                Ok(crop_dim(&resplit, dst_dim, dst_local_size))
            }
            None => Ok(crop_dim(&padded, src_dim, src_logical)),
        }
    }
}

fn pad_dim(tensor: &Tensor, dim: i64, pad: i64) -> Tensor {
    if pad == 0 {
        return tensor.shallow_clone();
    }
    let mut pad_shape = tensor.size();
    pad_shape[dim as usize] = pad;
    let zeros = Tensor::zeros(&pad_shape, (tensor.kind(), tensor.device()));
    Tensor::cat(&[tensor.shallow_clone(), zeros], dim)
}

fn crop_dim(tensor: &Tensor, dim: i64, size: i64) -> Tensor {
    if tensor.size()[dim as usize] == size {
        return tensor.shallow_clone();
    }
    tensor.narrow(dim, 0, size)
}
