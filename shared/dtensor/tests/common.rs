//! Shared helper for integration tests: builds a group of [`DeviceMesh`]es,
//! one per simulated worker, all wired to the same in-process loopback
//! communicators. Mirrors `device_mesh::test_mesh_group`, reimplemented here
//! against the crate's public API since integration tests in `tests/` can't
//! reach `pub(crate)` items.

#![cfg(not(feature = "parallelism"))]
#![allow(dead_code)]

use std::sync::Arc;

use psyche_dtensor::{Communicator, CommunicatorId, DeviceMesh};

pub fn mesh_group(shape: Vec<i64>) -> Vec<DeviceMesh> {
    let total: usize = shape.iter().product::<i64>() as usize;
    let mut per_dim_ids = Vec::with_capacity(shape.len());
    let mut dim_world_sizes = Vec::with_capacity(shape.len());
    for &size in &shape {
        if size == 1 {
            per_dim_ids.push(None);
        } else {
            per_dim_ids.push(Some(CommunicatorId::new(size as usize)));
        }
        dim_world_sizes.push(size);
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
                    id.as_ref()
                        .map(|id| Arc::new(Communicator::new(id.clone(), c as usize, size as usize)))
                })
                .collect();
            DeviceMesh::new(shape.clone(), Some(coord), communicators).unwrap()
        })
        .collect()
}

/// `tch::Tensor` is not `Send` on its own; each simulated worker thread below
/// owns a distinct CPU tensor it never shares outside this scope, so ferrying
/// it across the `thread::scope` boundary is sound (same argument the crate's
/// own unit tests make for `SendTensor`).
pub struct SendTensor(pub tch::Tensor);
unsafe impl Send for SendTensor {}
