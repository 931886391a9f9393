//! End-to-end scenarios run against the full planner + executor, each worker
//! on its own thread so the loopback communicators' rendezvous (a real
//! barrier) doesn't deadlock.

#![cfg(not(feature = "parallelism"))]

mod common;

use common::{mesh_group, SendTensor};
use pretty_assertions::assert_eq;
use psyche_dtensor::{redistribute, redistribute_backward, DTensor, DType, Placement, ReduceOp, Spec, TensorMeta};
use tch::Tensor;

/// S4: 1D mesh size 4, global shape (8,4). `Shard(0) -> Shard(1)`: one
/// all-to-all; each worker's result has shape (8,1).
#[test]
fn s4_shard_to_shard_across_tensor_dims() {
    let meshes = mesh_group(vec![4]);
    // worker k holds rows [2k, 2k+2) of an (8,4) tensor, laid out 0..32.
    let global = Tensor::arange(32, (tch::Kind::Int64, tch::Device::Cpu)).reshape([8, 4]);

    std::thread::scope(|scope| {
        let handles: Vec<_> = meshes
            .iter()
            .enumerate()
            .map(|(rank, mesh)| {
                let local = SendTensor(global.narrow(0, (rank as i64) * 2, 2).contiguous());
                scope.spawn(move || {
                    let src = Spec::new(
                        mesh.clone(),
                        vec![Placement::Shard(0)],
                        TensorMeta::contiguous(vec![8, 4], DType::Int64),
                    )
                    .unwrap();
                    let dst = Spec::new(
                        mesh.clone(),
                        vec![Placement::Shard(1)],
                        TensorMeta::contiguous(vec![8, 4], DType::Int64),
                    )
                    .unwrap();
                    let dtensor = DTensor::new(local.0, src);
                    let out = redistribute(dtensor, &dst.placements, false).unwrap();
                    SendTensor(out.into_parts().0)
                })
            })
            .collect();
        for handle in handles {
            let out = handle.join().unwrap().0;
            assert_eq!(out.size(), vec![8, 1]);
        }
    });
}

/// S5: 1D mesh size 4. `Partial(Sum) -> Shard(0)`: one reduce-scatter; each
/// worker's output is the row-wise sum of the original partials' slice.
#[test]
fn s5_partial_sum_to_shard_is_reduce_scatter() {
    let meshes = mesh_group(vec![4]);
    // Worker k's local partial contribution is a constant-(k+1) (8,) tensor;
    // the true logical value is Sum over workers = 1+2+3+4 = 10 everywhere.
    std::thread::scope(|scope| {
        let handles: Vec<_> = meshes
            .iter()
            .enumerate()
            .map(|(rank, mesh)| {
                let local = SendTensor(Tensor::full([8], (rank as i64) + 1, (tch::Kind::Int64, tch::Device::Cpu)));
                scope.spawn(move || {
                    let src = Spec::new(
                        mesh.clone(),
                        vec![Placement::Partial(ReduceOp::Sum)],
                        TensorMeta::contiguous(vec![8], DType::Int64),
                    )
                    .unwrap();
                    let dst = Spec::new(
                        mesh.clone(),
                        vec![Placement::Shard(0)],
                        TensorMeta::contiguous(vec![8], DType::Int64),
                    )
                    .unwrap();
                    let dtensor = DTensor::new(local.0, src);
                    let out = redistribute(dtensor, &dst.placements, false).unwrap();
                    SendTensor(out.into_parts().0)
                })
            })
            .collect();
        for handle in handles {
            let out = handle.join().unwrap().0;
            let values: Vec<i64> = Vec::try_from(&out).unwrap();
            assert!(values.iter().all(|&v| v == 10));
        }
    });
}

/// Property 1 (round-trip): redistributing forward then back with the
/// original placements restores the original per-worker values, for a
/// non-Partial src/dst pair.
#[test]
fn round_trip_shard_to_replicate_and_back() {
    let meshes = mesh_group(vec![4]);
    let global = Tensor::from_slice(&[10i64, 11, 12, 13, 14, 15, 16, 17]);

    std::thread::scope(|scope| {
        let handles: Vec<_> = meshes
            .iter()
            .enumerate()
            .map(|(rank, mesh)| {
                let local = SendTensor(global.narrow(0, (rank as i64) * 2, 2).contiguous());
                scope.spawn(move || {
                    let local = local.0;
                    let expected: Vec<i64> = Vec::try_from(&local).unwrap();
                    let src = Spec::new(
                        mesh.clone(),
                        vec![Placement::Shard(0)],
                        TensorMeta::contiguous(vec![8], DType::Int64),
                    )
                    .unwrap();
                    let dst = Spec::new(
                        mesh.clone(),
                        vec![Placement::Replicate],
                        TensorMeta::contiguous(vec![8], DType::Int64),
                    )
                    .unwrap();
                    let forward = redistribute(DTensor::new(local, src.clone()), &dst.placements, false).unwrap();
                    let back = redistribute(forward, &src.placements, false).unwrap();
                    let (back_local, _) = back.into_parts();
                    let got: Vec<i64> = Vec::try_from(&back_local).unwrap();
                    assert_eq!(got, expected);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}

/// Property 2 (idempotence): redistributing to the same spec is a no-op.
#[test]
fn idempotent_redistribute_is_identity() {
    let meshes = mesh_group(vec![1]);
    let mesh = meshes[0].clone();
    let spec = Spec::new(
        mesh,
        vec![Placement::Shard(0)],
        TensorMeta::contiguous(vec![4], DType::Int64),
    )
    .unwrap();
    let local = Tensor::from_slice(&[5i64, 6, 7, 8]);
    let dtensor = DTensor::new(local.shallow_clone(), spec.clone());
    let out = redistribute(dtensor, &spec.placements, false).unwrap();
    assert_eq!(
        Vec::<i64>::try_from(out.local()).unwrap(),
        Vec::<i64>::try_from(&local).unwrap()
    );
}

/// Property 7 (backward normalization): any redistribute whose destination
/// placement is `Partial` comes back out of `redistribute_backward` with that
/// mesh dim normalized to `Replicate`.
#[test]
fn backward_of_partial_destination_normalizes_to_replicate() {
    let meshes = mesh_group(vec![4]);
    std::thread::scope(|scope| {
        let handles: Vec<_> = meshes
            .iter()
            .enumerate()
            .map(|(rank, mesh)| {
                let local = SendTensor(Tensor::from_slice(&[rank as i64, rank as i64]));
                scope.spawn(move || {
                    let grad_spec = Spec::new(
                        mesh.clone(),
                        vec![Placement::Replicate],
                        TensorMeta::contiguous(vec![2], DType::Int64),
                    )
                    .unwrap();
                    let previous_spec = Spec::new(
                        mesh.clone(),
                        vec![Placement::Partial(ReduceOp::Sum)],
                        TensorMeta::contiguous(vec![2], DType::Int64),
                    )
                    .unwrap();
                    let grad = DTensor::new(local.0, grad_spec);
                    let out = redistribute_backward(grad, &previous_spec, false).unwrap();
                    assert_eq!(out.spec().placements, vec![Placement::Replicate]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}
