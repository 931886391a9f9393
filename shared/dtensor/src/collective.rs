//! Collective communication primitives consumed by the planner/executor.
//!
//! Mirrors the dual-implementation shape of `psyche-modeling`'s
//! `tensor_parallelism.rs`: a real communicator backed by `tch::CNCCL` under
//! the `parallelism` feature, and a trivial stand-in otherwise. Unlike the
//! host crate (which only ever ran with `parallelism` on, on real GPUs), this
//! crate also needs to exercise planner/executor logic in ordinary `cargo
//! test` runs, so the non-parallelism path here is a working in-process
//! loopback rather than an `unimplemented!()`.

use std::sync::{Arc, Condvar, Mutex};

use tch::Tensor;

#[cfg(feature = "parallelism")]
use tch::{CStore, ReduceOpType, CNCCL};

#[cfg(feature = "parallelism")]
pub type Communicator = CNCCL;

#[cfg(feature = "parallelism")]
pub type CommunicatorId = CStore;

/// In-process stand-in for a mesh-dimension communicator, used when the
/// `parallelism` feature is disabled. All workers sharing one `LoopbackGroup`
/// rendezvous through a shared slot table; this is a test/dev convenience,
/// not a network protocol.
#[cfg(not(feature = "parallelism"))]
#[derive(Debug)]
pub struct Communicator {
    rank: usize,
    world_size: usize,
    group: Arc<LoopbackGroup>,
}

#[cfg(not(feature = "parallelism"))]
#[derive(Debug, Clone)]
pub struct CommunicatorId(Arc<LoopbackGroup>);

/// Barrier-with-payload: like `psyche_core`'s `CancellableBarrier`, but each
/// arriver also deposits a `Tensor` that every arriver reads back once the
/// last one shows up. One round per collective call.
#[cfg(not(feature = "parallelism"))]
#[derive(Debug)]
struct LoopbackGroup {
    world_size: usize,
    cvar: Condvar,
    state: Mutex<RendezvousState>,
}

#[cfg(not(feature = "parallelism"))]
#[derive(Debug)]
struct RendezvousState {
    generation: usize,
    arrived: usize,
    slots: Vec<Option<Tensor>>,
}

// `tch::Tensor` wraps a raw libtorch pointer and isn't `Send`/`Sync` on its
// own; the host crate hits the same wall and promises `Send` by hand on
// wrapper types (see `TensorParallelRowLinear`). Each simulated worker in a
// test owns a distinct CPU tensor and only ever touches it behind this
// group's mutex, so handing tensors across the thread boundary here is sound.
#[cfg(not(feature = "parallelism"))]
unsafe impl Send for LoopbackGroup {}
#[cfg(not(feature = "parallelism"))]
unsafe impl Sync for LoopbackGroup {}

#[cfg(not(feature = "parallelism"))]
impl CommunicatorId {
    pub fn new(world_size: usize) -> Self {
        CommunicatorId(Arc::new(LoopbackGroup {
            world_size,
            cvar: Condvar::new(),
            state: Mutex::new(RendezvousState {
                generation: 0,
                arrived: 0,
                slots: (0..world_size).map(|_| None).collect(),
            }),
        }))
    }
}

#[cfg(not(feature = "parallelism"))]
impl Communicator {
    pub fn new(id: CommunicatorId, rank: usize, world_size: usize) -> Self {
        assert_eq!(id.0.world_size, world_size);
        Communicator {
            rank,
            world_size,
            group: id.0,
        }
    }

    pub fn size(&self) -> i64 {
        self.world_size as i64
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Publishes `local` at this rank's slot and blocks until every rank in
    /// the group has published for this round, returning every rank's
    /// contribution in rank order. Intended for single-process tests where
    /// every simulated worker runs on its own thread and shares one
    /// `Arc<LoopbackGroup>` per mesh dimension.
    fn rendezvous(&self, local: Tensor) -> Vec<Tensor> {
        let mut state = self.group.state.lock().unwrap();
        let my_generation = state.generation;
        state.slots[self.rank] = Some(local);
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.group.cvar.notify_all();
        } else {
            while state.generation == my_generation {
                state = self.group.cvar.wait(state).unwrap();
            }
        }
        state
            .slots
            .iter()
            .map(|slot| slot.as_ref().expect("all ranks publish before any reads back").shallow_clone())
            .collect()
    }
}

/// Reduction operator for `Partial` placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Avg,
    Max,
    Min,
    Product,
}

impl Default for ReduceOp {
    fn default() -> Self {
        ReduceOp::Sum
    }
}

#[cfg(feature = "parallelism")]
impl From<ReduceOp> for ReduceOpType {
    fn from(value: ReduceOp) -> Self {
        match value {
            ReduceOp::Sum => ReduceOpType::Sum,
            ReduceOp::Avg => ReduceOpType::Avg,
            ReduceOp::Max => ReduceOpType::Max,
            ReduceOp::Min => ReduceOpType::Min,
            ReduceOp::Product => ReduceOpType::Product,
        }
    }
}

/// A possibly-lazy collective result. Under `parallelism`, a real backend
/// could hand back an un-synchronized tensor here; the loopback backend
/// always materializes immediately, so `wait()` is a no-op for it, but
/// callers go through `wait()` regardless so the executor's async policy
/// (see `crate::executor`) is uniform across backends.
pub struct PendingTensor(Tensor);

impl PendingTensor {
    pub fn ready(tensor: Tensor) -> Self {
        PendingTensor(tensor)
    }

    pub fn wait(self) -> Tensor {
        self.0
    }
}

/// The five collectives the planner/executor lower transitions into. `mesh_dim`
/// identifies which mesh dimension's communicator to use; callers are
/// expected to have already checked `DeviceMesh::communicator(mesh_dim)` is
/// `Some` (size-1 dimensions never reach these calls).
pub trait Collective {
    /// `dim` is the shard dimension being gathered away; results are
    /// reassembled along it, not along dim 0.
    fn all_gather(&self, comm: &Communicator, dim: i64) -> Result<PendingTensor, tch::TchError>;
    fn reduce_scatter(
        &self,
        comm: &Communicator,
        op: ReduceOp,
        scatter_dim: i64,
    ) -> Result<PendingTensor, tch::TchError>;
    fn all_reduce(&self, comm: &Communicator, op: ReduceOp) -> Result<PendingTensor, tch::TchError>;
    fn all_to_all(
        &self,
        comm: &Communicator,
        src_dim: i64,
        dst_dim: i64,
    ) -> Result<PendingTensor, tch::TchError>;
    fn broadcast(&self, comm: &Communicator, root: i64) -> Result<PendingTensor, tch::TchError>;
}

#[cfg(feature = "parallelism")]
impl Collective for Tensor {
    fn all_gather(&self, comm: &Communicator, dim: i64) -> Result<PendingTensor, tch::TchError> {
        let world_size = comm.size() as usize;
        let mut outputs: Vec<Tensor> = (0..world_size).map(|_| self.empty_like()).collect();
        comm.all_gather(&outputs.iter().collect::<Vec<_>>(), self)?;
        let gathered = Tensor::cat(&outputs, dim);
        Ok(PendingTensor::ready(gathered))
    }

    fn reduce_scatter(
        &self,
        comm: &Communicator,
        op: ReduceOp,
        scatter_dim: i64,
    ) -> Result<PendingTensor, tch::TchError> {
        let chunks = self.chunk(comm.size(), scatter_dim);
        let mut output = chunks[comm.rank()].empty_like();
        comm.reduce_scatter(&mut output, &chunks, op.into())?;
        Ok(PendingTensor::ready(output))
    }

    fn all_reduce(&self, comm: &Communicator, op: ReduceOp) -> Result<PendingTensor, tch::TchError> {
        let mut tensor = self.shallow_clone();
        comm.all_reduce(&[&tensor], op.into())?;
        Ok(PendingTensor::ready(tensor))
    }

    fn all_to_all(
        &self,
        comm: &Communicator,
        src_dim: i64,
        dst_dim: i64,
    ) -> Result<PendingTensor, tch::TchError> {
        // Each rank splits its local shard into one block per peer along the
        // *new* shard dim, and reassembles what it receives back along the
        // dim it was previously sharded on.
        let world_size = comm.size();
        let sent = self.chunk(world_size, dst_dim);
        let mut received: Vec<Tensor> = sent.iter().map(|t| t.empty_like()).collect();
        comm.all_to_all(&mut received, &sent)?;
        Ok(PendingTensor::ready(Tensor::cat(&received, src_dim)))
    }

    fn broadcast(&self, comm: &Communicator, root: i64) -> Result<PendingTensor, tch::TchError> {
        let mut tensor = self.shallow_clone();
        comm.broadcast(&mut tensor, root)?;
        Ok(PendingTensor::ready(tensor))
    }
}

#[cfg(not(feature = "parallelism"))]
impl Collective for Tensor {
    fn all_gather(&self, comm: &Communicator, dim: i64) -> Result<PendingTensor, tch::TchError> {
        let parts = comm.rendezvous(self.shallow_clone());
        Ok(PendingTensor::ready(Tensor::cat(&parts, dim)))
    }

    fn reduce_scatter(
        &self,
        comm: &Communicator,
        op: ReduceOp,
        scatter_dim: i64,
    ) -> Result<PendingTensor, tch::TchError> {
        let parts = comm.rendezvous(self.shallow_clone());
        let reduced = reduce_stack(&parts, op);
        let chunks = reduced.chunk(comm.world_size as i64, scatter_dim);
        Ok(PendingTensor::ready(chunks[comm.rank].shallow_clone()))
    }

    fn all_reduce(&self, comm: &Communicator, op: ReduceOp) -> Result<PendingTensor, tch::TchError> {
        let parts = comm.rendezvous(self.shallow_clone());
        Ok(PendingTensor::ready(reduce_stack(&parts, op)))
    }

    fn all_to_all(
        &self,
        comm: &Communicator,
        src_dim: i64,
        dst_dim: i64,
    ) -> Result<PendingTensor, tch::TchError> {
        // Each rank splits its local shard into one block per peer along the
        // *new* shard dim, and reassembles what it receives back along the
        // dim it was previously sharded on.
        let world_size = comm.world_size as i64;
        let mine = self.chunk(world_size, dst_dim);
        let all_sent: Vec<Vec<Tensor>> = comm
            .rendezvous(Tensor::stack(&mine, 0))
            .into_iter()
            .map(|stacked| {
                (0..world_size)
                    .map(|i| stacked.select(0, i))
                    .collect::<Vec<_>>()
            })
            .collect();
        let received: Vec<Tensor> = all_sent.iter().map(|sent| sent[comm.rank].shallow_clone()).collect();
        Ok(PendingTensor::ready(Tensor::cat(&received, src_dim)))
    }

    fn broadcast(&self, comm: &Communicator, root: i64) -> Result<PendingTensor, tch::TchError> {
        let parts = comm.rendezvous(self.shallow_clone());
        Ok(PendingTensor::ready(parts[root as usize].shallow_clone()))
    }
}

#[cfg(not(feature = "parallelism"))]
fn reduce_stack(parts: &[Tensor], op: ReduceOp) -> Tensor {
    let stacked = Tensor::stack(parts, 0);
    match op {
        ReduceOp::Sum => stacked.sum_dim_intlist(&[0i64][..], false, stacked.kind()),
        ReduceOp::Avg => stacked.mean_dim(&[0i64][..], false, stacked.kind()),
        ReduceOp::Max => stacked.amax(&[0i64][..], false),
        ReduceOp::Min => stacked.amin(&[0i64][..], false),
        ReduceOp::Product => stacked.prod_dim_int(0, false, stacked.kind()),
    }
}
