//! The public entry point: a local tensor tagged with its [`Spec`], and the
//! forward/backward operator that moves it between placements.

use tch::Tensor;
use tracing::debug;

use crate::error::RedistributeError;
use crate::placement::Placement;
use crate::spec::Spec;
use crate::transform::plan;

/// A tensor sharded/replicated/partial according to `spec`, on this worker.
///
/// Mirrors the shape of the host crate's `CausalLanguageModel` public
/// surface: a thin owning wrapper with constructors and accessors, no
/// hidden state beyond what's printed by `Debug`.
#[derive(Debug)]
pub struct DTensor {
    local: Tensor,
    spec: Spec,
}

impl DTensor {
    pub fn new(local: Tensor, spec: Spec) -> Self {
        DTensor { local, spec }
    }

    pub fn local(&self) -> &Tensor {
        &self.local
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn into_parts(self) -> (Tensor, Spec) {
        (self.local, self.spec)
    }
}

/// Forward redistribute: moves `input` onto `target_placements` on the same
/// mesh, running the planner then the executor.
pub fn redistribute(
    input: DTensor,
    target_placements: &[Placement],
    async_op: bool,
) -> Result<DTensor, RedistributeError> {
    let (local, src_spec) = input.into_parts();
    let dst_spec = Spec::new(
        src_spec.mesh.clone(),
        target_placements.to_vec(),
        src_spec.meta.clone(),
    )?;
    debug!(?target_placements, "redistribute forward");
    let steps = plan(&src_spec, &dst_spec)?;
    let new_local = crate::executor::execute(local, &steps, &src_spec.mesh, async_op, false)?;
    Ok(DTensor::new(new_local, dst_spec))
}

/// Backward redistribute: the planner runs on `(grad_spec, previous_spec)`
/// with `is_backward = true` — `Replicate -> Partial` becomes a no-op instead
/// of a partition-scaling, and `Shard -> Partial` is permitted (lowered to an
/// all-gather). Any `Partial` placement surviving in the resulting spec is
/// normalized to `Replicate`: a gradient is never handed back to the caller
/// still tagged `Partial`.
pub fn redistribute_backward(
    grad: DTensor,
    previous_spec: &Spec,
    async_op: bool,
) -> Result<DTensor, RedistributeError> {
    let (local, grad_spec) = grad.into_parts();
    debug!("redistribute backward");
    let steps = plan(&grad_spec, previous_spec)?;
    let new_local = crate::executor::execute(local, &steps, &grad_spec.mesh, async_op, true)?;

    let normalized_placements: Vec<Placement> = previous_spec
        .placements
        .iter()
        .map(|p| if p.is_partial() { Placement::Replicate } else { *p })
        .collect();
    let normalized_spec = Spec::new(
        grad_spec.mesh.clone(),
        normalized_placements,
        previous_spec.meta.clone(),
    )?;
    Ok(DTensor::new(new_local, normalized_spec))
}
