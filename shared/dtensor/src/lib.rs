mod collective;
mod device_mesh;
mod error;
mod executor;
mod meta;
mod placement;
mod redistribute;
mod spec;
mod transform;

pub use collective::{Collective, Communicator, CommunicatorId, PendingTensor, ReduceOp};
pub use device_mesh::DeviceMesh;
pub use error::{MeshError, PlanError, RedistributeError};
pub use executor::execute;
pub use meta::{DType, TensorMeta};
pub use placement::Placement;
pub use redistribute::{redistribute, redistribute_backward, DTensor};
pub use spec::Spec;
pub use transform::{plan, TransformStep};
