//! Metadata describing the logically global tensor a [`crate::spec::Spec`]
//! partitions, independent of how it's currently sharded.

use tch::Kind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub global_shape: Vec<i64>,
    pub stride: Vec<i64>,
    pub dtype: DType,
}

/// `tch::Kind` doesn't implement `Hash`/`Eq`, which the planner's memoization
/// needs; this is a thin structural mirror used only as a hashable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float,
    Double,
    Half,
    BFloat16,
    Int64,
    Int32,
    Int16,
    Int8,
    Uint8,
    Bool,
}

impl From<Kind> for DType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Float => DType::Float,
            Kind::Double => DType::Double,
            Kind::Half => DType::Half,
            Kind::BFloat16 => DType::BFloat16,
            Kind::Int64 => DType::Int64,
            Kind::Int => DType::Int32,
            Kind::Int16 => DType::Int16,
            Kind::Int8 => DType::Int8,
            Kind::Uint8 => DType::Uint8,
            Kind::Bool => DType::Bool,
            other => panic!("unsupported dtype for DTensor: {other:?}"),
        }
    }
}

impl From<DType> for Kind {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::Float => Kind::Float,
            DType::Double => Kind::Double,
            DType::Half => Kind::Half,
            DType::BFloat16 => Kind::BFloat16,
            DType::Int64 => Kind::Int64,
            DType::Int32 => Kind::Int,
            DType::Int16 => Kind::Int16,
            DType::Int8 => Kind::Int8,
            DType::Uint8 => Kind::Uint8,
            DType::Bool => Kind::Bool,
        }
    }
}

impl TensorMeta {
    pub fn new(global_shape: Vec<i64>, stride: Vec<i64>, dtype: DType) -> Self {
        TensorMeta {
            global_shape,
            stride,
            dtype,
        }
    }

    /// Contiguous row-major stride for `global_shape`, the common case when
    /// constructing a `Spec` from a freshly materialized tensor.
    pub fn contiguous(global_shape: Vec<i64>, dtype: DType) -> Self {
        let mut stride = vec![1i64; global_shape.len()];
        for i in (0..global_shape.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * global_shape[i + 1];
        }
        TensorMeta {
            global_shape,
            stride,
            dtype,
        }
    }
}
