use std::fmt;

use crate::backend::Backend;
use crate::bail;
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::values::Values;

// Tensor — a lightweight handle into the engine
//
// A Tensor does not own its data. It names a buffer (DataId) held by the
// backend and carries the shape/dtype view onto that buffer. Several
// handles may share one buffer (reshape produces a new handle over the
// same DataId); the buffer is the unit of allocation and reference
// counting, the handle is the unit of logical ownership.
//
// Handles are only ever minted by the engine, which assigns both ids from
// its own monotonic counters and registers the tensor with the active
// scope. Cloning a handle is cheap and does NOT touch the reference
// count — the count tracks registered tensors, not Rust clones.

/// Unique identifier for a tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor {}", self.0)
    }
}

/// Unique identifier for a data buffer held by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub(crate) u64);

impl DataId {
    /// Construct an id from a raw value. Engines mint their own ids; this
    /// exists for backend implementations exercising their registry
    /// directly.
    pub fn from_raw(raw: u64) -> Self {
        DataId(raw)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}

/// Handle to an n-dimensional array value: shape + dtype + buffer id.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    id: TensorId,
    data_id: DataId,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    pub(crate) fn new(id: TensorId, data_id: DataId, shape: Shape, dtype: DType) -> Self {
        Tensor {
            id,
            data_id,
            shape,
            dtype,
        }
    }

    /// Unique tensor id.
    pub fn id(&self) -> TensorId {
        self.id
    }

    /// The id of the underlying data buffer.
    pub fn data_id(&self) -> DataId {
        self.data_id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Total number of elements (1 for a scalar).
    pub fn size(&self) -> usize {
        self.shape.elem_count()
    }

    /// Data type of the elements.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Row-major strides for this tensor's shape.
    pub fn strides(&self) -> Vec<usize> {
        self.shape.stride_contiguous()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={}, shape={}, dtype={}, {})",
            self.id.0, self.shape, self.dtype, self.data_id
        )
    }
}

// TensorBuffer — host-side staging area
//
// A mutable coordinate-addressable buffer for building tensor values one
// element at a time before handing them to the engine. Complex64 buffers
// are rejected; build the real and imaginary parts separately instead.

/// A host buffer with coordinate get/set, convertible into a tracked tensor.
#[derive(Debug, Clone)]
pub struct TensorBuffer {
    shape: Shape,
    dtype: DType,
    strides: Vec<usize>,
    values: Values,
}

impl TensorBuffer {
    /// Create a buffer for the given shape and dtype, optionally seeded
    /// with values (which must match the shape's element count).
    pub fn new(shape: impl Into<Shape>, dtype: DType, values: Option<Values>) -> Result<Self> {
        let shape = shape.into();
        if dtype == DType::C64 {
            bail!(
                "complex64 TensorBuffers are not supported: build the real and \
                 imaginary parts separately"
            );
        }
        let size = shape.elem_count();
        let values = match values {
            Some(v) => {
                if v.len() != size {
                    return Err(Error::ElementCountMismatch {
                        shape: shape.clone(),
                        expected: size,
                        got: v.len(),
                    });
                }
                if v.dtype() != dtype {
                    return Err(Error::DTypeMismatch {
                        expected: dtype,
                        got: v.dtype(),
                    });
                }
                v
            }
            None => Values::zeros(dtype, size),
        };
        let strides = shape.stride_contiguous();
        Ok(TensorBuffer {
            shape,
            dtype,
            strides,
            values,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Flatten a coordinate into a linear index.
    pub fn loc_to_index(&self, locs: &[usize]) -> Result<usize> {
        if locs.len() != self.shape.rank() {
            return Err(Error::RankMismatch {
                expected: self.shape.rank(),
                got: locs.len(),
            });
        }
        let mut index = 0;
        for (i, (&loc, &dim)) in locs.iter().zip(self.shape.dims()).enumerate() {
            if loc >= dim {
                bail!("coordinate {} is out of bounds for dim {} of size {}", loc, i, dim);
            }
            index += self.strides[i] * loc;
        }
        Ok(index)
    }

    /// Expand a linear index back into a coordinate.
    pub fn index_to_loc(&self, mut index: usize) -> Vec<usize> {
        let rank = self.shape.rank();
        let mut locs = vec![0usize; rank];
        for i in 0..rank {
            locs[i] = index / self.strides[i];
            index -= locs[i] * self.strides[i];
        }
        locs
    }

    /// Write one element at the given coordinate.
    pub fn set(&mut self, value: f64, locs: &[usize]) -> Result<()> {
        let index = self.loc_to_index(locs)?;
        match &mut self.values {
            Values::F32(v) => v[index] = value as f32,
            Values::I32(v) => v[index] = value as i32,
            Values::Bool(v) => v[index] = u8::from(value.round() != 0.0),
            // new() rejects complex64
            Values::C64(_) => bail!("complex64 TensorBuffers are not supported"),
        }
        Ok(())
    }

    /// Read one element at the given coordinate.
    pub fn get(&self, locs: &[usize]) -> Result<f64> {
        let index = self.loc_to_index(locs)?;
        match &self.values {
            Values::F32(v) => Ok(v[index] as f64),
            Values::I32(v) => Ok(v[index] as f64),
            Values::Bool(v) => Ok(v[index] as f64),
            Values::C64(_) => bail!("complex64 TensorBuffers are not supported"),
        }
    }

    /// Hand the buffer to the engine, producing a tracked tensor.
    pub fn to_tensor<B: Backend>(self, engine: &mut Engine<B>) -> Result<Tensor> {
        engine.make_tensor(self.shape, self.dtype, Some(self.values))
    }
}
