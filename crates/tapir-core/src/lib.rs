//! # tapir-core
//!
//! Core of the Tapir tensor runtime: scope-managed tensor tracking and
//! tape-based automatic differentiation.
//!
//! This crate provides:
//! - [`Engine`] — reference-counted tensor lifecycle, nested disposal
//!   scopes, kernel execution, and gradient computation
//! - [`Tensor`] / [`TensorBuffer`] — lightweight handles and a host-side
//!   staging buffer
//! - [`Shape`] / [`DType`] / [`Values`] — shape, dtype, and flat storage
//!   primitives
//! - [`Backend`] trait — the buffer-storage capability the engine consumes
//! - [`TapeNode`] — recorded operations replayed by
//!   [`Engine::gradients`]
//! - [`ops`] — the op layer (creation, elementwise, reductions, views)
//!
//! Everything mutable lives inside one [`Engine`] instance; ops receive
//! the engine handle explicitly and there are no global registries.

pub mod backend;
pub mod container;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod ops;
pub mod profiler;
pub mod shape;
pub mod tape;
pub mod tensor;
pub mod values;

pub use backend::{Backend, BackendMemory, KernelTiming, PixelData};
pub use container::{AsTensorContainer, TensorContainer};
pub use dtype::{has_encoding_loss, sum_out_type, upcast_type, DType};
pub use engine::{
    CustomGradResult, Engine, EngineConfig, KernelBackward, MemoryInfo, SavedTensors,
    ValueAndGrads,
};
pub use error::{Error, Result};
pub use profiler::{format_bytes, KernelProfile, ProfileInfo};
pub use shape::{infer_from_implicit_shape, squeeze_shape, Shape};
pub use tape::{InputGradientFn, NodeGradient, TapeNode};
pub use tensor::{DataId, Tensor, TensorBuffer, TensorId};
pub use values::{Values, WithDType};
