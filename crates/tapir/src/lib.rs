//! # Tapir
//!
//! A scope-managed tensor runtime with tape-based automatic
//! differentiation.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use tapir::prelude::*;
//!
//! let mut engine = CpuEngine::new(CpuBackend::new());
//! let x = ops::scalar(&mut engine, 3.0, DType::F32).unwrap();
//! let result = engine
//!     .gradients(|eng| ops::mul(eng, &x, &x), &[x.clone()], None, false)
//!     .unwrap();
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `tapir-core` | Engine, Tensor, Shape, DType, Backend trait, tape |
//! | `tapir-cpu` | Reference CPU backend (host-memory buffer registry) |

/// Re-export core types.
pub use tapir_core::{
    backend::{Backend, BackendMemory, KernelTiming, PixelData},
    container::{AsTensorContainer, TensorContainer},
    dtype::{has_encoding_loss, sum_out_type, upcast_type},
    engine::{CustomGradResult, KernelBackward, SavedTensors},
    profiler::{format_bytes, KernelProfile, ProfileInfo},
    tape::{InputGradientFn, NodeGradient, TapeNode},
    tensor::{DataId, TensorBuffer, TensorId},
    DType, Engine, EngineConfig, Error, MemoryInfo, Result, Shape, Tensor, ValueAndGrads, Values,
    WithDType,
};

/// Re-export the op layer.
pub use tapir_core::ops;

/// Re-export the CPU backend.
pub use tapir_cpu::CpuBackend;

/// An engine running on the CPU backend.
pub type CpuEngine = Engine<CpuBackend>;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::ops;
    pub use crate::{
        CpuBackend, CpuEngine, DType, Engine, EngineConfig, Error, MemoryInfo, Result, Shape,
        Tensor, TensorBuffer, ValueAndGrads, Values,
    };
}
