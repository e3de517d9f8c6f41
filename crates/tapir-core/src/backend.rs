use std::fmt;

use crate::bail;
use crate::dtype::DType;
use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::DataId;
use crate::values::Values;

// Backend — the buffer-storage capability the engine consumes
//
// The engine never touches raw memory. It owns the reference counts and
// decides WHEN a buffer lives or dies; the backend owns the buffers
// themselves and decides WHERE and HOW they are stored. Implementations
// keep a registry keyed by DataId and answer read/write requests against
// it.
//
// WHY A TRAIT AND NOT AN ENUM?
//
// New backends can be added as separate crates without modifying
// tapir-core, and the engine monomorphizes over the backend type. The
// tradeoff is that Engine becomes generic: Engine<B: Backend>.
//
// `time` and `from_pixels` are associated functions rather than methods:
// neither needs the buffer registry, and the profiler must be able to
// time a closure that holds the engine — which owns the backend instance.

/// A backend's view of its own memory, aggregated into
/// [`Engine::memory`](crate::Engine::memory).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendMemory {
    /// Bytes held across all registered buffers.
    pub num_bytes: usize,
    /// Number of registered buffers.
    pub num_data_buffers: usize,
    /// Whether the byte count is an estimate rather than an exact figure.
    pub unreliable: bool,
}

/// Timing information for one timed closure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelTiming {
    /// Wall-clock milliseconds the closure took.
    pub kernel_ms: f64,
}

/// Raw interleaved RGBA pixel data, the input to [`Backend::from_pixels`].
#[derive(Debug, Clone)]
pub struct PixelData {
    pub width: usize,
    pub height: usize,
    /// `width * height * 4` bytes, row-major, RGBA interleaved.
    pub rgba: Vec<u8>,
}

impl PixelData {
    pub fn new(width: usize, height: usize, rgba: Vec<u8>) -> Result<Self> {
        if rgba.len() != width * height * 4 {
            bail!(
                "pixel data for {}x{} must hold {} bytes, got {}",
                width,
                height,
                width * height * 4,
                rgba.len()
            );
        }
        Ok(PixelData {
            width,
            height,
            rgba,
        })
    }
}

/// The storage/execution capability consumed by the engine.
pub trait Backend: fmt::Debug + 'static {
    /// Allocate a zero-filled buffer for `data_id`. Called exactly once per
    /// buffer, when the first tensor referencing it is registered.
    fn register(&mut self, data_id: DataId, shape: &Shape, dtype: DType) -> Result<()>;

    /// Overwrite the contents of a registered buffer.
    fn write(&mut self, data_id: DataId, values: Values) -> Result<()>;

    /// Read back the contents of a registered buffer. This runtime is
    /// synchronous; there is no deferred variant.
    fn read(&self, data_id: DataId) -> Result<Values>;

    /// Release a buffer. Called when the last referencing tensor is
    /// disposed. Releasing an unknown id is a no-op.
    fn dispose_data(&mut self, data_id: DataId) -> Result<()>;

    /// Snapshot of the backend's own memory usage.
    fn memory(&self) -> BackendMemory;

    /// Time a closure. The CPU backend uses the wall clock; a device
    /// backend would use its own timer.
    fn time(f: &mut dyn FnMut() -> Result<()>) -> Result<KernelTiming>;

    /// Decode interleaved RGBA bytes into the first `num_channels` planes,
    /// producing int32 values laid out `[height, width, num_channels]`.
    fn from_pixels(pixels: &PixelData, num_channels: usize) -> Result<Values>;
}
