//! # tapir-cpu
//!
//! The reference CPU backend: an in-memory buffer registry keyed by
//! [`DataId`], a wall-clock kernel timer, and host-side pixel decoding.
//!
//! The engine owns reference counts and lifetime decisions; this backend
//! just stores bytes and answers read/write requests.

use std::collections::HashMap;
use std::time::Instant;

use tapir_core::{
    bail, Backend, BackendMemory, DType, DataId, Error, KernelTiming, PixelData, Result, Shape,
    Values,
};

/// CPU backend: buffers live in a HashMap on the host heap.
#[derive(Debug, Default)]
pub struct CpuBackend {
    buffers: HashMap<DataId, Values>,
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend {
            buffers: HashMap::new(),
        }
    }

    /// Number of registered buffers (for tests and diagnostics).
    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl Backend for CpuBackend {
    fn register(&mut self, data_id: DataId, shape: &Shape, dtype: DType) -> Result<()> {
        if self.buffers.contains_key(&data_id) {
            bail!("{} is already registered", data_id);
        }
        self.buffers
            .insert(data_id, Values::zeros(dtype, shape.elem_count()));
        Ok(())
    }

    fn write(&mut self, data_id: DataId, values: Values) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(&data_id) else {
            return Err(Error::UnknownDataId { data_id });
        };
        if values.len() != buffer.len() {
            bail!(
                "write of {} values into {} which holds {}",
                values.len(),
                data_id,
                buffer.len()
            );
        }
        if values.dtype() != buffer.dtype() {
            return Err(Error::DTypeMismatch {
                expected: buffer.dtype(),
                got: values.dtype(),
            });
        }
        *buffer = values;
        Ok(())
    }

    fn read(&self, data_id: DataId) -> Result<Values> {
        self.buffers
            .get(&data_id)
            .cloned()
            .ok_or(Error::UnknownDataId { data_id })
    }

    fn dispose_data(&mut self, data_id: DataId) -> Result<()> {
        self.buffers.remove(&data_id);
        Ok(())
    }

    fn memory(&self) -> BackendMemory {
        let num_bytes = self
            .buffers
            .values()
            .map(|v| v.len() * v.dtype().size_in_bytes())
            .sum();
        BackendMemory {
            num_bytes,
            num_data_buffers: self.buffers.len(),
            unreliable: false,
        }
    }

    fn time(f: &mut dyn FnMut() -> Result<()>) -> Result<KernelTiming> {
        let start = Instant::now();
        f()?;
        Ok(KernelTiming {
            kernel_ms: start.elapsed().as_secs_f64() * 1e3,
        })
    }

    fn from_pixels(pixels: &PixelData, num_channels: usize) -> Result<Values> {
        if num_channels == 0 || num_channels > 4 {
            bail!("from_pixels supports 1 to 4 channels, got {}", num_channels);
        }
        let num_pixels = pixels.width * pixels.height;
        let mut out = Vec::with_capacity(num_pixels * num_channels);
        for p in 0..num_pixels {
            for c in 0..num_channels {
                out.push(i32::from(pixels.rgba[p * 4 + c]));
            }
        }
        Ok(Values::I32(out))
    }
}
