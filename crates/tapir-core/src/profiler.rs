use std::collections::HashMap;

use crate::backend::Backend;
use crate::bail;
use crate::engine::Engine;
use crate::error::Result;
use crate::tensor::Tensor;

// Profiler — timing and NaN screening around kernel execution
//
// In debug mode every kernel call is routed through `profile_kernel`,
// which times the forward closure with the backend timer, downloads each
// output, scans floating-point results for NaN, and prints a one-line
// kernel profile. This is a correctness tool, not a benchmark: the NaN
// scan forces a synchronous read of every output.

/// One kernel's entry in an engine profile, recorded while
/// [`Engine::profile`](crate::Engine::profile) is active.
#[derive(Debug, Clone)]
pub struct KernelProfile {
    pub name: String,
    /// Net bytes allocated by this kernel (may be negative).
    pub bytes_added: i64,
    pub total_bytes_snapshot: usize,
    /// Net tensors created by this kernel (may be negative).
    pub tensors_added: i64,
    pub total_tensors_snapshot: usize,
    pub input_shapes: HashMap<String, Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
}

/// Aggregate result of one [`Engine::profile`](crate::Engine::profile) run.
#[derive(Debug, Clone, Default)]
pub struct ProfileInfo {
    /// Net bytes allocated over the profiled region.
    pub new_bytes: i64,
    /// Net tensors created over the profiled region.
    pub new_tensors: i64,
    /// High-water byte mark observed while profiling.
    pub peak_bytes: usize,
    /// Per-kernel records in execution order.
    pub kernels: Vec<KernelProfile>,
}

/// Run a kernel under the backend timer, then NaN-check and log every
/// output. Fails with the kernel's name if a float output contains NaN.
pub(crate) fn profile_kernel<B, F>(
    engine: &mut Engine<B>,
    name: &str,
    forward: F,
) -> Result<Vec<Tensor>>
where
    B: Backend,
    F: FnOnce(&mut Engine<B>) -> Result<Vec<Tensor>>,
{
    let mut forward = Some(forward);
    let mut outcome: Option<Result<Vec<Tensor>>> = None;
    let timing = B::time(&mut || match forward.take() {
        Some(f) => {
            outcome = Some(f(&mut *engine));
            Ok(())
        }
        None => bail!("backend timer invoked the kernel closure more than once"),
    })?;
    let Some(outcome) = outcome else {
        bail!("backend timer never invoked the kernel closure");
    };
    let outputs = outcome?;

    for out in &outputs {
        let vals = engine.read_sync(out)?;
        vals.check_for_nan(name)?;
        log_kernel_profile(name, out, timing.kernel_ms);
    }
    Ok(outputs)
}

fn log_kernel_profile(name: &str, result: &Tensor, time_ms: f64) {
    let time = right_pad(&format!("{:.3}ms", time_ms), 9);
    let padded_name = right_pad(name, 25);
    let shape = right_pad(&format!("{}", result.shape()), 14);
    println!(
        "{}\t{}\t{}D {}\t{}",
        padded_name,
        time,
        result.rank(),
        shape,
        result.size()
    );
}

fn right_pad(s: &str, size: usize) -> String {
    if size <= s.len() {
        return s.to_string();
    }
    format!("{}{}", s, " ".repeat(size - s.len()))
}

/// Format bytes into a human-readable string (B, KB, MB, GB).
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
