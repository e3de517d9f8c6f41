use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::backend::{Backend, BackendMemory};
use crate::bail;
use crate::container::{AsTensorContainer, TensorContainer};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::profiler::{self, KernelProfile, ProfileInfo};
use crate::shape::Shape;
use crate::tape::{self, InputGradientFn, NodeGradient, TapeNode};
use crate::tensor::{DataId, Tensor, TensorId};
use crate::values::Values;

// Engine — tensor tracking, scoped disposal, and the gradient tape
//
// The engine owns every piece of shared mutable state in the runtime:
//
//   - the reference-count table mapping each data buffer to the number of
//     live tensors pointing at it, plus the tensor/buffer/byte counters
//   - the scope stack: nested tracking regions whose tensors are disposed
//     on exit unless kept, returned, or still needed by an active tape
//   - the active tape, recorded while at least one gradient scope is open
//     and replayed backward by gradients()
//   - the keep-set and the named variable registry, both exempt from
//     scope-driven disposal
//
// Nothing here is a global: ids, counters, and registries are instance
// fields, and every op receives the engine handle explicitly. Execution
// is single-threaded and synchronous; scopes and the custom-gradient
// depth follow a strict stack discipline.

/// Engine construction options. Safe mode forces all tensor creation into
/// tidy() scopes so nothing can leak at the top level; debug mode routes
/// kernels through the profiler and NaN-checks every float output.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub safe_mode: bool,
    pub debug_mode: bool,
}

impl EngineConfig {
    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }
}

/// Combined memory report: engine counters plus the backend's snapshot.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// Live registered tensors.
    pub num_tensors: usize,
    /// Live data buffers (ref-count > 0).
    pub num_data_buffers: usize,
    /// Bytes across live buffers. Complex64 buffers are excluded — their
    /// component tensors are counted separately.
    pub num_bytes: usize,
    /// The backend's own view of its memory.
    pub backend: BackendMemory,
}

/// One entry of the scope stack: a named list of the tensors created
/// while this scope was active.
#[derive(Debug, Default)]
struct ScopeState {
    name: String,
    track: Vec<Tensor>,
}

impl ScopeState {
    fn new(name: impl Into<String>) -> Self {
        ScopeState {
            name: name.into(),
            track: Vec::new(),
        }
    }
}

const DEFAULT_SCOPE: &str = "default scope";

/// Collects the tensors a kernel's forward closure wants preserved for
/// its backward closure.
#[derive(Debug, Default)]
pub struct SavedTensors {
    saved: Vec<Tensor>,
}

impl SavedTensors {
    /// Stash a tensor for the backward pass.
    pub fn save(&mut self, t: &Tensor) {
        self.saved.push(t.clone());
    }

    fn into_inner(self) -> Vec<Tensor> {
        self.saved
    }
}

/// A kernel's backward closure: `(engine, output_gradients, saved)` to a
/// map from input role to lazy gradient producer.
pub type KernelBackward<B> =
    Box<dyn Fn(&mut Engine<B>, &[Tensor], &[Tensor]) -> Result<HashMap<String, InputGradientFn<B>>>>;

/// The result of [`Engine::gradients`]: the forward value and one
/// gradient per requested input (None where the input is disconnected).
#[derive(Debug)]
pub struct ValueAndGrads {
    pub value: Tensor,
    pub grads: Vec<Option<Tensor>>,
}

impl AsTensorContainer for ValueAndGrads {
    fn as_container(&self) -> Option<TensorContainer> {
        let mut items = vec![TensorContainer::Tensor(self.value.clone())];
        for grad in self.grads.iter().flatten() {
            items.push(TensorContainer::Tensor(grad.clone()));
        }
        Some(TensorContainer::List(items))
    }
}

/// What a custom-gradient function hands back: the composite value and
/// the closure producing one gradient per input from the output gradient.
pub struct CustomGradResult<B: Backend> {
    pub value: Tensor,
    pub grad_func: Box<dyn Fn(&mut Engine<B>, &Tensor) -> Result<Vec<Tensor>>>,
}

/// The tensor-computation engine. See the module docs for the ownership
/// model; construct one per runtime with [`Engine::new`].
#[derive(Debug)]
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,

    ref_counter: HashMap<DataId, usize>,
    live_tensors: HashSet<TensorId>,
    registered_variables: HashMap<String, Tensor>,
    keep_tensors: HashSet<TensorId>,

    scope_stack: Vec<ScopeState>,
    active_tape: Option<Vec<TapeNode<B>>>,
    gradient_scope_count: usize,
    custom_gradient_depth: usize,

    next_tensor_id: u64,
    next_data_id: u64,
    next_tape_node_id: usize,

    num_bytes: usize,
    num_tensors: usize,
    num_data_buffers: usize,

    profiling: bool,
    active_profile: ProfileInfo,
}

impl<B: Backend> Engine<B> {
    /// Create an engine with default configuration (safe mode and debug
    /// mode both off).
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        Engine {
            backend,
            config,
            ref_counter: HashMap::new(),
            live_tensors: HashSet::new(),
            registered_variables: HashMap::new(),
            keep_tensors: HashSet::new(),
            scope_stack: vec![ScopeState::new(DEFAULT_SCOPE)],
            active_tape: None,
            gradient_scope_count: 0,
            custom_gradient_depth: 0,
            next_tensor_id: 0,
            next_data_id: 0,
            next_tape_node_id: 0,
            num_bytes: 0,
            num_tensors: 0,
            num_data_buffers: 0,
            profiling: false,
            active_profile: ProfileInfo::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // Tensor creation and registration

    fn fresh_tensor_id(&mut self) -> TensorId {
        let id = TensorId(self.next_tensor_id);
        self.next_tensor_id += 1;
        id
    }

    fn fresh_data_id(&mut self) -> DataId {
        let id = DataId(self.next_data_id);
        self.next_data_id += 1;
        id
    }

    /// Create a tensor over a fresh buffer, optionally seeded with values.
    /// The tensor is registered and tracked in the active scope.
    pub fn make_tensor(
        &mut self,
        shape: impl Into<Shape>,
        dtype: DType,
        values: Option<Values>,
    ) -> Result<Tensor> {
        let shape = shape.into();
        if let Some(v) = &values {
            if v.len() != shape.elem_count() {
                return Err(Error::ElementCountMismatch {
                    expected: shape.elem_count(),
                    got: v.len(),
                    shape,
                });
            }
            if v.dtype() != dtype {
                return Err(Error::DTypeMismatch {
                    expected: dtype,
                    got: v.dtype(),
                });
            }
        }
        let tensor = Tensor::new(self.fresh_tensor_id(), self.fresh_data_id(), shape, dtype);
        self.register(&tensor, false)?;
        if let Some(values) = values {
            self.write(&tensor, values)?;
        }
        Ok(tensor)
    }

    /// Create a tensor sharing an existing buffer under a new shape (the
    /// reshape primitive). Bumps the buffer's reference count.
    pub fn make_view(&mut self, source: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elem_count() != source.size() {
            return Err(Error::ElementCountMismatch {
                expected: source.size(),
                got: shape.elem_count(),
                shape,
            });
        }
        let tensor = Tensor::new(
            self.fresh_tensor_id(),
            source.data_id(),
            shape,
            source.dtype(),
        );
        self.register(&tensor, false)?;
        Ok(tensor)
    }

    /// Create a named variable: registered like any tensor but tracked in
    /// the variable registry instead of any scope, so it survives until
    /// explicitly disposed. Fails if the name is taken.
    pub fn make_variable(
        &mut self,
        name: &str,
        shape: impl Into<Shape>,
        dtype: DType,
        values: Option<Values>,
    ) -> Result<Tensor> {
        if self.registered_variables.contains_key(name) {
            return Err(Error::DuplicateVariable {
                name: name.to_string(),
            });
        }
        let shape = shape.into();
        let tensor = Tensor::new(self.fresh_tensor_id(), self.fresh_data_id(), shape, dtype);
        self.register(&tensor, true)?;
        if let Some(values) = values {
            self.write(&tensor, values)?;
        }
        self.registered_variables
            .insert(name.to_string(), tensor.clone());
        Ok(tensor)
    }

    /// Register an existing tensor handle under a variable name.
    pub fn register_variable(&mut self, name: &str, t: &Tensor) -> Result<()> {
        if self.registered_variables.contains_key(name) {
            return Err(Error::DuplicateVariable {
                name: name.to_string(),
            });
        }
        self.registered_variables
            .insert(name.to_string(), t.clone());
        Ok(())
    }

    /// Look up a registered variable by name.
    pub fn variable(&self, name: &str) -> Option<&Tensor> {
        self.registered_variables.get(name)
    }

    fn register(&mut self, t: &Tensor, variable: bool) -> Result<()> {
        // The leak guard fires before any bookkeeping so a failed
        // registration leaves the counters untouched.
        if !variable && self.config.safe_mode && self.scope_stack.len() == 1 {
            return Err(Error::SafeModeLeak);
        }
        let count = self.ref_counter.get(&t.data_id()).copied().unwrap_or(0);
        self.num_tensors += 1;
        if count == 0 {
            self.num_data_buffers += 1;
            if t.dtype() != DType::C64 {
                self.num_bytes += t.size() * t.dtype().size_in_bytes();
            }
            self.backend.register(t.data_id(), t.shape(), t.dtype())?;
        }
        self.ref_counter.insert(t.data_id(), count + 1);
        self.live_tensors.insert(t.id());
        if self.profiling {
            self.active_profile.peak_bytes = self.active_profile.peak_bytes.max(self.num_bytes);
        }
        if !variable {
            self.track_in_active_scope(t);
        }
        Ok(())
    }

    fn track_in_active_scope(&mut self, t: &Tensor) {
        if self.scope_stack.is_empty() {
            self.scope_stack.push(ScopeState::new(DEFAULT_SCOPE));
        }
        let last = self.scope_stack.len() - 1;
        self.scope_stack[last].track.push(t.clone());
    }

    /// Dispose a tensor: decrement its buffer's reference count and, at
    /// zero, release the buffer and the byte/tensor accounting. Disposing
    /// an already-disposed handle is a no-op.
    pub fn dispose_tensor(&mut self, t: &Tensor) -> Result<()> {
        if !self.live_tensors.remove(&t.id()) {
            return Ok(());
        }
        self.num_tensors -= 1;
        let count = self.ref_counter.get(&t.data_id()).copied().unwrap_or(0);
        if count <= 1 {
            self.ref_counter.remove(&t.data_id());
            self.num_data_buffers -= 1;
            if t.dtype() != DType::C64 {
                self.num_bytes -= t.size() * t.dtype().size_in_bytes();
            }
            self.backend.dispose_data(t.data_id())?;
        } else {
            self.ref_counter.insert(t.data_id(), count - 1);
        }
        Ok(())
    }

    /// Dispose every registered variable and clear the registry.
    pub fn dispose_variables(&mut self) -> Result<()> {
        let variables: Vec<Tensor> = self.registered_variables.drain().map(|(_, t)| t).collect();
        for t in variables {
            self.dispose_tensor(&t)?;
        }
        Ok(())
    }

    /// Whether a tensor handle has not been disposed.
    pub fn is_live(&self, t: &Tensor) -> bool {
        self.live_tensors.contains(&t.id())
    }

    /// Current reference count of a buffer (0 once released).
    pub fn ref_count(&self, data_id: DataId) -> usize {
        self.ref_counter.get(&data_id).copied().unwrap_or(0)
    }

    /// Pin a tensor against scope-exit disposal for the life of the
    /// engine. In safe mode, keeping at the outermost scope is an error:
    /// wrap the computation in tidy() instead.
    pub fn keep(&mut self, t: &Tensor) -> Result<()> {
        if self.config.safe_mode && self.scope_stack.len() == 1 {
            return Err(Error::SafeModeLeak);
        }
        self.keep_tensors.insert(t.id());
        Ok(())
    }

    // Reads and writes (the tracker surface tensors construct through)

    /// Overwrite a tensor's buffer with new values.
    pub fn write(&mut self, t: &Tensor, values: Values) -> Result<()> {
        if values.len() != t.size() {
            return Err(Error::ElementCountMismatch {
                shape: t.shape().clone(),
                expected: t.size(),
                got: values.len(),
            });
        }
        if values.dtype() != t.dtype() {
            return Err(Error::DTypeMismatch {
                expected: t.dtype(),
                got: values.dtype(),
            });
        }
        self.backend.write(t.data_id(), values)
    }

    /// Read a tensor's values. This runtime is synchronous, so `read` and
    /// [`read_sync`](Engine::read_sync) are the same operation.
    pub fn read(&self, t: &Tensor) -> Result<Values> {
        self.backend.read(t.data_id())
    }

    pub fn read_sync(&self, t: &Tensor) -> Result<Values> {
        self.backend.read(t.data_id())
    }

    /// Aggregate the engine's counters with the backend's memory snapshot.
    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            num_tensors: self.num_tensors,
            num_data_buffers: self.num_data_buffers,
            num_bytes: self.num_bytes,
            backend: self.backend.memory(),
        }
    }

    // Scope management

    /// Depth of the scope stack (1 = only the default scope).
    pub fn scope_depth(&self) -> usize {
        self.scope_stack.len()
    }

    /// Whether a gradient tape is currently recording.
    pub fn is_tape_active(&self) -> bool {
        self.active_tape.is_some()
    }

    /// Number of nodes on the active tape (0 when no tape is open).
    pub fn tape_len(&self) -> usize {
        self.active_tape.as_ref().map_or(0, |t| t.len())
    }

    /// Push a new tracking scope. When `gradient_mode` is set and this is
    /// the outermost gradient scope, a fresh tape starts recording.
    pub fn start_scope(&mut self, name: Option<&str>, gradient_mode: bool) {
        if gradient_mode {
            if self.gradient_scope_count == 0 {
                self.active_tape = Some(Vec::new());
            }
            self.gradient_scope_count += 1;
        }
        let name = name.unwrap_or("unnamed scope");
        self.scope_stack.push(ScopeState::new(name));
    }

    /// Close the active scope. Tensors tracked by it are disposed unless
    /// they are globally kept or reachable from `result`; while a tape is
    /// still recording they are promoted to the parent scope instead,
    /// since backprop may still need them.
    pub fn end_scope(
        &mut self,
        result: Option<&TensorContainer>,
        gradient_mode: bool,
    ) -> Result<()> {
        if gradient_mode {
            self.gradient_scope_count = self.gradient_scope_count.saturating_sub(1);
            if self.gradient_scope_count == 0 {
                self.active_tape = None;
            }
        }

        let mut tensors_to_keep: HashSet<TensorId> = self.keep_tensors.clone();
        if let Some(container) = result {
            for t in container.collect_tensors() {
                tensors_to_keep.insert(t.id());
            }
        }

        let Some(closing) = self.scope_stack.pop() else {
            return Ok(());
        };
        if self.scope_stack.is_empty() {
            self.scope_stack.push(ScopeState::new(DEFAULT_SCOPE));
        }

        let mut track_in_parent = Vec::new();
        for t in closing.track {
            if tensors_to_keep.contains(&t.id()) {
                continue;
            }
            if self.active_tape.is_some() {
                track_in_parent.push(t);
            } else {
                self.dispose_tensor(&t)?;
            }
        }

        // Promotion bypasses the safe-mode guard: these tensors were
        // created legally inside the closing scope and the tape still
        // needs them.
        for t in track_in_parent {
            if !self.keep_tensors.contains(&t.id()) {
                self.track_in_active_scope(&t);
            }
        }
        Ok(())
    }

    /// Run `f` inside a fresh scope, dispose everything it created except
    /// the returned tensors, and hand the result back.
    pub fn tidy<T, F>(&mut self, name: Option<&str>, f: F) -> Result<T>
    where
        T: AsTensorContainer,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.scoped_run(name, false, f)
    }

    /// The two-phase scope primitive behind tidy(): start the scope, run
    /// the body, and close the scope exactly once whether the body
    /// succeeds or fails. A body error propagates only after the scope
    /// has been cleaned up, so the stack stays balanced on every path.
    pub(crate) fn scoped_run<T, F>(
        &mut self,
        name: Option<&str>,
        gradient_mode: bool,
        f: F,
    ) -> Result<T>
    where
        T: AsTensorContainer,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.start_scope(name, gradient_mode);
        let result = f(self);
        let container = match &result {
            Ok(value) => value.as_container(),
            Err(_) => None,
        };
        let cleanup = self.end_scope(container.as_ref(), gradient_mode);
        let value = result?;
        cleanup?;
        Ok(value)
    }

    // Kernel execution

    /// Execute a kernel's forward closure and, when a tape is recording
    /// and this is not an internal call of a composite op, append a tape
    /// node capturing the inputs, outputs, and backward closure.
    ///
    /// In debug mode the call runs under the profiler (timing plus a
    /// synchronous NaN check of every output). When profiling is active a
    /// kernel record with byte/tensor deltas and shapes is appended.
    pub fn run_kernel<F>(
        &mut self,
        name: &str,
        inputs: HashMap<String, Tensor>,
        forward: F,
        backward: Option<KernelBackward<B>>,
    ) -> Result<Vec<Tensor>>
    where
        F: FnOnce(&mut Self, &mut SavedTensors) -> Result<Vec<Tensor>>,
    {
        let bytes_before = self.num_bytes as i64;
        let tensors_before = self.num_tensors as i64;
        let input_shapes: Option<HashMap<String, Vec<usize>>> = self.profiling.then(|| {
            inputs
                .iter()
                .map(|(role, t)| (role.clone(), t.dims().to_vec()))
                .collect()
        });

        let mut saved = SavedTensors::default();
        self.custom_gradient_depth += 1;
        let result = if self.config.debug_mode {
            profiler::profile_kernel(self, name, |engine| forward(engine, &mut saved))
        } else {
            forward(self, &mut saved)
        };
        // The depth must come back down on the error path too, or a failed
        // kernel would suppress tape recording forever after.
        self.custom_gradient_depth -= 1;
        let outputs = result?;

        if self.is_tape_active() && self.custom_gradient_depth == 0 {
            self.record_tape_node(name, inputs, &outputs, backward, saved.into_inner());
        }

        if let Some(input_shapes) = input_shapes {
            let profile = KernelProfile {
                name: name.to_string(),
                bytes_added: self.num_bytes as i64 - bytes_before,
                total_bytes_snapshot: self.num_bytes,
                tensors_added: self.num_tensors as i64 - tensors_before,
                total_tensors_snapshot: self.num_tensors,
                input_shapes,
                output_shapes: outputs.iter().map(|t| t.dims().to_vec()).collect(),
            };
            self.active_profile.kernels.push(profile);
        }
        Ok(outputs)
    }

    fn record_tape_node(
        &mut self,
        name: &str,
        inputs: HashMap<String, Tensor>,
        outputs: &[Tensor],
        backward: Option<KernelBackward<B>>,
        saved: Vec<Tensor>,
    ) {
        let gradient: Option<NodeGradient<B>> = backward.map(|bw| {
            Arc::new(move |engine: &mut Engine<B>, dys: &[Tensor]| bw(engine, dys, &saved))
                as NodeGradient<B>
        });
        let id = self.next_tape_node_id;
        self.next_tape_node_id += 1;
        let node = TapeNode {
            id,
            name: name.to_string(),
            inputs,
            outputs: outputs.to_vec(),
            gradient,
        };
        if let Some(tape) = self.active_tape.as_mut() {
            tape.push(node);
        }
    }

    // Gradients

    /// Compute the gradients of `f`'s output with respect to `xs`.
    ///
    /// Runs `f` under a gradient-mode tidy, filters the recorded tape to
    /// the nodes connecting `xs` to the output, and replays it backward.
    /// `dy` seeds the accumulation (defaults to ones shaped like the
    /// output). With `allow_no_gradients` unset, a graph with no path
    /// from `xs` to the output is an error.
    pub fn gradients<F>(
        &mut self,
        f: F,
        xs: &[Tensor],
        dy: Option<Tensor>,
        allow_no_gradients: bool,
    ) -> Result<ValueAndGrads>
    where
        F: FnOnce(&mut Self) -> Result<Tensor>,
    {
        if xs.is_empty() {
            bail!("gradients() expects at least one tensor in xs");
        }
        self.scoped_run(Some("gradients"), true, |engine| {
            let y = f(engine)?;
            if let Some(dy) = &dy {
                if dy.shape() != y.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: y.shape().clone(),
                        got: dy.shape().clone(),
                    });
                }
            }

            let filtered = match engine.active_tape.as_ref() {
                Some(nodes) => tape::filter_nodes_for_backprop(nodes, xs, &y),
                None => Vec::new(),
            };
            if !allow_no_gradients && filtered.is_empty() {
                return Err(Error::DisconnectedGradients);
            }

            let seed = match dy {
                Some(dy) => dy,
                None => crate::ops::ones(engine, y.shape().clone(), y.dtype())?,
            };
            let mut accumulated: HashMap<TensorId, Tensor> = HashMap::new();
            accumulated.insert(y.id(), seed);
            tape::backpropagate(engine, &mut accumulated, &filtered)?;

            let grads = xs
                .iter()
                .map(|x| accumulated.get(&x.id()).cloned())
                .collect();
            Ok(ValueAndGrads { value: y, grads })
        })
    }

    /// Run a composite op with a user-supplied gradient.
    ///
    /// The operations `f` performs internally are not individually
    /// recorded (the custom-gradient depth suppresses them); the
    /// composite as a whole records one tape node whose gradient
    /// delegates to the returned `grad_func`, which must produce exactly
    /// one gradient per input.
    pub fn custom_grad<F>(&mut self, name: &str, inputs: &[Tensor], f: F) -> Result<Tensor>
    where
        F: FnOnce(&mut Self, &[Tensor]) -> Result<CustomGradResult<B>>,
    {
        if inputs.is_empty() {
            bail!("custom_grad() expects at least one input tensor");
        }
        self.custom_gradient_depth += 1;
        let result = f(self, inputs);
        self.custom_gradient_depth -= 1;
        let CustomGradResult { value, grad_func } = result?;

        if self.is_tape_active() && self.custom_gradient_depth == 0 {
            let named: HashMap<String, Tensor> = inputs
                .iter()
                .enumerate()
                .map(|(i, t)| (i.to_string(), t.clone()))
                .collect();
            let num_inputs = inputs.len();
            let op_name = name.to_string();
            let gradient: NodeGradient<B> = Arc::new(move |engine: &mut Engine<B>, dys: &[Tensor]| {
                let dy = dys
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::msg("composite op received no output gradient"))?;
                let grads = grad_func(engine, &dy)?;
                if grads.len() != num_inputs {
                    return Err(Error::GradientCountMismatch {
                        op: op_name.clone(),
                        expected: num_inputs,
                        got: grads.len(),
                    });
                }
                Ok(grads
                    .into_iter()
                    .enumerate()
                    .map(|(i, g)| {
                        let lazy: InputGradientFn<B> = Box::new(move |_| Ok(g));
                        (i.to_string(), lazy)
                    })
                    .collect())
            });
            let id = self.next_tape_node_id;
            self.next_tape_node_id += 1;
            let node = TapeNode {
                id,
                name: name.to_string(),
                inputs: named,
                outputs: vec![value.clone()],
                gradient: Some(gradient),
            };
            if let Some(tape) = self.active_tape.as_mut() {
                tape.push(node);
            }
        }
        Ok(value)
    }

    // Profiling

    /// Record per-kernel memory/shape profiles while running `f`.
    pub fn profile<T, F>(&mut self, f: F) -> Result<(T, ProfileInfo)>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let start_bytes = self.num_bytes as i64;
        let start_tensors = self.num_tensors as i64;
        self.active_profile = ProfileInfo {
            peak_bytes: self.num_bytes,
            ..ProfileInfo::default()
        };
        self.profiling = true;
        let result = f(self);
        self.profiling = false;
        let value = result?;
        let mut info = std::mem::take(&mut self.active_profile);
        info.new_bytes = self.num_bytes as i64 - start_bytes;
        info.new_tensors = self.num_tensors as i64 - start_tensors;
        Ok((value, info))
    }
}
