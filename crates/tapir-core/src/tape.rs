use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorId};

// Tape — the recorded computation graph
//
// During gradient-mode execution the engine appends one TapeNode per
// outermost kernel call. Backpropagation then:
//
//   1. Filters the tape down to the nodes that actually connect the
//      requested inputs (xs) to the output (y). A node survives only if
//      it is reachable FROM some x walking forward AND it LEADS TO y
//      walking backward. Surviving nodes also have their input maps
//      pruned to the x-reachable entries, so irrelevant branches are
//      never differentiated and need no gradient support.
//
//   2. Walks the filtered tape in reverse, maintaining a map from tensor
//      id to accumulated gradient. Each node's gradient closure receives
//      the output gradients (zero-filled where an output never fed the
//      tracked path) and answers with one lazy producer per pruned input.
//
// ACCUMULATION: a tensor consumed by several operations receives the SUM
// of the contributions (multivariate chain rule). The previous
// accumulator tensor is disposed once it has been folded into the sum.

/// A lazy producer for one input's gradient. Producers run only for the
/// inputs that survive pruning, so unneeded gradients are never computed.
pub type InputGradientFn<B> = Box<dyn FnOnce(&mut Engine<B>) -> Result<Tensor>>;

/// The gradient closure of one tape node: output gradients (in output
/// order) to a map from input role to lazy gradient producer.
pub type NodeGradient<B> =
    Arc<dyn Fn(&mut Engine<B>, &[Tensor]) -> Result<HashMap<String, InputGradientFn<B>>>>;

/// A record of one executed operation.
pub struct TapeNode<B: Backend> {
    /// Node id, from the engine's tape-node counter (distinct from the
    /// tensor id namespace).
    pub id: usize,
    /// Operation name, used in error messages and kernel profiles.
    pub name: String,
    /// Input tensors by role.
    pub inputs: HashMap<String, Tensor>,
    /// Output tensors in production order.
    pub outputs: Vec<Tensor>,
    /// Gradient closure; absent for ops recorded without a backward pass.
    pub gradient: Option<NodeGradient<B>>,
}

impl<B: Backend> Clone for TapeNode<B> {
    fn clone(&self) -> Self {
        TapeNode {
            id: self.id,
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            gradient: self.gradient.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for TapeNode<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("has_gradient", &self.gradient.is_some())
            .finish()
    }
}

/// Filter a tape down to the nodes connecting `xs` to `y`, with each
/// surviving node's inputs pruned to the x-reachable ones.
pub(crate) fn filter_nodes_for_backprop<B: Backend>(
    nodes: &[TapeNode<B>],
    xs: &[Tensor],
    y: &Tensor,
) -> Vec<TapeNode<B>> {
    // Forward pass: mark tensors and nodes reachable from any x.
    let mut from_x: HashSet<TensorId> = xs.iter().map(|t| t.id()).collect();
    let mut node_from_x = vec![false; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        if node.inputs.values().any(|t| from_x.contains(&t.id())) {
            node_from_x[i] = true;
            for out in &node.outputs {
                from_x.insert(out.id());
            }
        }
    }

    // Backward pass: mark tensors and nodes that lead to y.
    let mut leads_to_y: HashSet<TensorId> = HashSet::new();
    leads_to_y.insert(y.id());
    let mut node_to_y = vec![false; nodes.len()];
    for (i, node) in nodes.iter().enumerate().rev() {
        if node.outputs.iter().any(|t| leads_to_y.contains(&t.id())) {
            node_to_y[i] = true;
            for input in node.inputs.values() {
                leads_to_y.insert(input.id());
            }
        }
    }

    nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| node_from_x[*i] && node_to_y[*i])
        .map(|(_, node)| {
            let pruned: HashMap<String, Tensor> = node
                .inputs
                .iter()
                .filter(|(_, t)| from_x.contains(&t.id()))
                .map(|(role, t)| (role.clone(), t.clone()))
                .collect();
            TapeNode {
                id: node.id,
                name: node.name.clone(),
                inputs: pruned,
                outputs: node.outputs.clone(),
                gradient: node.gradient.clone(),
            }
        })
        .collect()
}

/// Walk a filtered tape in reverse, accumulating gradients by tensor id.
///
/// `accumulated` arrives seeded with `{y.id: dy}` and leaves holding the
/// gradient of every tensor on the filtered path, `xs` included.
pub(crate) fn backpropagate<B: Backend>(
    engine: &mut Engine<B>,
    accumulated: &mut HashMap<TensorId, Tensor>,
    filtered: &[TapeNode<B>],
) -> Result<()> {
    for node in filtered.iter().rev() {
        // Output gradients in output order; an output that never fed the
        // tracked path contributes zeros of its own shape and dtype.
        let mut dys = Vec::with_capacity(node.outputs.len());
        for out in &node.outputs {
            match accumulated.get(&out.id()) {
                Some(g) => dys.push(g.clone()),
                None => dys.push(crate::ops::zeros(engine, out.shape().clone(), out.dtype())?),
            }
        }

        let grad_fn = node
            .gradient
            .clone()
            .ok_or_else(|| Error::MissingGradient {
                op: node.name.clone(),
            })?;
        let mut input_grads = grad_fn(engine, &dys)?;

        for (role, input) in &node.inputs {
            let lazy = input_grads
                .remove(role)
                .ok_or_else(|| Error::MissingInputGradient {
                    op: node.name.clone(),
                    input: role.clone(),
                })?;
            let grad = lazy(engine)?;
            if grad.shape() != input.shape() {
                return Err(Error::GradientShapeMismatch {
                    op: node.name.clone(),
                    input: role.clone(),
                    expected: input.shape().clone(),
                    got: grad.shape().clone(),
                });
            }
            match accumulated.remove(&input.id()) {
                None => {
                    accumulated.insert(input.id(), grad);
                }
                Some(prev) => {
                    let sum = crate::ops::add(engine, &prev, &grad)?;
                    engine.dispose_tensor(&prev)?;
                    accumulated.insert(input.id(), sum);
                }
            }
        }
    }
    Ok(())
}
