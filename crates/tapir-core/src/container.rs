use std::collections::{HashMap, HashSet};

use crate::tensor::{Tensor, TensorId};

// TensorContainer — traversal of scope results
//
// endScope must discover every tensor reachable from a scope's result so
// it can exempt them from disposal. Results come in a closed set of
// shapes — a single tensor, an ordered list, a keyed mapping, or nesting
// thereof — modeled as a tagged variant rather than duck typing. The walk
// deduplicates by tensor identity.

/// A result value containing zero or more tensors.
#[derive(Debug, Clone)]
pub enum TensorContainer {
    Tensor(Tensor),
    List(Vec<TensorContainer>),
    Map(HashMap<String, TensorContainer>),
}

impl TensorContainer {
    /// Every distinct tensor reachable in this container, in first-visit
    /// order. Duplicate handles (by tensor id) appear once.
    pub fn collect_tensors(&self) -> Vec<Tensor> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.walk(&mut visited, &mut out);
        out
    }

    fn walk(&self, visited: &mut HashSet<TensorId>, out: &mut Vec<Tensor>) {
        match self {
            TensorContainer::Tensor(t) => {
                if visited.insert(t.id()) {
                    out.push(t.clone());
                }
            }
            TensorContainer::List(items) => {
                for item in items {
                    item.walk(visited, out);
                }
            }
            TensorContainer::Map(entries) => {
                for item in entries.values() {
                    item.walk(visited, out);
                }
            }
        }
    }
}

/// Conversion from the result types `tidy` accepts into a container.
///
/// Returning `None` means the result holds no tensors (e.g., `()`), so
/// the closing scope keeps nothing beyond the global keep-set.
pub trait AsTensorContainer {
    fn as_container(&self) -> Option<TensorContainer>;
}

impl AsTensorContainer for Tensor {
    fn as_container(&self) -> Option<TensorContainer> {
        Some(TensorContainer::Tensor(self.clone()))
    }
}

impl AsTensorContainer for Option<Tensor> {
    fn as_container(&self) -> Option<TensorContainer> {
        self.as_ref().map(|t| TensorContainer::Tensor(t.clone()))
    }
}

impl AsTensorContainer for Vec<Tensor> {
    fn as_container(&self) -> Option<TensorContainer> {
        Some(TensorContainer::List(
            self.iter()
                .map(|t| TensorContainer::Tensor(t.clone()))
                .collect(),
        ))
    }
}

impl AsTensorContainer for HashMap<String, Tensor> {
    fn as_container(&self) -> Option<TensorContainer> {
        Some(TensorContainer::Map(
            self.iter()
                .map(|(k, t)| (k.clone(), TensorContainer::Tensor(t.clone())))
                .collect(),
        ))
    }
}

impl AsTensorContainer for (Tensor, Tensor) {
    fn as_container(&self) -> Option<TensorContainer> {
        Some(TensorContainer::List(vec![
            TensorContainer::Tensor(self.0.clone()),
            TensorContainer::Tensor(self.1.clone()),
        ]))
    }
}

impl AsTensorContainer for (Tensor, Tensor, Tensor) {
    fn as_container(&self) -> Option<TensorContainer> {
        Some(TensorContainer::List(vec![
            TensorContainer::Tensor(self.0.clone()),
            TensorContainer::Tensor(self.1.clone()),
            TensorContainer::Tensor(self.2.clone()),
        ]))
    }
}

impl AsTensorContainer for () {
    fn as_container(&self) -> Option<TensorContainer> {
        None
    }
}

impl AsTensorContainer for TensorContainer {
    fn as_container(&self) -> Option<TensorContainer> {
        Some(self.clone())
    }
}
