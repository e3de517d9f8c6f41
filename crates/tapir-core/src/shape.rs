use std::fmt;

use crate::bail;
use crate::error::{Error, Result};

// Shape — N-dimensional shape representation
//
// A Shape describes the size of each dimension of a tensor:
//   - Scalar: Shape([])          — 0 dimensions, 1 element
//   - Vector: Shape([5])         — 1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      — 2 dimensions, 12 elements
//
// The shape determines how many elements the tensor holds (product of all
// dims, with the empty product being 1) and the row-major strides used to
// address elements in a flat buffer.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape (rank 0).
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Whether this is the scalar shape.
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Compute the contiguous (row-major) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1]: moving one step in
    /// dim 0 jumps 12 elements, one step in dim 2 jumps 1 element.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

/// Remove size-1 dimensions from a shape.
///
/// With `axes = None` every singleton dimension is dropped; with explicit
/// axes only those dimensions are dropped, and naming a non-singleton axis
/// is an error. Returns the squeezed dims together with the indices of the
/// kept dimensions.
pub fn squeeze_shape(dims: &[usize], axes: Option<&[usize]>) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut new_shape = Vec::new();
    let mut kept_dims = Vec::new();
    match axes {
        None => {
            for (i, &d) in dims.iter().enumerate() {
                if d != 1 {
                    new_shape.push(d);
                    kept_dims.push(i);
                }
            }
        }
        Some(axes) => {
            for &a in axes {
                if a >= dims.len() {
                    return Err(Error::DimOutOfRange {
                        dim: a,
                        rank: dims.len(),
                    });
                }
                if dims[a] != 1 {
                    bail!("cannot squeeze axis {} since its dim '{}' is not 1", a, dims[a]);
                }
            }
            for (i, &d) in dims.iter().enumerate() {
                if !axes.contains(&i) {
                    new_shape.push(d);
                    kept_dims.push(i);
                }
            }
        }
    }
    Ok((new_shape, kept_dims))
}

/// Resolve a shape specification that may contain a single `-1` wildcard.
///
/// The wildcard dimension is inferred so the resolved shape holds exactly
/// `size` elements. More than one `-1`, a negative dimension other than
/// `-1`, or a size that does not divide evenly are all errors.
pub fn infer_from_implicit_shape(shape_spec: &[i64], size: usize) -> Result<Vec<usize>> {
    let mut shape_prod: usize = 1;
    let mut implicit_idx: Option<usize> = None;

    for (i, &d) in shape_spec.iter().enumerate() {
        if d >= 0 {
            shape_prod *= d as usize;
        } else if d == -1 {
            if let Some(prev) = implicit_idx {
                bail!(
                    "shapes can only have one implicit size: found -1 at dim {} and dim {}",
                    prev,
                    i
                );
            }
            implicit_idx = Some(i);
        } else {
            bail!("shapes can not be < 0: found {} at dim {}", d, i);
        }
    }

    let Some(implicit_idx) = implicit_idx else {
        if size != shape_prod {
            bail!("size ({}) must match the product of shape {:?}", size, shape_spec);
        }
        return Ok(shape_spec.iter().map(|&d| d as usize).collect());
    };

    if shape_prod == 0 {
        bail!(
            "cannot infer the missing size in {:?} when there are 0 elements",
            shape_spec
        );
    }
    if size % shape_prod != 0 {
        bail!(
            "the implicit shape can't be a fractional number: got {} / {}",
            size,
            shape_prod
        );
    }

    let mut resolved: Vec<usize> = shape_spec.iter().map(|&d| d.max(0) as usize).collect();
    resolved[implicit_idx] = size / shape_prod;
    Ok(resolved)
}
