use std::fmt;

// DType — Supported element data types
//
// Every tensor has a DType that determines its element size and numeric
// behavior:
//
//   F32  — 32-bit float, the default workhorse
//   I32  — signed 32-bit int, for indices and labels
//   Bool — stored as one byte per element (0 or 1)
//   C64  — complex number with f32 real and imaginary components
//
// C64 is special-cased in the engine's byte accounting: a complex tensor's
// components are tracked as separate buffers, so the composite buffer itself
// contributes no bytes to the counter.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
    Bool,
    C64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::Bool => 1,
            DType::C64 => 8,
        }
    }

    /// Whether this dtype carries floating-point components.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::C64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "float32",
            DType::I32 => "int32",
            DType::Bool => "bool",
            DType::C64 => "complex64",
        };
        write!(f, "{}", s)
    }
}

// Upcasting — result dtype of a mixed-dtype binary operation
//
// The lattice is bool < int32 < float32, with complex64 absorbing
// everything. These tables mirror classic numpy-style promotion.

/// The result dtype when combining two operand dtypes.
pub fn upcast_type(a: DType, b: DType) -> DType {
    use DType::*;
    match (a, b) {
        (C64, _) | (_, C64) => C64,
        (F32, _) | (_, F32) => F32,
        (I32, _) | (_, I32) => I32,
        (Bool, Bool) => Bool,
    }
}

/// The output dtype of a sum reduction: bool sums promote to int32.
pub fn sum_out_type(t: DType) -> DType {
    upcast_type(t, DType::I32)
}

/// Whether converting from `old` to `new` can lose information.
pub fn has_encoding_loss(old: DType, new: DType) -> bool {
    use DType::*;
    if new == C64 {
        return false;
    }
    if new == F32 && old != C64 {
        return false;
    }
    if new == I32 && old != F32 && old != C64 {
        return false;
    }
    if new == Bool && old == Bool {
        return false;
    }
    true
}
