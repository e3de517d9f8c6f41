use crate::shape::Shape;
use crate::tensor::DataId;

/// All errors that can occur within Tapir.
///
/// This enum captures every failure mode of the runtime: malformed shapes,
/// dtype problems, gradient-graph failures, and the engine's leak/NaN guards.
/// Using a single error type across the library simplifies error propagation.
///
/// Every variant is fatal to the operation that raised it; nothing here is
/// retried internally. Scope and counter bookkeeping is still completed on
/// the error path, so the engine remains usable after a failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., trying to add [2,3] + [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between a tensor and the values supplied for it.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Element count mismatch when creating a tensor from values.
    #[error("element count mismatch: shape {shape} requires {expected} values, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Coordinate rank does not match the tensor's rank.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// `gradients()` found no tape path from the inputs to the output.
    #[error(
        "cannot compute gradients: y is not a function of the provided xs — \
         make sure the function passed to gradients() encloses all operations \
         that lead from x to y"
    )]
    DisconnectedGradients,

    /// Backpropagation reached a tape node recorded without a gradient.
    #[error("cannot compute a gradient for operation '{op}': no gradient function was registered")]
    MissingGradient { op: String },

    /// A gradient function omitted a required input from its result map.
    #[error("gradient function of '{op}' returned no gradient for input '{input}'")]
    MissingInputGradient { op: String, input: String },

    /// A computed input-gradient does not match the input's shape.
    #[error(
        "gradient of '{op}' with respect to input '{input}' has shape {got}, \
         but the input has shape {expected}"
    )]
    GradientShapeMismatch {
        op: String,
        input: String,
        expected: Shape,
        got: Shape,
    },

    /// A custom gradient function returned the wrong number of gradients.
    #[error("custom gradient of '{op}' must return {expected} gradients (one per input), got {got}")]
    GradientCountMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    /// Debug mode found a NaN in a floating-point kernel output.
    #[error("the result of '{op}' has NaNs")]
    NanDetected { op: String },

    /// NaN written into a dtype that cannot represent it.
    #[error("NaN is not a valid value for dtype {dtype}")]
    NanConversion { dtype: crate::DType },

    /// A variable with this name is already registered.
    #[error("a variable named '{name}' is already registered")]
    DuplicateVariable { name: String },

    /// Safe mode forbids tracking or keeping tensors at the outermost scope.
    #[error(
        "safe mode is on: tensors must be created or kept inside a tidy() scope \
         so they can be reclaimed automatically"
    )]
    SafeModeLeak,

    /// The backend has no buffer registered under this id.
    #[error("no data buffer registered for {data_id}")]
    UnknownDataId { data_id: DataId },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Tapir.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
