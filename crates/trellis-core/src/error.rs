use crate::shape::Dims;

/// All errors that can occur within trellis.
///
/// Criterion errors are unrecoverable at the node layer: they signal a
/// malformed graph or a misuse by the caller, never a transient fault, so
/// they propagate straight to the graph executor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Arity mismatch, zero-element operand, or incompatible operand shapes.
    /// Raised while validating a node.
    #[error("{op}: {msg}")]
    Shape { op: String, msg: String },

    /// Two operands were required to have identical shapes.
    #[error("{op}: operand dimensions do not match: {left} vs {right}")]
    DimsMismatch { op: String, left: Dims, right: Dims },

    /// A gradient was requested for an input that has no derivative.
    #[error("{op}: input {index} has no defined gradient")]
    InvalidGradientTarget { op: String, index: usize },

    /// An input expected to be a label/feature leaf is something else.
    #[error("{op}: {msg}")]
    StructuralPrecondition { op: String, msg: String },

    /// A forward output was NaN or infinite (only raised when checking is on).
    #[error("{op}: non-finite output {value}")]
    NumericAnomaly { op: String, value: f64 },

    /// Validate/evaluate/gradient was called before inputs were attached.
    #[error("{op}: inputs are not attached")]
    NotAttached { op: String },

    /// Inconsistent data detected while running a node.
    #[error("{0}")]
    Logic(String),

    /// Malformed configuration.
    #[error("config: {0}")]
    Config(String),

    /// Persistence failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a logic error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Logic(s.into())
    }

    /// Create a shape error for operation `op`.
    pub fn shape(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Shape {
            op: op.into(),
            msg: msg.into(),
        }
    }
}

/// Convenience Result type used throughout trellis.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted logic error.
/// Usage: `bail!("class of word {} is empty", word)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Logic(format!($($arg)*)))
    };
}
