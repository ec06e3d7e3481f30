use crate::shape::Shape;

/// All errors that can occur within tern.
///
/// One enum across the workspace keeps propagation cheap: every fallible
/// operation returns `Result<T>` and the engine never unwinds. Variants carry
/// enough context that a caller can distinguish outcomes without consulting a
/// log side channel (a malformed chain is never reported as "size 0").
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g. dense input vs configured width).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Element count mismatch when binding or copying flat data.
    #[error("element count mismatch: expected {expected}, got {got}")]
    ElementCountMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in one operation.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// The layer chain exceeds the hard iteration ceiling.
    #[error("layer chain exceeds the {limit}-layer ceiling")]
    ChainTooLong { limit: usize },

    /// Training was requested on a model with no attached loss.
    #[error("model has no loss attached")]
    MissingLoss,

    /// A layer that participates in training lacks a backward hook.
    #[error("layer '{layer}' has no backward pass")]
    MissingBackward { layer: &'static str },

    /// A planner or engine entry point ran before `Model::compile`.
    #[error("model is not compiled; call compile() first")]
    NotCompiled,

    /// The requested batch size is not a multiple of the input micro-batch.
    #[error("batch size {batch_size} is not a multiple of the input slice size {slice_size}")]
    BatchSizeMismatch { batch_size: usize, slice_size: usize },

    /// A caller-supplied memory block is smaller than the planned size.
    #[error("buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall { required: usize, available: usize },

    /// A caller-supplied memory block does not meet the alignment contract.
    #[error("buffer is not {align}-byte aligned")]
    MisalignedBuffer { align: usize },

    /// A tensor's data or qparams region was used before placement bound it.
    #[error("tensor memory is not bound; run memory placement first")]
    UnboundTensor,

    /// A region points outside its memory block.
    #[error("region [{offset}, {offset}+{len}) exceeds block of {available} bytes")]
    RegionOutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },

    /// Two regions that must be disjoint overlap.
    #[error("regions overlap at byte {offset}")]
    RegionOverlap { offset: usize },

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

/// Convenience Result type used throughout tern.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
