use thiserror::Error;

/// User-visible failures. A failed call leaves the allocation table
/// unchanged except that newly allocated outputs are released; the command
/// stream is never modified by a failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("tensor is already initialized")]
    AlreadyInitialized,
    #[error("tensor was never initialized")]
    NotInitialized,
    #[error("tensor was deallocated")]
    Deallocated,
    #[error("tensor handle was never allocated")]
    NeverAllocated,
    #[error("tensor has no backing device buffer")]
    NullBackingBuffer,
    #[error("unknown operation \"{0}\"")]
    UnknownOp(String),
    #[error("device out of memory")]
    DeviceOutOfMemory,
    #[error("tensor rank exceeds the supported maximum of 5")]
    ShapeOverflow,
}
