use thiserror::Error;

/// Errors that can occur during heap operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No tier has a block large enough
    #[error("Out of memory")]
    OutOfMemory,
    /// Invalid alignment (must be zero or a power of 2)
    #[error("Invalid alignment (must be a power of 2)")]
    InvalidAlignment,
    /// Invalid size (must be non-zero and fit the region)
    #[error("Invalid size")]
    InvalidSize,
    /// Invalid tier layout
    #[error("Invalid layout")]
    InvalidLayout,
    /// Attempted to free a pointer that no allocator owns
    #[error("Invalid pointer")]
    InvalidPointer,
    /// Double free detected
    #[error("Double free detected")]
    DoubleFree,
    /// The global heap already owns an arena
    #[error("Heap already initialized")]
    AlreadyInitialized,
}

pub type Result<T> = core::result::Result<T, HeapError>;
