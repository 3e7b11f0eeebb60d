//! Error types for training, quantization, compilation and inference.

/// Errors raised by the estimator lifecycle and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Compile or encrypted predict requested before any successful fit
    #[error("The classifier needs to be calibrated before compilation, please call .fit() first!")]
    NotCalibrated,

    /// Encrypted predict requested before a successful compile
    #[error("The classifier is not yet compiled to FHE, please call .compile() first")]
    NotCompiled,

    /// Floating-point predict on an estimator that was never trained
    #[error("The estimator is not fitted yet")]
    NotFitted,

    /// Data with zero rows or zero columns
    #[error("Empty data: {rows} rows x {cols} columns")]
    EmptyData { rows: usize, cols: usize },

    /// A network without any linear layer has no input width to trace
    #[error("Network has no linear layer")]
    NoLinearLayer,

    /// Dimension mismatch between data, labels or network
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: usize, actual: usize },

    /// Class labels must be non-negative indices
    #[error("Invalid label: {0}")]
    InvalidLabel(i64),

    /// Unsupported quantization bit width
    #[error("Invalid bit width: {0}")]
    InvalidBitWidth(u32),

    /// The compiler rejected the quantized module
    #[error("Compilation failed: {0}")]
    Compilation(String),

    /// Circuit execution rejected its input
    #[error("Circuit execution failed: {0}")]
    Circuit(String),

    /// A circuit was paired with a module it was not compiled from
    #[error("Circuit was compiled for module {circuit:#x}, not {module:#x}")]
    CircuitMismatch { circuit: u64, module: u64 },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for estimator operations
pub type Result<T> = std::result::Result<T, Error>;
