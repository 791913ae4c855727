use thiserror::Error;

/// Result codes of module loading. The loader reports the most specific
/// reason it can find and stops at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("not a valid AMX module")]
    InvalidFile,
    #[error("unsupported file format version")]
    UnsupportedFileVersion,
    #[error("module requires a newer abstract machine")]
    UnsupportedAmxVersion,
    #[error("module uses an unsupported feature")]
    FeatureNotSupported,
    #[error("module was compiled for a different cell size")]
    WrongCellSize,
    #[error("native function not resolved")]
    NativeNotResolved,
    #[error("machine bring-up failed")]
    Unknown,
}
