// This module defines the error types for rewire using the thiserror crate. PatchError
// covers everything that can go wrong while turning a guest instruction into a tagged
// relocatable sequence and while resolving that sequence at a concrete address: decode
// failures, unsupported control-flow forms, temp and shadow exhaustion, reserved sentinel
// misuse, malformed tag ordering and encoder failures. MemoryError covers the mmap/mprotect
// layer, ExecError the engine run loop and ConfigError option validation. Conversions
// between them are provided so that `?` can cross the translation, placement and
// execution layers without manual wrapping.

//! Error types for rewire.

use thiserror::Error;

use super::reloc::RelocTag;

/// Errors raised while generating or resolving a patch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("cannot decode instruction at {address:#x}")]
    Decode { address: u64 },

    #[error("unsupported instruction at {address:#x}: {reason}")]
    Unsupported { address: u64, reason: String },

    #[error("no scratch register left for temp {temp} at {address:#x}")]
    TempExhausted { address: u64, temp: u32 },

    #[error("temp {0:#x} is reserved for engine sequences")]
    ReservedTemp(u32),

    #[error("shadow slots exhausted ({requested} requested)")]
    ShadowExhausted { requested: usize },

    #[error("shadow tag {0:#06x} lies in the reserved memory tag range")]
    ReservedShadowTag(u16),

    #[error("the untagged sentinel cannot be allocated as a shadow")]
    UntaggedShadow,

    #[error("shadow tag {0:#06x} already allocated in this patch")]
    DuplicateShadowTag(u16),

    #[error("invalid relocation tag in sequence at index {index}")]
    InvalidTag { index: usize },

    #[error("malformed patch: {tag:?} at index {index}: {reason}")]
    MalformedPatch {
        tag: RelocTag,
        index: usize,
        reason: &'static str,
    },

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("layout changed between resolution passes ({first} vs {second} bytes)")]
    LayoutMismatch { first: usize, second: usize },
}

impl From<iced_x86::IcedError> for PatchError {
    fn from(err: iced_x86::IcedError) -> Self {
        PatchError::Encoding(err.to_string())
    }
}

/// Errors from the executable memory layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("mmap of {size} bytes failed (errno {errno})")]
    AllocationFailed { size: usize, errno: i32 },

    #[error("mprotect failed (errno {errno})")]
    ProtectionFailed { errno: i32 },

    #[error("write of {len} bytes at offset {offset:#x} exceeds region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("invalid region size")]
    InvalidSize,
}

/// Errors from option and target validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown CPU model: {0}")]
    UnknownCpu(String),

    #[error("unknown feature attribute: {0}")]
    UnknownFeature(String),

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Errors from the engine run loop.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("address {0:#x} is outside every instrumented range")]
    NotInstrumented(u64),

    #[error("exec block has no room left")]
    ExecBlockFull,

    #[error("basic block at {address:#x} does not fit in an empty exec block")]
    SequenceTooLarge { address: u64 },

    #[error("callback {0} is not registered")]
    UnknownCallback(u32),
}

/// Result alias for patch generation.
pub type PatchResult<T> = Result<T, PatchError>;

/// Result alias for engine operations.
pub type ExecResult<T> = Result<T, ExecError>;
