// This module gathers rewire's architecture-neutral infrastructure: the typed register,
// value and shadow wrappers, the tagged relocatable instruction IR with its shape
// validator, the per-patch shadow allocator, the scratch register manager and the
// arena-based translation session with its statistics. The x64 module builds on these to
// decode, patch, place and run guest code.

//! Core rewire infrastructure.
//!
//! # Key Components
//!
//! - `types`: `NativeReg`, `Reg`, `Constant`, `Offset`, `Temp`, `Operand`, `Shadow`
//! - `reloc`: `RelocTag`, `RelocOp`, `RelocatableInst` and `validate_patch`
//! - `shadow`: tag allocation for metadata slots
//! - `temp_manager`: scratch register resolution and spill sequences
//! - `session`: translation arena and statistics

pub mod error;
pub mod reloc;
pub mod session;
pub mod shadow;
pub mod temp_manager;
pub mod test_utils;
pub mod types;

pub use error::{ConfigError, ExecError, ExecResult, MemoryError, PatchError, PatchResult};
pub use reloc::{validate_patch, RelocOp, RelocTag, RelocatableInst};
pub use session::{SessionStats, TranslationSession};
pub use shadow::{ShadowAllocator, MAX_SHADOWS_PER_PATCH};
pub use temp_manager::{RegSet, TempBinding, TempManager};
pub use types::{
    Constant, NativeReg, Offset, Operand, Reg, Shadow, Temp, MEMORY_TAG_BEGIN, MEMORY_TAG_END,
    MEM_READ_ADDRESS_TAG, MEM_READ_VALUE_TAG, MEM_WRITE_ADDRESS_TAG, MEM_WRITE_VALUE_TAG, REG_PC,
    REG_SP,
};
