//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Canonical context layout shared with translated code
//! - Instruction decoding and analysis using iced-x86
//! - Patch generation and placement-time resolution
//! - Executable memory, context switch trampolines and exec blocks
//! - The exec broker for native calls out of instrumented code

pub mod broker;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod exec_block;
pub mod memory;
pub mod patch;
pub mod trampoline;

pub use broker::ExecBroker;
pub use context::{Context, FprState, GprState, HostState, GPR_ID, NUM_GPR};
pub use decoder::{decode, FlowKind, InstAnalysis, MemoryAccessInfo, MemoryAccessType, MAX_INST_LEN};
pub use exec_block::{ExecBlock, PatchMeta, PendingCallback};
pub use memory::ExecRegion;
pub use patch::{GeneratorConfig, Patch, PatchGenerator};
