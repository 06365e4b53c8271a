//! rewire - dynamic binary instrumentation for x86-64.
//!
//! rewire translates guest machine code one basic block at a time into
//! position-independent patches, weaves instrumentation hooks around each
//! guest instruction and runs the result from executable memory under a
//! canonical CPU context. An execution comparison harness runs shellcode
//! natively and through the engine and checks that both agree.
//!
//! # Primary Usage
//!
//! ```ignore
//! use rewire::{Engine, EngineOptions, HookAction, InstPosition};
//!
//! let mut engine = Engine::new(EngineOptions::default())?;
//! unsafe { engine.add_instrumented_range(code.clone()) };
//! engine.add_code_cb(InstPosition::PreInst, |state| {
//!     println!("{:#x}", state.inst_address);
//!     HookAction::Continue
//! });
//! engine.run(code.start, return_address)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Register, shadow and relocation types, temps, sessions
//! - [`x64`] - Context layout, decoding, patch generation, exec blocks
//! - [`instrument`] - Rules, hook builders and callback types
//! - [`engine`] - Translation cache and run loop
//! - [`oracle`] - Native versus translated execution comparison

pub mod config;
pub mod core;
pub mod engine;
pub mod instrument;
pub mod oracle;
pub mod x64;

pub use crate::config::{EngineOptions, HookOrder, TargetSpec};
pub use crate::core::{
    Constant, ExecError, NativeReg, Offset, Operand, PatchError, Reg, RelocTag, RelocatableInst,
    SessionStats, Shadow, Temp,
};
pub use crate::engine::Engine;
pub use crate::instrument::{
    Callback, ExecutionCounter, HookAction, HookBuilder, InstFilter, InstPosition, InstrRule,
    MemoryAccess, MemoryAccessFlags, MemoryAccessType, VmState,
};
pub use crate::oracle::{InMemoryObject, OracleError, ShellcodeTester, StackRegion};
pub use crate::x64::{Context, FprState, GprState};
