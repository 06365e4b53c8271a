// This module is the execution comparison harness used to check translation correctness.
// A ShellcodeTester assembles a piece of shellcode with the iced-x86 code assembler and
// places it behind a native wrapper that performs the same context switch as an exec block
// but calls the shellcode directly. The same starting context and stack bytes are then run
// twice: natively through the wrapper and through a fresh Engine that instruments only the
// shellcode. Because the engine run starts with the wrapper's return address already pushed,
// both runs see identical stacks, and the resulting contexts and stack bytes must agree on
// every architecturally defined field. The first disagreement is reported as an error.

//! Native versus translated execution comparison.

use std::ops::Range;

use iced_x86::code_asm::CodeAssembler;
use iced_x86::IcedError;
use thiserror::Error;

use crate::config::{EngineOptions, TargetSpec};
use crate::core::error::{ConfigError, ExecError, MemoryError, PatchError};
use crate::engine::Engine;
use crate::x64::context::{Context, FprState, GprState};
use crate::x64::memory::ExecRegion;
use crate::x64::trampoline::{build_native_wrapper, NATIVE_WRAPPER_SIZE};

/// Code pages of a shellcode object, wrapper included.
const OBJECT_CODE_PAGES: usize = 4;
/// Stack bytes left above the initial rsp.
const STACK_RED_ZONE: u64 = 256;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{field} differs: native {expected:#x}, translated {actual:#x}")]
    ContextMismatch {
        field: String,
        expected: u64,
        actual: u64,
    },

    #[error("stack byte at offset {offset:#x} differs: native {expected:#04x}, translated {actual:#04x}")]
    MemoryMismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },
}

impl From<IcedError> for OracleError {
    fn from(err: IcedError) -> Self {
        OracleError::Assembly(err.to_string())
    }
}

impl From<PatchError> for OracleError {
    fn from(err: PatchError) -> Self {
        OracleError::Exec(ExecError::Patch(err))
    }
}

/// Guest stack memory for shellcode runs.
pub struct StackRegion {
    words: Box<[u64]>,
}

impl StackRegion {
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0u64; size.div_ceil(8).max(64)].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Highest 16-byte aligned address inside the region.
    pub fn top(&self) -> u64 {
        (self.base() + self.len() as u64) & !15
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.base()..self.base() + self.len() as u64).contains(&address)
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn snapshot(&self) -> Box<[u64]> {
        self.words.clone()
    }

    pub fn restore(&mut self, snapshot: &[u64]) {
        self.words.copy_from_slice(snapshot);
    }

    pub fn fill(&mut self, value: u64) {
        self.words.fill(value);
    }

    /// Store `value` at the 8-byte aligned `address`.
    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<(), OracleError> {
        let index = self.word_index(address)?;
        self.words[index] = value;
        Ok(())
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, OracleError> {
        Ok(self.words[self.word_index(address)?])
    }

    fn word_index(&self, address: u64) -> Result<usize, OracleError> {
        if !self.contains(address) || address % 8 != 0 {
            return Err(ConfigError::InvalidValue {
                name: "stack address",
                value: format!("{address:#x}"),
            }
            .into());
        }
        Ok(((address - self.base()) / 8) as usize)
    }
}

/// Shellcode placed behind a native context-switch wrapper.
pub struct InMemoryObject {
    region: ExecRegion,
    wrapper: u64,
    shellcode: Range<u64>,
    return_address: u64,
}

impl InMemoryObject {
    pub fn entry(&self) -> u64 {
        self.shellcode.start
    }

    pub fn code_range(&self) -> Range<u64> {
        self.shellcode.clone()
    }

    /// Guest rip after the shellcode returns.
    pub fn return_address(&self) -> u64 {
        self.return_address
    }

    fn context_mut(&mut self) -> &mut Context {
        // SAFETY: the data page was initialised with a Context when the object was built.
        unsafe { &mut *self.region.data_ptr().cast::<Context>() }
    }

    /// Run the shellcode natively from `ctx`.
    ///
    /// # Safety
    ///
    /// The shellcode must only touch memory reachable from `ctx`.
    unsafe fn call_native(&mut self, ctx: &Context) -> Context {
        {
            let data = self.context_mut();
            data.gpr_state = ctx.gpr_state;
            data.fpr_state = ctx.fpr_state;
        }
        let wrapper: extern "sysv64" fn() = std::mem::transmute(self.wrapper as usize as *const ());
        wrapper();

        let mut out = *ctx;
        let data = self.context_mut();
        out.gpr_state = data.gpr_state;
        out.fpr_state = data.fpr_state;
        out.gpr_state.rip = self.return_address;
        out
    }
}

/// Contexts produced by a successful comparison.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub native: Context,
    pub translated: Context,
}

/// Runs shellcode natively and through the engine and compares the results.
pub struct ShellcodeTester {
    target: TargetSpec,
}

impl ShellcodeTester {
    pub fn new(target: TargetSpec) -> Result<Self, OracleError> {
        target.validate()?;
        if !target.supported_by_host() {
            log::warn!(
                "target {} {:?} is not fully supported by this host",
                target.cpu,
                target.features
            );
        }
        Ok(Self { target })
    }

    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    /// Assemble `build` at its final address behind a native wrapper.
    pub fn compile_with_context_switch<F>(&self, build: F) -> Result<InMemoryObject, OracleError>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        let mut region = ExecRegion::new(OBJECT_CODE_PAGES)?;
        let base = region.code_address();
        let start = base + NATIVE_WRAPPER_SIZE as u64;

        let mut asm = CodeAssembler::new(64)?;
        build(&mut asm)?;
        let code = asm.assemble(start)?;
        if NATIVE_WRAPPER_SIZE + code.len() > region.code_size() {
            return Err(OracleError::Assembly(format!(
                "shellcode of {} bytes does not fit",
                code.len()
            )));
        }

        let wrapper = build_native_wrapper(base, region.data_address(), start)?;
        region.write_code(0, &wrapper.code)?;
        region.write_code(NATIVE_WRAPPER_SIZE, &code)?;
        // SAFETY: the data page is writable, aligned and larger than a Context.
        unsafe { region.data_ptr().cast::<Context>().write(Context::default()) };
        region.make_code_executable()?;

        log::debug!(
            "shellcode object: {} bytes at {:#x}, wrapper returns to {:#x}",
            code.len(),
            start,
            wrapper.return_address
        );
        Ok(InMemoryObject {
            region,
            wrapper: base,
            shellcode: start..start + code.len() as u64,
            return_address: wrapper.return_address,
        })
    }

    /// Deterministic starting state with rsp inside `stack`.
    pub fn init_context(&self, ctx: &mut Context, stack: &StackRegion) {
        let mut gpr = GprState::default();
        for slot in 0..16 {
            gpr.set(slot, 0x0101_0101_0101_0101u64.wrapping_mul(slot as u64 + 1) ^ 0x5a5a);
        }
        gpr.rsp = stack.top() - STACK_RED_ZONE;
        gpr.rip = 0;
        gpr.eflags = 0x202;
        ctx.gpr_state = gpr;
        ctx.fpr_state = FprState::default();
    }

    fn check_stack(ctx: &Context, stack: &StackRegion) -> Result<(), OracleError> {
        let rsp = ctx.gpr_state.rsp;
        if !stack.contains(rsp.wrapping_sub(8)) {
            return Err(ConfigError::InvalidValue {
                name: "rsp",
                value: format!("{rsp:#x}"),
            }
            .into());
        }
        Ok(())
    }

    /// Run `obj` natively from `ctx`.
    pub fn real_exec(
        &self,
        obj: &mut InMemoryObject,
        ctx: &Context,
        stack: &mut StackRegion,
    ) -> Result<Context, OracleError> {
        Self::check_stack(ctx, stack)?;
        // SAFETY: rsp points into `stack`, which is exclusively borrowed for the run.
        Ok(unsafe { obj.call_native(ctx) })
    }

    /// Run `obj` through a fresh engine from `ctx`.
    pub fn jit_exec(
        &self,
        obj: &InMemoryObject,
        ctx: &Context,
        stack: &mut StackRegion,
    ) -> Result<Context, OracleError> {
        self.jit_exec_with(obj, ctx, stack, |_| {})
    }

    /// Like [`ShellcodeTester::jit_exec`], letting `configure` add instrumentation first.
    pub fn jit_exec_with<F>(
        &self,
        obj: &InMemoryObject,
        ctx: &Context,
        stack: &mut StackRegion,
        configure: F,
    ) -> Result<Context, OracleError>
    where
        F: FnOnce(&mut Engine),
    {
        Self::check_stack(ctx, stack)?;
        let mut engine = Engine::new(EngineOptions::default().with_target(self.target.clone()))?;
        // SAFETY: the object's code stays mapped for the engine's lifetime.
        unsafe { engine.add_instrumented_range(obj.code_range()) };
        configure(&mut engine);

        let mut start = *ctx;
        start.gpr_state.rsp -= 8;
        stack.write_u64(start.gpr_state.rsp, obj.return_address)?;
        engine.set_context(&start);

        let reached = engine.run(obj.entry(), obj.return_address)?;
        if !reached {
            log::debug!("translated run stopped by a callback");
        }
        let mut out = *ctx;
        out.gpr_state = engine.context().gpr_state;
        out.fpr_state = engine.context().fpr_state;
        Ok(out)
    }

    /// Run both ways from identical state and report the first difference.
    pub fn compare(
        &self,
        obj: &mut InMemoryObject,
        ctx: &Context,
        stack: &mut StackRegion,
    ) -> Result<Comparison, OracleError> {
        let initial = stack.snapshot();
        let native = self.real_exec(obj, ctx, stack)?;
        let native_stack = stack.bytes();

        stack.restore(&initial);
        let translated = self.jit_exec(obj, ctx, stack)?;
        let translated_stack = stack.bytes();

        diff_context(&native, &translated)?;
        if let Some(offset) = native_stack
            .iter()
            .zip(&translated_stack)
            .position(|(a, b)| a != b)
        {
            return Err(OracleError::MemoryMismatch {
                offset,
                expected: native_stack[offset],
                actual: translated_stack[offset],
            });
        }
        Ok(Comparison { native, translated })
    }
}

fn mismatch(field: String, expected: u64, actual: u64) -> Result<(), OracleError> {
    if expected == actual {
        return Ok(());
    }
    Err(OracleError::ContextMismatch {
        field,
        expected,
        actual,
    })
}

fn diff_bytes(name: &str, index: usize, expected: &[u8], actual: &[u8]) -> Result<(), OracleError> {
    for (half, (e, a)) in expected.chunks(8).zip(actual.chunks(8)).enumerate() {
        let word = |b: &[u8]| {
            let mut buf = [0u8; 8];
            buf[..b.len()].copy_from_slice(b);
            u64::from_le_bytes(buf)
        };
        mismatch(format!("{name}{index}[{half}]"), word(e), word(a))?;
    }
    Ok(())
}

/// Compare every architecturally defined register field.
pub fn diff_context(expected: &Context, actual: &Context) -> Result<(), OracleError> {
    for (slot, name) in GprState::NAMES.iter().enumerate() {
        let (e, a) = if slot == 17 {
            (expected.gpr_state.eflags, actual.gpr_state.eflags)
        } else {
            (expected.gpr_state.get(slot), actual.gpr_state.get(slot))
        };
        mismatch(name.to_string(), e, a)?;
    }

    let (e, a) = (&expected.fpr_state, &actual.fpr_state);
    mismatch("fcw".into(), e.fcw.into(), a.fcw.into())?;
    mismatch("fsw".into(), e.fsw.into(), a.fsw.into())?;
    mismatch("ftw".into(), e.ftw.into(), a.ftw.into())?;
    mismatch("mxcsr".into(), e.mxcsr.into(), a.mxcsr.into())?;
    for (i, (x, y)) in e.st.iter().zip(&a.st).enumerate() {
        diff_bytes("st", i, &x[..10], &y[..10])?;
    }
    for (i, (x, y)) in e.xmm.iter().zip(&a.xmm).enumerate() {
        diff_bytes("xmm", i, x, y)?;
    }
    Ok(())
}
