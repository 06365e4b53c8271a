//! Engine behaviour under instrumentation: callbacks, memory recording and caching.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use iced_x86::code_asm::*;
use iced_x86::{Decoder, DecoderOptions, IcedError, Mnemonic};
use rewire::oracle::diff_context;
use rewire::{
    Context, Engine, EngineOptions, ExecError, ExecutionCounter, HookAction, InMemoryObject,
    InstFilter, InstPosition, MemoryAccess, MemoryAccessType, PatchError, ShellcodeTester,
    StackRegion, TargetSpec,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    tester: ShellcodeTester,
    obj: InMemoryObject,
    stack: StackRegion,
    ctx: Context,
}

impl Fixture {
    fn new<F>(build: F) -> Self
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        init_logging();
        let tester = ShellcodeTester::new(TargetSpec::host()).unwrap();
        let stack = StackRegion::new(64 * 1024);
        let mut ctx = Context::default();
        tester.init_context(&mut ctx, &stack);
        let obj = tester.compile_with_context_switch(build).unwrap();
        Self {
            tester,
            obj,
            stack,
            ctx,
        }
    }

    /// Engine with the shellcode instrumented and the return address pushed.
    fn engine(&mut self, options: EngineOptions) -> Engine {
        let mut engine = Engine::new(options).unwrap();
        unsafe { engine.add_instrumented_range(self.obj.code_range()) };
        let mut start = self.ctx;
        start.gpr_state.rsp -= 8;
        self.stack
            .write_u64(start.gpr_state.rsp, self.obj.return_address())
            .unwrap();
        engine.set_context(&start);
        engine
    }

    fn run(&self, engine: &mut Engine) -> Result<bool, ExecError> {
        engine.run(self.obj.entry(), self.obj.return_address())
    }

    /// Address of the first instruction with `mnemonic`.
    fn find(&self, mnemonic: Mnemonic) -> u64 {
        let range = self.obj.code_range();
        let bytes = unsafe {
            std::slice::from_raw_parts(range.start as *const u8, (range.end - range.start) as usize)
        };
        let mut decoder = Decoder::with_ip(64, bytes, range.start, DecoderOptions::NONE);
        while decoder.can_decode() {
            let inst = decoder.decode();
            if inst.mnemonic() == mnemonic {
                return inst.ip();
            }
        }
        panic!("no {mnemonic:?} in shellcode");
    }
}

fn counted_loop(a: &mut CodeAssembler) -> Result<(), IcedError> {
    let mut top = a.create_label();
    a.mov(rcx, 10u64)?;
    a.xor(rax, rax)?;
    a.set_label(&mut top)?;
    a.add(rax, rcx)?;
    a.dec(rcx)?;
    a.jnz(top)?;
    a.ret()
}

#[test]
fn test_code_callback_sees_every_instruction() {
    let mut fx = Fixture::new(counted_loop);
    let mut engine = fx.engine(EngineOptions::default());
    let seen = Rc::new(Cell::new(0usize));
    let counter = seen.clone();
    engine.add_code_cb(InstPosition::PreInst, move |state| {
        assert_eq!(state.gpr.rip, state.inst_address);
        counter.set(counter.get() + 1);
        HookAction::Continue
    });

    assert!(fx.run(&mut engine).unwrap());
    // two setup instructions, three per iteration, one ret
    assert_eq!(seen.get(), 2 + 3 * 10 + 1);
    assert_eq!(engine.context().gpr_state.rax, 55);
    // the loop body is translated once and re-entered for the remaining iterations
    assert_eq!(engine.stats().cache_hits, 8);
    assert_eq!(engine.stats().blocks_translated, 3);
    assert_eq!(engine.stats().callbacks_dispatched, 33);
}

#[test]
fn test_instrumented_run_matches_native() {
    let mut fx = Fixture::new(counted_loop);
    let snapshot = fx.stack.snapshot();
    let native = fx
        .tester
        .real_exec(&mut fx.obj, &fx.ctx, &mut fx.stack)
        .unwrap();
    fx.stack.restore(&snapshot);

    let options = EngineOptions::default()
        .with_max_block_insts(2)
        .with_code_pages(1);
    let mut engine = fx.engine(options);
    engine.add_code_cb(InstPosition::PostInst, |_| HookAction::Continue);
    engine.record_memory_access(MemoryAccessType::READ_WRITE);
    assert!(fx.run(&mut engine).unwrap());

    let mut translated = native;
    translated.gpr_state = engine.context().gpr_state;
    translated.fpr_state = engine.context().fpr_state;
    diff_context(&native, &translated).unwrap();
}

#[test]
fn test_memory_access_callbacks() {
    let mut fx = Fixture::new(|a| {
        a.mov(qword_ptr(rsp - 16), rbx)?;
        a.mov(rax, qword_ptr(rsp - 16))?;
        a.movzx(edx, byte_ptr(rsp - 16))?;
        a.ret()
    });
    let mut engine = fx.engine(EngineOptions::default());
    let accesses: Rc<RefCell<Vec<MemoryAccess>>> = Rc::default();
    let sink = accesses.clone();
    engine.add_mem_access_cb(MemoryAccessType::READ_WRITE, move |state| {
        assert_eq!(state.position, InstPosition::PostInst);
        sink.borrow_mut().extend_from_slice(state.memory_accesses);
        HookAction::Continue
    });
    assert!(fx.run(&mut engine).unwrap());

    let slot = fx.ctx.gpr_state.rsp - 8 - 16;
    let guest_rbx = fx.ctx.gpr_state.rbx;
    let accesses = accesses.borrow();
    assert_eq!(accesses.len(), 3);

    assert_eq!(accesses[0].kind, MemoryAccessType::WRITE);
    assert_eq!(accesses[0].access_address, slot);
    assert_eq!(accesses[0].value, guest_rbx);
    assert_eq!(accesses[0].size, 8);

    assert_eq!(accesses[1].kind, MemoryAccessType::READ);
    assert_eq!(accesses[1].value, guest_rbx);

    assert_eq!(accesses[2].size, 1);
    assert_eq!(accesses[2].value, guest_rbx & 0xff);
    assert_eq!(engine.context().gpr_state.rax, guest_rbx);
}

#[test]
fn test_pre_callback_sees_read_value() {
    let mut fx = Fixture::new(|a| {
        a.mov(qword_ptr(rsp - 16), rsi)?;
        a.mov(rax, qword_ptr(rsp - 16))?;
        a.ret()
    });
    let mut engine = fx.engine(EngineOptions::default());
    engine.record_memory_access(MemoryAccessType::READ);
    let read = Rc::new(Cell::new(None));
    let out = read.clone();
    engine.add_mnemonic_cb(Mnemonic::Mov, InstPosition::PreInst, move |state| {
        if let Some(access) = state.memory_accesses.first() {
            out.set(Some(access.value));
        }
        HookAction::Continue
    });
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(read.get(), Some(fx.ctx.gpr_state.rsi));
}

#[test]
fn test_callback_can_edit_registers() {
    let mut fx = Fixture::new(|a| {
        a.mov(rax, rbx)?;
        a.ret()
    });
    let entry = fx.obj.entry();
    let mut engine = fx.engine(EngineOptions::default());
    engine.add_code_addr_cb(entry, InstPosition::PreInst, |state| {
        state.gpr.rbx = 100;
        HookAction::Continue
    });
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.context().gpr_state.rax, 100);
}

#[test]
fn test_stop_and_redirect() {
    let mut fx = Fixture::new(|a| {
        a.mov(rax, 1u64)?;
        a.mov(rax, 2u64)?;
        a.ret()
    });
    let entry = fx.obj.entry();

    let mut engine = fx.engine(EngineOptions::default());
    engine.add_code_addr_cb(entry, InstPosition::PostInst, |_| HookAction::Stop);
    assert!(!fx.run(&mut engine).unwrap());
    assert_eq!(engine.context().gpr_state.rax, 1);

    let back = fx.obj.return_address();
    let mut engine = fx.engine(EngineOptions::default());
    engine.add_code_addr_cb(entry, InstPosition::PreInst, move |state| {
        state.gpr.rsp += 8;
        state.gpr.rip = back;
        HookAction::Redirect
    });
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.context().gpr_state.rax, fx.ctx.gpr_state.rax);
    assert_eq!(engine.context().gpr_state.rsp, fx.ctx.gpr_state.rsp);
}

#[test]
fn test_execution_counter_rule() {
    let mut fx = Fixture::new(counted_loop);
    let dec = fx.find(Mnemonic::Dec);
    let mut engine = fx.engine(EngineOptions::default());
    engine.add_instr_rule(Box::new(ExecutionCounter {
        tag: 5,
        filter: InstFilter::Mnemonic(Mnemonic::Dec),
    }));
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.shadow_value(dec, 5), Some(10));
    assert_eq!(engine.shadow_value(dec, 6), None);
    // the counter is flag-neutral, so the loop still ran ten times
    assert_eq!(engine.context().gpr_state.rax, 55);
}

#[test]
fn test_removed_callback_no_longer_fires() {
    let mut fx = Fixture::new(counted_loop);
    let mut engine = fx.engine(EngineOptions::default());
    let id = engine.add_code_cb(InstPosition::PreInst, |_| HookAction::Stop);
    assert!(engine.remove_instrumentation(id));
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.stats().callbacks_dispatched, 0);
}

#[test]
fn test_leaving_instrumented_code() {
    let mut fx = Fixture::new(|a| {
        a.mov(rax, 0x1234u64)?;
        a.jmp(rax)
    });
    let mut engine = fx.engine(EngineOptions::default());
    assert!(matches!(
        fx.run(&mut engine),
        Err(ExecError::NotInstrumented(0x1234))
    ));
}

#[test]
fn test_unsupported_instruction() {
    let mut fx = Fixture::new(|a| {
        let mut done = a.create_label();
        a.jrcxz(done)?;
        a.set_label(&mut done)?;
        a.ret()
    });
    let entry = fx.obj.entry();
    let mut engine = fx.engine(EngineOptions::default());
    match fx.run(&mut engine) {
        Err(ExecError::Patch(PatchError::Unsupported { address, .. })) => assert_eq!(address, entry),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_clear_cache_retranslates() {
    let mut fx = Fixture::new(counted_loop);
    let mut engine = fx.engine(EngineOptions::default());
    let start = *engine.context();
    assert!(fx.run(&mut engine).unwrap());
    let first = engine.stats().blocks_translated;

    engine.clear_cache();
    engine.set_context(&start);
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.stats().blocks_translated, 2 * first);
    assert!(engine.stats().exec_blocks_created >= 2);
}

#[test]
fn test_cached_block_respects_new_stop() {
    let mut fx = Fixture::new(|a| {
        a.mov(eax, 1)?;
        a.add(eax, 1)?;
        a.imul_3(eax, eax, 3)?;
        a.ret()
    });
    let imul = fx.find(Mnemonic::Imul);
    let entry = fx.obj.entry();
    let mut engine = fx.engine(EngineOptions::default());
    let start = *engine.context();

    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.context().gpr_state.rax, 6);

    // the cached block covers imul and ret, but must stop before imul now
    engine.set_context(&start);
    assert!(engine.run(entry, imul).unwrap());
    assert_eq!(engine.context().gpr_state.rax, 2);
    assert_eq!(engine.context().gpr_state.rip, imul);

    engine.set_context(&start);
    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.context().gpr_state.rax, 6);
}

/// Native `rdi + rsi` outside every instrumented range, plus a guest caller.
fn native_add_fixture() -> (InMemoryObject, Fixture) {
    let tester = ShellcodeTester::new(TargetSpec::host()).unwrap();
    let native = tester
        .compile_with_context_switch(|a| {
            a.lea(rax, qword_ptr(rdi + rsi))?;
            a.ret()
        })
        .unwrap();
    let target = native.entry();
    let fx = Fixture::new(move |a| {
        a.mov(rdi, 40u64)?;
        a.mov(rsi, 2u64)?;
        a.mov(rax, target)?;
        a.call(rax)?;
        a.add(rax, 1)?;
        a.ret()
    });
    (native, fx)
}

#[test]
fn test_call_into_uninstrumented_code_runs_natively() {
    let (_native, mut fx) = native_add_fixture();
    let mut engine = fx.engine(EngineOptions::default());
    let seen = Rc::new(Cell::new(0usize));
    let counter = seen.clone();
    engine.add_code_cb(InstPosition::PreInst, move |_| {
        counter.set(counter.get() + 1);
        HookAction::Continue
    });

    assert!(fx.run(&mut engine).unwrap());
    assert_eq!(engine.context().gpr_state.rax, 43);
    assert_eq!(engine.context().gpr_state.rsp, fx.ctx.gpr_state.rsp);
    // only the guest instructions are instrumented
    assert_eq!(seen.get(), 6);
    assert_eq!(engine.stats().native_calls, 1);
}

#[test]
fn test_native_calls_can_be_disabled() {
    let (native, mut fx) = native_add_fixture();
    let mut engine = fx.engine(EngineOptions::default().with_exec_broker(false));
    match fx.run(&mut engine) {
        Err(ExecError::NotInstrumented(address)) => assert_eq!(address, native.entry()),
        other => panic!("unexpected {other:?}"),
    }
}
