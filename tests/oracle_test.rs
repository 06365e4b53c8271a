//! Native versus translated execution of small shellcode snippets.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use iced_x86::code_asm::*;
use iced_x86::IcedError;
use rewire::oracle::Comparison;
use rewire::{Context, OracleError, ShellcodeTester, StackRegion, TargetSpec};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compare<F>(build: F) -> Comparison
where
    F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
{
    init_logging();
    let tester = ShellcodeTester::new(TargetSpec::host()).unwrap();
    let mut stack = StackRegion::new(64 * 1024);
    let mut ctx = Context::default();
    tester.init_context(&mut ctx, &stack);
    let mut obj = tester.compile_with_context_switch(build).unwrap();
    match tester.compare(&mut obj, &ctx, &mut stack) {
        Ok(result) => result,
        Err(err) => panic!("{err}"),
    }
}

#[test]
fn test_arithmetic() {
    let result = compare(|a| {
        a.mov(rax, 5u64)?;
        a.mov(rbx, 7u64)?;
        a.add(rax, rbx)?;
        a.imul_2(rax, rbx)?;
        a.sub(rcx, rax)?;
        a.xor(rdx, rdx)?;
        a.ret()
    });
    assert_eq!(result.native.gpr_state.rax, 84);
    assert_eq!(result.translated.gpr_state.rdx, 0);
}

#[test]
fn test_counted_loop() {
    let result = compare(|a| {
        let mut top = a.create_label();
        a.mov(rcx, 10u64)?;
        a.xor(rax, rax)?;
        a.set_label(&mut top)?;
        a.add(rax, rcx)?;
        a.dec(rcx)?;
        a.jnz(top)?;
        a.ret()
    });
    assert_eq!(result.translated.gpr_state.rax, 55);
}

#[test]
fn test_stack_traffic() {
    compare(|a| {
        a.push(rbx)?;
        a.push(rcx)?;
        a.pop(rdx)?;
        a.pop(rsi)?;
        a.mov(qword_ptr(rsp - 16), rax)?;
        a.mov(dword_ptr(rsp - 24), 0x1234)?;
        a.ret()
    });
}

#[test]
fn test_immediate_push_pop_and_read() {
    let result = compare(|a| {
        a.mov(rax, 0xdead_beefu64)?;
        a.push(rbx)?;
        a.push(rax)?;
        a.pop(rbx)?;
        a.pop(rcx)?;
        a.mov(rdx, qword_ptr(rsp))?;
        a.ret()
    });
    assert_eq!(result.translated.gpr_state.rbx, 0xdead_beef);
    // rsp points at the wrapper's return address in both runs
    assert_eq!(result.native.gpr_state.rdx, result.translated.gpr_state.rdx);
}

#[test]
fn test_direct_call() {
    let result = compare(|a| {
        let mut callee = a.create_label();
        a.call(callee)?;
        a.add(rax, 1)?;
        a.ret()?;
        a.set_label(&mut callee)?;
        a.mov(rax, 41u64)?;
        a.ret()
    });
    assert_eq!(result.translated.gpr_state.rax, 42);
}

#[test]
fn test_return_with_immediate() {
    compare(|a| {
        let mut callee = a.create_label();
        a.sub(rsp, 8)?;
        a.call(callee)?;
        a.ret()?;
        a.set_label(&mut callee)?;
        a.ret_1(8)
    });
}

#[test]
fn test_rip_relative_data() {
    let result = compare(|a| {
        let mut data = a.create_label();
        a.mov(rax, qword_ptr(data))?;
        a.lea(rbx, qword_ptr(data))?;
        a.add(qword_ptr(rsp - 8), rax)?;
        a.ret()?;
        a.set_label(&mut data)?;
        a.dq(&[0x1122_3344_5566_7788])
    });
    assert_eq!(result.translated.gpr_state.rax, 0x1122_3344_5566_7788);
}

#[test]
fn test_indirect_transfers() {
    let result = compare(|a| {
        let mut callee = a.create_label();
        let mut tail = a.create_label();
        a.lea(rax, qword_ptr(callee))?;
        a.call(rax)?;
        a.lea(rdx, qword_ptr(tail))?;
        a.jmp(rdx)?;
        a.ud2()?;
        a.set_label(&mut tail)?;
        a.ret()?;
        a.set_label(&mut callee)?;
        a.mov(rbx, 3u64)?;
        a.ret()
    });
    assert_eq!(result.translated.gpr_state.rbx, 3);
}

#[test]
fn test_indirect_call_through_stack_slot() {
    compare(|a| {
        let mut callee = a.create_label();
        a.lea(rax, qword_ptr(callee))?;
        a.push(rax)?;
        a.call(qword_ptr(rsp))?;
        a.pop(rcx)?;
        a.ret()?;
        a.set_label(&mut callee)?;
        a.inc(rsi)?;
        a.ret()
    });
}

#[test]
fn test_flags_and_conditional_moves() {
    compare(|a| {
        let mut skip = a.create_label();
        a.cmp(rax, rbx)?;
        a.cmovl(rcx, rdx)?;
        a.setg(dl)?;
        a.jae(skip)?;
        a.not(rsi)?;
        a.set_label(&mut skip)?;
        a.bt(rdi, 3)?;
        a.ret()
    });
}

#[test]
fn test_sse_state() {
    compare(|a| {
        a.movq(xmm0, rax)?;
        a.movq(xmm1, rbx)?;
        a.paddq(xmm0, xmm1)?;
        a.movaps(xmm7, xmm0)?;
        a.movq(rcx, xmm0)?;
        a.ret()
    });
}

#[test]
fn test_x87_state() {
    compare(|a| {
        a.fld1()?;
        a.fldpi()?;
        a.fstp(qword_ptr(rsp - 16))?;
        a.ret()
    });
}

#[test]
fn test_mismatch_is_reported() {
    init_logging();
    let tester = ShellcodeTester::new(TargetSpec::host()).unwrap();
    let mut stack = StackRegion::new(64 * 1024);
    let mut ctx = Context::default();
    tester.init_context(&mut ctx, &stack);
    // rdtsc differs between any two runs
    let mut obj = tester
        .compile_with_context_switch(|a| {
            a.rdtsc()?;
            a.shl(rdx, 32)?;
            a.or(rax, rdx)?;
            a.ret()
        })
        .unwrap();
    assert!(matches!(
        tester.compare(&mut obj, &ctx, &mut stack),
        Err(OracleError::ContextMismatch { .. })
    ));
}

#[test]
fn test_real_exec_sets_return_address() {
    init_logging();
    let tester = ShellcodeTester::new(TargetSpec::host()).unwrap();
    let mut stack = StackRegion::new(16 * 1024);
    let mut ctx = Context::default();
    tester.init_context(&mut ctx, &stack);
    let mut obj = tester
        .compile_with_context_switch(|a| {
            a.mov(rax, 9u64)?;
            a.ret()
        })
        .unwrap();

    let out = tester.real_exec(&mut obj, &ctx, &mut stack).unwrap();
    assert_eq!(out.gpr_state.rax, 9);
    assert_eq!(out.gpr_state.rip, obj.return_address());
    assert_eq!(out.gpr_state.rsp, ctx.gpr_state.rsp);
    assert_eq!(
        stack.read_u64(ctx.gpr_state.rsp - 8).unwrap(),
        obj.return_address()
    );
}
