// This module emits the host/guest context switch. Entering saves the host's flags and
// callee-saved registers on the host stack, records the host stack pointer in the context,
// swaps the floating point state with fxsave/fxrstor, installs the guest flags through the
// host stack and finally loads every guest integer register, rsp last. Leaving does the
// reverse: all guest registers are stored before rsp is switched back, so the host stack is
// the only scratch space touched while the guest state is live. Exec blocks follow the
// entry with an indirect jump through the context's selector. The native wrapper used by
// the comparison harness calls a fixed target instead, and the broker gate calls through
// the selector; both leave through the same exit path when the callee returns.

//! Context switch trampolines.

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, IcedError, Instruction, Register};

use crate::core::error::PatchError;
use crate::core::types::{Reg, REG_SP};

use super::context::{
    AVAILABLE_GPR, EFLAGS_OFFSET, FPR_OFFSET, HOST_FPR_OFFSET, HOST_SP_OFFSET, SELECTOR_OFFSET,
};
use super::encoder::{load, rip_mem, store};

/// Code reserved ahead of the shellcode for the native wrapper.
pub const NATIVE_WRAPPER_SIZE: usize = 512;

/// Slots loaded and stored by the switch, rsp last.
fn switched_slots() -> impl Iterator<Item = Reg> {
    (0..AVAILABLE_GPR as u32).map(Reg::new).chain(std::iter::once(REG_SP))
}

fn fxsave(address: u64) -> Result<Instruction, IcedError> {
    Instruction::with1(Code::Fxsave_m512byte, rip_mem(address))
}

fn fxrstor(address: u64) -> Result<Instruction, IcedError> {
    Instruction::with1(Code::Fxrstor_m512byte, rip_mem(address))
}

/// Switch from the host to the guest state held at `context`.
pub fn emit_context_enter(a: &mut CodeAssembler, context: u64) -> Result<(), PatchError> {
    a.pushfq()?;
    a.push(rbx)?;
    a.push(rbp)?;
    a.push(r12)?;
    a.push(r13)?;
    a.push(r14)?;
    a.push(r15)?;
    a.add_instruction(store(rip_mem(context + HOST_SP_OFFSET as u64), Register::RSP)?)?;

    a.add_instruction(fxsave(context + HOST_FPR_OFFSET as u64)?)?;
    a.add_instruction(fxrstor(context + FPR_OFFSET as u64)?)?;

    a.add_instruction(load(Register::RAX, rip_mem(context + EFLAGS_OFFSET as u64))?)?;
    a.push(rax)?;
    a.popfq()?;

    for reg in switched_slots() {
        a.add_instruction(load(reg.into(), rip_mem(context + reg.offset() as u64))?)?;
    }
    Ok(())
}

/// Switch from the guest back to the host, returning to the caller of the entry.
pub fn emit_context_exit(a: &mut CodeAssembler, context: u64) -> Result<(), PatchError> {
    for reg in switched_slots() {
        a.add_instruction(store(rip_mem(context + reg.offset() as u64), reg.into())?)?;
    }
    a.add_instruction(load(Register::RSP, rip_mem(context + HOST_SP_OFFSET as u64))?)?;

    a.pushfq()?;
    a.pop(rax)?;
    a.add_instruction(store(rip_mem(context + EFLAGS_OFFSET as u64), Register::RAX)?)?;

    a.add_instruction(fxsave(context + FPR_OFFSET as u64)?)?;
    a.add_instruction(fxrstor(context + HOST_FPR_OFFSET as u64)?)?;

    a.pop(r15)?;
    a.pop(r14)?;
    a.pop(r13)?;
    a.pop(r12)?;
    a.pop(rbp)?;
    a.pop(rbx)?;
    a.popfq()?;
    a.ret()?;
    Ok(())
}

/// Prologue and epilogue of an exec block.
#[derive(Debug, Clone)]
pub struct Trampolines {
    pub code: Vec<u8>,
    pub prologue: u64,
    pub epilogue: u64,
}

/// Assemble the exec block trampolines at `code_address`.
///
/// The prologue resumes at the address stored in the context's selector.
pub fn build_exec_trampolines(code_address: u64, context: u64) -> Result<Trampolines, PatchError> {
    let mut a = CodeAssembler::new(64)?;
    emit_context_enter(&mut a, context)?;
    a.add_instruction(Instruction::with1(
        Code::Jmp_rm64,
        rip_mem(context + SELECTOR_OFFSET as u64),
    )?)?;

    let mut epilogue = a.create_label();
    a.set_label(&mut epilogue)?;
    emit_context_exit(&mut a, context)?;

    let result = a.assemble_options(code_address, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
    let epilogue = result.label_ip(&epilogue)?;
    Ok(Trampolines {
        code: result.inner.code_buffer,
        prologue: code_address,
        epilogue,
    })
}

/// Host-callable wrapper that runs native code under the context switch.
#[derive(Debug, Clone)]
pub struct NativeWrapper {
    pub code: Vec<u8>,
    /// Where `target` returns to; the guest rip after a native run.
    pub return_address: u64,
}

/// Assemble a wrapper at `code_address` that calls `target` with the guest state at `context`.
pub fn build_native_wrapper(
    code_address: u64,
    context: u64,
    target: u64,
) -> Result<NativeWrapper, PatchError> {
    assemble_wrapper(code_address, context, |a| a.call(target))
}

/// Like [`build_native_wrapper`], but calls whatever address the context's
/// selector holds when the wrapper runs.
pub fn build_broker_gate(code_address: u64, context: u64) -> Result<NativeWrapper, PatchError> {
    assemble_wrapper(code_address, context, |a| {
        a.add_instruction(Instruction::with1(
            Code::Call_rm64,
            rip_mem(context + SELECTOR_OFFSET as u64),
        )?)
    })
}

fn assemble_wrapper<F>(code_address: u64, context: u64, call: F) -> Result<NativeWrapper, PatchError>
where
    F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
{
    let mut a = CodeAssembler::new(64)?;
    emit_context_enter(&mut a, context)?;
    call(&mut a)?;
    let mut back = a.create_label();
    a.set_label(&mut back)?;
    emit_context_exit(&mut a, context)?;

    let result = a.assemble_options(code_address, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
    let return_address = result.label_ip(&back)?;
    let code = result.inner.code_buffer;
    if code.len() > NATIVE_WRAPPER_SIZE {
        return Err(PatchError::Encoding(format!(
            "native wrapper needs {} bytes",
            code.len()
        )));
    }
    Ok(NativeWrapper {
        code,
        return_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn mnemonics(code: &[u8], ip: u64) -> Vec<(u64, Mnemonic)> {
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            let inst = decoder.decode();
            out.push((inst.ip(), inst.mnemonic()));
        }
        out
    }

    #[test]
    fn test_exec_trampolines_shape() {
        let t = build_exec_trampolines(0x10_0000, 0x20_0000).unwrap();
        let insts = mnemonics(&t.code, 0x10_0000);

        assert_eq!(insts[0].1, Mnemonic::Pushfq);
        assert!(insts.iter().any(|&(_, m)| m == Mnemonic::Fxsave));
        let jmp = insts
            .iter()
            .position(|&(_, m)| m == Mnemonic::Jmp)
            .unwrap();
        // the epilogue starts right after the selector jump
        assert_eq!(insts[jmp + 1].0, t.epilogue);
        assert_eq!(insts.last().unwrap().1, Mnemonic::Ret);
    }

    #[test]
    fn test_exit_restores_rsp_after_stores() {
        let t = build_exec_trampolines(0x10_0000, 0x20_0000).unwrap();
        let offset = (t.epilogue - 0x10_0000) as usize;
        let mut decoder = Decoder::with_ip(64, &t.code[offset..], t.epilogue, DecoderOptions::NONE);
        let stores: Vec<_> = (0..17).map(|_| decoder.decode()).collect();

        for inst in &stores[..16] {
            assert_eq!(inst.mnemonic(), Mnemonic::Mov);
            assert!(inst.is_ip_rel_memory_operand());
            assert_eq!(inst.op0_kind(), iced_x86::OpKind::Memory);
        }
        assert_eq!(stores[15].op1_register(), Register::RSP);
        assert_eq!(stores[16].op0_register(), Register::RSP);
        assert_eq!(
            stores[16].ip_rel_memory_address(),
            0x20_0000 + HOST_SP_OFFSET as u64
        );
    }

    #[test]
    fn test_native_wrapper_returns_after_call() {
        let w = build_native_wrapper(0x10_0000, 0x20_0000, 0x10_0200).unwrap();
        let insts = mnemonics(&w.code, 0x10_0000);
        let call = insts
            .iter()
            .position(|&(_, m)| m == Mnemonic::Call)
            .unwrap();
        assert_eq!(insts[call + 1].0, w.return_address);
        assert!(w.code.len() <= NATIVE_WRAPPER_SIZE);
    }

    #[test]
    fn test_broker_gate_calls_through_selector() {
        let g = build_broker_gate(0x10_0000, 0x20_0000).unwrap();
        let mut decoder = Decoder::with_ip(64, &g.code, 0x10_0000, DecoderOptions::NONE);
        let call = std::iter::from_fn(|| decoder.can_decode().then(|| decoder.decode()))
            .find(|i| i.mnemonic() == Mnemonic::Call)
            .unwrap();
        assert_eq!(call.code(), Code::Call_rm64);
        assert_eq!(
            call.ip_rel_memory_address(),
            0x20_0000 + SELECTOR_OFFSET as u64
        );
        assert_eq!(call.next_ip(), g.return_address);
    }
}
