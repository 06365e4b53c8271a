// This module generates the patch for one guest instruction. The body reproduces the
// instruction's semantics in a form that can run from any address: plain instructions are
// copied, RIP-relative operands are rebased onto a scratch register loaded with the absolute
// target, and every control transfer becomes a store of the next guest pc into the context
// (using cmovcc for conditional branches so that guest flags are never touched). The
// instrumentation rules then contribute hook regions, which are ordered by position and by
// the configured hook order and wrapped around the body with the checkpoint tags. A
// synthetic block-exit patch closes each basic block by leaving through the epilogue.

//! Patch generation for x86-64.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use iced_x86::{Code, OpKind, Register};

use crate::config::HookOrder;
use crate::core::error::PatchError;
use crate::core::reloc::{RelocOp, RelocTag, RelocatableInst};
use crate::core::shadow::ShadowAllocator;
use crate::core::temp_manager::{RegSet, TempBinding, TempManager};
use crate::core::types::{Constant, NativeReg, Offset, Reg, Shadow, Temp, REG_PC};
use crate::instrument::{
    HookBuilder, HookKind, HookOutput, InstPosition, InstrRule, MemoryAccessRule, MemoryAccessType,
};

use super::decoder::{FlowKind, InstAnalysis, MemoryAccessInfo};
use super::encoder;

/// Tagged sequence for one guest instruction, allocated in the translation arena.
#[derive(Debug)]
pub struct Patch<'a> {
    /// Guest address of the instruction (the fall-through address for block exits).
    pub address: u64,
    /// Guest instruction length; zero for block exits.
    pub size: u32,
    /// Whether the body stores the next guest pc itself.
    pub writes_pc: bool,
    pub insts: BumpVec<'a, RelocatableInst>,
    pub temps: BumpVec<'a, TempBinding>,
    pub shadows: BumpVec<'a, Shadow>,
    /// Memory access captured by the memory hooks, if any.
    pub access: Option<MemoryAccessInfo>,
    pub recorded: MemoryAccessType,
}

impl Patch<'_> {
    pub fn is_block_exit(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneratorConfig {
    /// Memory accesses captured for every instruction.
    pub record: MemoryAccessType,
    pub hook_order: HookOrder,
}

pub struct PatchGenerator {
    config: GeneratorConfig,
}

impl PatchGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// Generate the patch of `analysis`, applying `rules` in order.
    pub fn generate<'a, 'r, I>(
        &self,
        arena: &'a Bump,
        analysis: &InstAnalysis,
        rules: I,
    ) -> Result<Patch<'a>, PatchError>
    where
        I: IntoIterator<Item = &'r dyn InstrRule>,
    {
        let mut shadows = ShadowAllocator::new();
        let hooks = {
            let mut builder = HookBuilder::new(analysis, &mut shadows);
            if !self.config.record.is_none() {
                let memory = MemoryAccessRule {
                    kinds: self.config.record,
                };
                memory.instrument(analysis, &mut builder)?;
            }
            for rule in rules {
                rule.instrument(analysis, &mut builder)?;
            }
            builder.outputs
        };

        let mut temps = TempManager::new(analysis.address, analysis.reserved_regs());
        let mut body = Vec::new();
        translate_body(analysis, &mut temps, &mut body)?;

        let mut patch = Patch {
            address: analysis.address,
            size: analysis.size as u32,
            writes_pc: analysis.flow.writes_pc(),
            insts: BumpVec::new_in(arena),
            temps: BumpVec::new_in(arena),
            shadows: BumpVec::from_iter_in(shadows.allocated().iter().copied(), arena),
            access: None,
            recorded: MemoryAccessType::NONE,
        };
        if let Some(access) = analysis.memory {
            let recorded = access.kind & self.config.record;
            if access.recordable && !recorded.is_none() {
                patch.access = Some(access);
                patch.recorded = recorded;
            }
        }

        let (pre, post): (Vec<_>, Vec<_>) = hooks
            .into_iter()
            .partition(|h| h.position == InstPosition::PreInst);
        let pre = self.order(pre);
        let post = self.order(post);

        patch.insts.push(RelocatableInst::checkpoint(RelocTag::PatchBegin));
        for hook in &pre {
            patch.insts.extend(hook.insts.iter().copied());
            patch.temps.extend(hook.bindings.iter().copied());
        }
        patch.insts.push(RelocatableInst::checkpoint(RelocTag::PatchInstBegin));
        emit_body(&mut patch, &temps, body);
        patch.insts.push(RelocatableInst::checkpoint(RelocTag::PatchInstEnd));
        for hook in &post {
            patch.insts.extend(hook.insts.iter().copied());
            patch.temps.extend(hook.bindings.iter().copied());
        }

        log::trace!(
            "patch {:#x} {}: {} items, {} temps, {} shadows",
            analysis.address,
            analysis.mnemonic_name(),
            patch.insts.len(),
            patch.temps.len(),
            patch.shadows.len()
        );
        Ok(patch)
    }

    /// Patch that leaves the basic block, storing `next` as the guest pc when
    /// the previous instruction did not.
    pub fn block_exit<'a>(
        &self,
        arena: &'a Bump,
        next: u64,
        store_pc: bool,
    ) -> Result<Patch<'a>, PatchError> {
        let mut temps = TempManager::new(next, RegSet::new());
        let mut body = Vec::new();
        if store_pc {
            store_pc_imm(&mut temps, &mut body, next)?;
        }

        let mut patch = Patch {
            address: next,
            size: 0,
            writes_pc: true,
            insts: BumpVec::new_in(arena),
            temps: BumpVec::new_in(arena),
            shadows: BumpVec::new_in(arena),
            access: None,
            recorded: MemoryAccessType::NONE,
        };
        patch.insts.push(RelocatableInst::checkpoint(RelocTag::PatchBegin));
        patch.insts.push(RelocatableInst::checkpoint(RelocTag::PatchInstBegin));
        emit_body(&mut patch, &temps, body);
        patch
            .insts
            .push(RelocatableInst::new(RelocTag::RelocInst, RelocOp::JmpEpilogue));
        patch.insts.push(RelocatableInst::checkpoint(RelocTag::PatchInstEnd));
        Ok(patch)
    }

    fn order(&self, mut hooks: Vec<HookOutput>) -> Vec<HookOutput> {
        let rank = |kind: HookKind| match (self.config.hook_order, kind) {
            (HookOrder::MemoryAccessFirst, HookKind::MemoryAccess) => 0,
            (HookOrder::MemoryAccessFirst, HookKind::Callback) => 1,
            (HookOrder::CallbackFirst, HookKind::Callback) => 0,
            (HookOrder::CallbackFirst, HookKind::MemoryAccess) => 1,
        };
        hooks.sort_by_key(|h| rank(h.kind));
        hooks
    }
}

/// Saves, body ops and restores, in that order.
fn emit_body(patch: &mut Patch<'_>, temps: &TempManager, body: Vec<RelocOp>) {
    patch
        .insts
        .extend(temps.save_sequence(RelocTag::ChangeScratchRegister));
    patch.insts.extend(
        body.into_iter()
            .map(|op| RelocatableInst::new(RelocTag::RelocInst, op)),
    );
    patch
        .insts
        .extend(temps.restore_sequence(RelocTag::ChangeScratchRegister));
    patch
        .temps
        .extend(temps.bindings(RelocTag::ChangeScratchRegister));
}

fn unsupported(analysis: &InstAnalysis, reason: &str) -> PatchError {
    log::warn!(
        "unsupported {} at {:#x}: {}",
        analysis.mnemonic_name(),
        analysis.address,
        reason
    );
    PatchError::Unsupported {
        address: analysis.address,
        reason: reason.to_string(),
    }
}

fn store_pc(out: &mut Vec<RelocOp>, src: Reg) {
    out.push(RelocOp::StoreContext {
        src,
        offset: Offset::from(REG_PC),
    });
}

fn store_pc_imm(temps: &mut TempManager, out: &mut Vec<RelocOp>, target: u64) -> Result<(), PatchError> {
    let t = temps.get(Temp(0))?;
    out.push(RelocOp::MovImm {
        dst: t,
        imm: Constant(target),
    });
    store_pc(out, t);
    Ok(())
}

fn translate_body(
    analysis: &InstAnalysis,
    temps: &mut TempManager,
    out: &mut Vec<RelocOp>,
) -> Result<(), PatchError> {
    let inst = &analysis.instruction;
    let next = analysis.next_address();

    match analysis.flow {
        FlowKind::Next | FlowKind::Interrupt | FlowKind::Exception => {
            if inst.is_ip_rel_memory_operand() {
                let t = temps.get(Temp(0))?;
                out.push(RelocOp::MovImm {
                    dst: t,
                    imm: Constant(inst.ip_rel_memory_address()),
                });
                let mut rebased = *inst;
                rebased.set_memory_base(t.into());
                rebased.set_memory_displacement64(0);
                rebased.set_memory_displ_size(0);
                out.push(RelocOp::Inst(rebased));
            } else {
                out.push(RelocOp::Inst(*inst));
            }
        }
        FlowKind::Jump => {
            if !inst.is_jmp_short_or_near() {
                return Err(unsupported(analysis, "far jump"));
            }
            store_pc_imm(temps, out, inst.near_branch_target())?;
        }
        FlowKind::ConditionalJump => {
            if !inst.is_jcc_short_or_near() {
                return Err(unsupported(analysis, "counter-based branch"));
            }
            let fallthrough = temps.get(Temp(0))?;
            let taken = temps.get(Temp(1))?;
            out.push(RelocOp::MovImm {
                dst: fallthrough,
                imm: Constant(next),
            });
            out.push(RelocOp::MovImm {
                dst: taken,
                imm: Constant(inst.near_branch_target()),
            });
            out.push(RelocOp::Inst(encoder::cmov(
                inst.condition_code(),
                fallthrough,
                taken,
            )?));
            store_pc(out, fallthrough);
        }
        FlowKind::Call => {
            if inst.code() != Code::Call_rel32_64 {
                return Err(unsupported(analysis, "call form"));
            }
            let t = temps.get(Temp(0))?;
            out.push(RelocOp::MovImm {
                dst: t,
                imm: Constant(next),
            });
            out.push(RelocOp::Inst(encoder::push(t)?));
            out.push(RelocOp::MovImm {
                dst: t,
                imm: Constant(inst.near_branch_target()),
            });
            store_pc(out, t);
        }
        FlowKind::IndirectCall | FlowKind::IndirectJump => {
            let is_call = analysis.flow == FlowKind::IndirectCall;
            let supported = if is_call {
                inst.code() == Code::Call_rm64
            } else {
                inst.code() == Code::Jmp_rm64
            };
            if !supported {
                return Err(unsupported(analysis, "indirect transfer form"));
            }
            let target = temps.get(Temp(0))?;
            load_target(analysis, target, out)?;
            if is_call {
                let ret = temps.get(Temp(1))?;
                out.push(RelocOp::MovImm {
                    dst: ret,
                    imm: Constant(next),
                });
                out.push(RelocOp::Inst(encoder::push(ret)?));
            }
            store_pc(out, target);
        }
        FlowKind::Return => {
            let pop_bytes = match inst.code() {
                Code::Retnq => 0,
                Code::Retnq_imm16 => i64::from(inst.immediate16()),
                _ => return Err(unsupported(analysis, "return form")),
            };
            let t = temps.get(Temp(0))?;
            out.push(RelocOp::Inst(encoder::pop(t)?));
            if pop_bytes != 0 {
                out.push(RelocOp::Inst(encoder::adjust_stack(pop_bytes)?));
            }
            store_pc(out, t);
        }
        FlowKind::Transactional => {
            return Err(unsupported(analysis, "transactional memory"));
        }
    }
    Ok(())
}

/// Load the target of an indirect call or jump into `dst`.
fn load_target(analysis: &InstAnalysis, dst: Reg, out: &mut Vec<RelocOp>) -> Result<(), PatchError> {
    let inst = &analysis.instruction;
    match inst.op0_kind() {
        OpKind::Register => {
            let src = Reg::lookup(NativeReg::new(inst.op0_register()))
                .ok_or_else(|| unsupported(analysis, "branch register"))?;
            out.push(RelocOp::Inst(encoder::mov_reg(dst, src)?));
        }
        OpKind::Memory if inst.is_ip_rel_memory_operand() => {
            out.push(RelocOp::MovImm {
                dst,
                imm: Constant(inst.ip_rel_memory_address()),
            });
            out.push(RelocOp::Inst(encoder::load_sized(dst, dst, 8)?));
        }
        OpKind::Memory => {
            let mem = encoder::operand_memory(inst);
            out.push(RelocOp::Inst(encoder::load(Register::from(dst), mem)?));
        }
        _ => return Err(unsupported(analysis, "branch operand")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reloc::validate_patch;
    use crate::core::test_utils::test::TestContext;
    use crate::instrument::{CallbackRule, InstFilter};
    use crate::x64::decoder::decode;
    use iced_x86::Mnemonic;

    fn no_rules() -> std::iter::Empty<&'static dyn InstrRule> {
        std::iter::empty()
    }

    fn body_ops(patch: &Patch<'_>) -> Vec<RelocOp> {
        patch
            .insts
            .iter()
            .filter(|i| i.tag == RelocTag::RelocInst)
            .map(|i| i.op)
            .collect()
    }

    #[test]
    fn test_plain_instruction_copied() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());
        // add rax, rbx
        let a = decode(&[0x48, 0x01, 0xd8], 0x1000).unwrap();
        let patch = gen.generate(ctx.arena(), &a, no_rules()).unwrap();

        assert_eq!(validate_patch(&patch.insts), Ok(()));
        assert_eq!(patch.insts.len(), 4);
        assert_eq!(body_ops(&patch), vec![RelocOp::Inst(a.instruction)]);
        assert!(patch.temps.is_empty());
        assert!(!patch.writes_pc);
    }

    #[test]
    fn test_rip_relative_rebased() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());
        // mov rax, [rip+0x10]
        let a = decode(&[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00], 0x4000).unwrap();
        let patch = gen.generate(ctx.arena(), &a, no_rules()).unwrap();

        let ops = body_ops(&patch);
        // rax is the destination, so the temp is rbx
        assert_eq!(
            ops[0],
            RelocOp::MovImm {
                dst: Reg::new(1),
                imm: Constant(0x4017)
            }
        );
        let RelocOp::Inst(rebased) = ops[1] else {
            panic!("expected instruction");
        };
        assert_eq!(rebased.memory_base(), Register::RBX);
        assert!(!rebased.is_ip_rel_memory_operand());
        assert_eq!(patch.temps.len(), 1);
        assert_eq!(validate_patch(&patch.insts), Ok(()));
    }

    #[test]
    fn test_conditional_branch_uses_cmov() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());
        // jne +0x10
        let a = decode(&[0x75, 0x10], 0x1000).unwrap();
        let patch = gen.generate(ctx.arena(), &a, no_rules()).unwrap();

        let ops = body_ops(&patch);
        assert_eq!(
            ops[0],
            RelocOp::MovImm {
                dst: Reg::new(0),
                imm: Constant(0x1002)
            }
        );
        assert_eq!(
            ops[1],
            RelocOp::MovImm {
                dst: Reg::new(1),
                imm: Constant(0x1012)
            }
        );
        let RelocOp::Inst(cmov) = ops[2] else {
            panic!("expected cmov");
        };
        assert_eq!(cmov.mnemonic(), Mnemonic::Cmovne);
        assert_eq!(
            ops[3],
            RelocOp::StoreContext {
                src: Reg::new(0),
                offset: Offset::from(REG_PC)
            }
        );
        assert!(patch.writes_pc);
    }

    #[test]
    fn test_call_and_ret() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());

        // call +0x20
        let call = decode(&[0xe8, 0x20, 0x00, 0x00, 0x00], 0x1000).unwrap();
        let patch = gen.generate(ctx.arena(), &call, no_rules()).unwrap();
        let ops = body_ops(&patch);
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[1], RelocOp::Inst(i) if i.mnemonic() == Mnemonic::Push));
        assert_eq!(
            ops[2],
            RelocOp::MovImm {
                dst: Reg::new(0),
                imm: Constant(0x1025)
            }
        );

        // ret 8
        let ret = decode(&[0xc2, 0x08, 0x00], 0x2000).unwrap();
        let patch = gen.generate(ctx.arena(), &ret, no_rules()).unwrap();
        let ops = body_ops(&patch);
        assert!(matches!(ops[0], RelocOp::Inst(i) if i.mnemonic() == Mnemonic::Pop));
        assert!(matches!(ops[1], RelocOp::Inst(i) if i.mnemonic() == Mnemonic::Lea));
        assert_eq!(validate_patch(&patch.insts), Ok(()));
    }

    #[test]
    fn test_indirect_call_reads_target_before_push() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());
        // call [rsp+8]
        let a = decode(&[0xff, 0x54, 0x24, 0x08], 0x1000).unwrap();
        let patch = gen.generate(ctx.arena(), &a, no_rules()).unwrap();
        let ops = body_ops(&patch);

        let RelocOp::Inst(load) = ops[0] else {
            panic!("expected load");
        };
        assert_eq!(load.memory_base(), Register::RSP);
        assert!(matches!(ops[2], RelocOp::Inst(i) if i.mnemonic() == Mnemonic::Push));
    }

    #[test]
    fn test_unsupported_forms() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());
        // loop -2, jrcxz +0, xbegin +0
        for bytes in [&[0xe2, 0xfe][..], &[0xe3, 0x00], &[0xc7, 0xf8, 0, 0, 0, 0]] {
            let a = decode(bytes, 0x1000).unwrap();
            assert!(matches!(
                gen.generate(ctx.arena(), &a, no_rules()),
                Err(PatchError::Unsupported { address: 0x1000, .. })
            ));
        }
    }

    #[test]
    fn test_hook_order() {
        let ctx = TestContext::new();
        let callback = CallbackRule {
            id: 1,
            position: InstPosition::PreInst,
            filter: InstFilter::All,
        };
        let rules: Vec<&dyn InstrRule> = vec![&callback];
        // mov rax, [rbx+8]
        let a = decode(&[0x48, 0x8b, 0x43, 0x08], 0x1000).unwrap();

        let first_pre_tag = |order| {
            let gen = PatchGenerator::new(GeneratorConfig {
                record: MemoryAccessType::READ,
                hook_order: order,
            });
            let patch = gen.generate(ctx.arena(), &a, rules.iter().copied()).unwrap();
            assert_eq!(validate_patch(&patch.insts), Ok(()));
            patch.insts[1].tag
        };
        assert_eq!(
            first_pre_tag(HookOrder::MemoryAccessFirst),
            RelocTag::PreInstMemAccess
        );
        assert_eq!(
            first_pre_tag(HookOrder::CallbackFirst),
            RelocTag::PreInstCallback
        );
    }

    #[test]
    fn test_recorded_access_attached() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig {
            record: MemoryAccessType::READ_WRITE,
            hook_order: HookOrder::default(),
        });
        // add dword [rcx], 1
        let a = decode(&[0x83, 0x01, 0x01], 0x1000).unwrap();
        let patch = gen.generate(ctx.arena(), &a, no_rules()).unwrap();

        assert_eq!(patch.access.unwrap().kind, MemoryAccessType::READ_WRITE);
        assert_eq!(patch.shadows.len(), 4);
        assert!(patch
            .insts
            .iter()
            .any(|i| i.tag == RelocTag::PostInstMemAccess));
        assert_eq!(validate_patch(&patch.insts), Ok(()));
    }

    #[test]
    fn test_block_exit() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig::default());

        let exit = gen.block_exit(ctx.arena(), 0x1234, true).unwrap();
        assert!(exit.is_block_exit());
        assert_eq!(validate_patch(&exit.insts), Ok(()));
        let ops = body_ops(&exit);
        assert_eq!(
            ops[0],
            RelocOp::MovImm {
                dst: Reg::new(0),
                imm: Constant(0x1234)
            }
        );
        assert_eq!(*ops.last().unwrap(), RelocOp::JmpEpilogue);

        let bare = gen.block_exit(ctx.arena(), 0x1234, false).unwrap();
        assert_eq!(body_ops(&bare), vec![RelocOp::JmpEpilogue]);
        assert!(ctx.memory_used() > 0);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let ctx = TestContext::new();
        let gen = PatchGenerator::new(GeneratorConfig {
            record: MemoryAccessType::READ_WRITE,
            hook_order: HookOrder::default(),
        });
        // push qword [rax+rbx*8]
        let a = decode(&[0xff, 0x34, 0xd8], 0x1000).unwrap();
        let first = gen.generate(ctx.arena(), &a, no_rules()).unwrap();
        let second = gen.generate(ctx.arena(), &a, no_rules()).unwrap();
        assert_eq!(&first.insts[..], &second.insts[..]);
    }
}
