// This module is the instrumentation surface of rewire. An InstrRule inspects the analysis
// of one guest instruction and, through a HookBuilder, emits relocatable operations at the
// pre-instruction or post-instruction position. Each hook region gets its own scratch
// register manager, so the region is wrapped in spill and reload sequences tagged with the
// hook's position. Three rules are built in: MemoryAccessRule captures the explicit memory
// operand's address and value into reserved shadow slots, CallbackRule hands control back
// to the engine so it can run a host closure, and ExecutionCounter keeps a flag-neutral
// per-instruction counter in a user shadow. The callback-facing types (VmState, HookAction,
// MemoryAccess) live here as well.

//! Instrumentation rules and hook building.

use std::ops::Range;

use iced_x86::{Instruction, MemoryOperand, Mnemonic};

use crate::core::error::PatchError;
use crate::core::reloc::{RelocOp, RelocTag, RelocatableInst};
use crate::core::shadow::ShadowAllocator;
use crate::core::temp_manager::{RegSet, TempBinding, TempManager};
use crate::core::types::{
    Constant, Offset, Operand, Reg, Shadow, Temp, MEM_READ_ADDRESS_TAG, MEM_READ_VALUE_TAG,
    MEM_WRITE_ADDRESS_TAG, MEM_WRITE_VALUE_TAG,
};
use crate::x64::context::{FprState, GprState, CALLBACK_OFFSET, ORIGIN_OFFSET, SELECTOR_OFFSET};
use crate::x64::decoder::InstAnalysis;
use crate::x64::encoder;

pub use crate::x64::decoder::MemoryAccessType;

/// Position of a hook relative to the instrumented instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstPosition {
    PreInst,
    PostInst,
}

/// What a hook region does; selects its relocation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    MemoryAccess,
    Callback,
}

impl HookKind {
    pub fn tag(self, position: InstPosition) -> RelocTag {
        match (position, self) {
            (InstPosition::PreInst, HookKind::MemoryAccess) => RelocTag::PreInstMemAccess,
            (InstPosition::PreInst, HookKind::Callback) => RelocTag::PreInstCallback,
            (InstPosition::PostInst, HookKind::MemoryAccess) => RelocTag::PostInstMemAccess,
            (InstPosition::PostInst, HookKind::Callback) => RelocTag::PostInstCallback,
        }
    }
}

/// Value returned by a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Resume right after the hook.
    Continue,
    /// Return from `Engine::run`.
    Stop,
    /// Continue at `gpr.rip` as set by the callback.
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryAccessFlags(u8);

impl MemoryAccessFlags {
    pub const NONE: Self = Self(0);
    /// The access size has no value capture; `value` is zero.
    pub const UNKNOWN_VALUE: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One recorded memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub inst_address: u64,
    pub access_address: u64,
    pub value: u64,
    pub size: u32,
    pub kind: MemoryAccessType,
    pub flags: MemoryAccessFlags,
}

/// Guest state handed to a callback.
pub struct VmState<'a> {
    pub gpr: &'a mut GprState,
    pub fpr: &'a mut FprState,
    pub inst_address: u64,
    pub position: InstPosition,
    pub memory_accesses: &'a [MemoryAccess],
}

/// Host closure invoked from translated code.
pub type Callback = Box<dyn FnMut(&mut VmState<'_>) -> HookAction>;

/// Decides which hooks an instruction gets.
pub trait InstrRule {
    fn instrument(
        &self,
        analysis: &InstAnalysis,
        hooks: &mut HookBuilder<'_>,
    ) -> Result<(), PatchError>;
}

/// Output of one closed hook region.
#[derive(Debug, Clone)]
pub(crate) struct HookOutput {
    pub position: InstPosition,
    pub kind: HookKind,
    pub insts: Vec<RelocatableInst>,
    pub bindings: Vec<TempBinding>,
}

/// Collects hook regions for one instruction.
pub struct HookBuilder<'g> {
    analysis: &'g InstAnalysis,
    shadows: &'g mut ShadowAllocator,
    reserved: RegSet,
    pub(crate) outputs: Vec<HookOutput>,
}

impl<'g> HookBuilder<'g> {
    pub(crate) fn new(analysis: &'g InstAnalysis, shadows: &'g mut ShadowAllocator) -> Self {
        Self {
            analysis,
            shadows,
            reserved: analysis.reserved_regs(),
            outputs: Vec::new(),
        }
    }

    pub fn analysis(&self) -> &InstAnalysis {
        self.analysis
    }

    /// Open a hook region at `position` and fill it with `build`.
    pub fn at<F>(&mut self, position: InstPosition, kind: HookKind, build: F) -> Result<(), PatchError>
    where
        F: FnOnce(&mut HookRegion<'_>) -> Result<(), PatchError>,
    {
        let temps = TempManager::new(self.analysis.address, self.reserved);
        self.region(position, kind, temps, build)
    }

    /// Like [`HookBuilder::at`], but the region may use [`Temp::INTERNAL`].
    pub(crate) fn at_internal<F>(
        &mut self,
        position: InstPosition,
        kind: HookKind,
        build: F,
    ) -> Result<(), PatchError>
    where
        F: FnOnce(&mut HookRegion<'_>) -> Result<(), PatchError>,
    {
        let temps = TempManager::internal(self.analysis.address, self.reserved);
        self.region(position, kind, temps, build)
    }

    fn region<F>(
        &mut self,
        position: InstPosition,
        kind: HookKind,
        temps: TempManager,
        build: F,
    ) -> Result<(), PatchError>
    where
        F: FnOnce(&mut HookRegion<'_>) -> Result<(), PatchError>,
    {
        let mut region = HookRegion {
            analysis: self.analysis,
            temps,
            shadows: &mut *self.shadows,
            ops: Vec::new(),
            tail: Vec::new(),
        };
        build(&mut region)?;

        let tag = kind.tag(position);
        let mut insts = region.temps.save_sequence(tag);
        insts.extend(region.ops.iter().map(|&op| RelocatableInst::new(tag, op)));
        insts.extend(region.temps.restore_sequence(tag));
        insts.extend(region.tail.iter().map(|&op| RelocatableInst::new(tag, op)));

        self.outputs.push(HookOutput {
            position,
            kind,
            insts,
            bindings: region.temps.bindings(tag).collect(),
        });
        Ok(())
    }
}

/// One hook region under construction.
pub struct HookRegion<'r> {
    analysis: &'r InstAnalysis,
    temps: TempManager,
    shadows: &'r mut ShadowAllocator,
    ops: Vec<RelocOp>,
    tail: Vec<RelocOp>,
}

impl HookRegion<'_> {
    pub fn analysis(&self) -> &InstAnalysis {
        self.analysis
    }

    pub fn temp(&mut self, temp: Temp) -> Result<Reg, PatchError> {
        self.temps.get(temp)
    }

    pub fn shadow(&mut self, tag: u16) -> Result<Shadow, PatchError> {
        self.shadows.allocate(tag)
    }

    pub fn fresh_shadow(&mut self) -> Result<Shadow, PatchError> {
        self.shadows.allocate_fresh()
    }

    pub(crate) fn memory_shadow(&mut self, tag: u16) -> Result<Shadow, PatchError> {
        self.shadows.allocate_memory(tag)
    }

    pub fn emit(&mut self, op: RelocOp) {
        self.ops.push(op);
    }

    pub fn inst(&mut self, inst: Instruction) {
        self.ops.push(RelocOp::Inst(inst));
    }

    /// Load the effective address of memory operand `operand` into `dst`.
    pub fn lea_operand(&mut self, dst: Reg, operand: Operand) -> Result<(), PatchError> {
        let info = self
            .analysis
            .memory
            .filter(|m| m.operand == operand)
            .ok_or_else(|| PatchError::Unsupported {
                address: self.analysis.address,
                reason: format!("operand {} is not the memory operand", operand.0),
            })?;

        match info.absolute {
            Some(address) => self.emit(RelocOp::MovImm {
                dst,
                imm: Constant(address),
            }),
            None => {
                let mem = encoder::operand_memory(&self.analysis.instruction);
                self.inst(encoder::lea(dst, mem)?);
            }
        }
        Ok(())
    }

    /// Hand control to the host; execution resumes right after this point.
    pub(crate) fn exit_to_host(&mut self) {
        self.tail.push(RelocOp::JmpEpilogue);
        self.tail.push(RelocOp::ResumePoint);
    }
}

/// Records the explicit memory operand into reserved shadows.
#[derive(Debug, Clone, Copy)]
pub struct MemoryAccessRule {
    pub kinds: MemoryAccessType,
}

impl InstrRule for MemoryAccessRule {
    fn instrument(&self, analysis: &InstAnalysis, hooks: &mut HookBuilder<'_>) -> Result<(), PatchError> {
        let Some(access) = analysis.memory else {
            return Ok(());
        };
        if !access.recordable || !access.kind.intersects(self.kinds) {
            return Ok(());
        }
        let read = access.kind.contains(MemoryAccessType::READ)
            && self.kinds.contains(MemoryAccessType::READ);
        let write = access.kind.contains(MemoryAccessType::WRITE)
            && self.kinds.contains(MemoryAccessType::WRITE);
        let with_value = access.value_size_supported();

        hooks.at(InstPosition::PreInst, HookKind::MemoryAccess, |r| {
            let t = r.temp(Temp(0))?;
            r.lea_operand(t, access.operand)?;
            if write {
                let shadow = r.memory_shadow(MEM_WRITE_ADDRESS_TAG)?;
                r.emit(RelocOp::StoreShadow { src: t, shadow });
            }
            if read {
                let shadow = r.memory_shadow(MEM_READ_ADDRESS_TAG)?;
                r.emit(RelocOp::StoreShadow { src: t, shadow });
                if with_value {
                    r.inst(encoder::load_sized(t, t, access.size)?);
                    let shadow = r.memory_shadow(MEM_READ_VALUE_TAG)?;
                    r.emit(RelocOp::StoreShadow { src: t, shadow });
                }
            }
            Ok(())
        })?;

        if write && with_value {
            hooks.at(InstPosition::PostInst, HookKind::MemoryAccess, |r| {
                let t = r.temp(Temp(0))?;
                let address = r.memory_shadow(MEM_WRITE_ADDRESS_TAG)?;
                r.emit(RelocOp::LoadShadow { dst: t, shadow: address });
                r.inst(encoder::load_sized(t, t, access.size)?);
                let value = r.memory_shadow(MEM_WRITE_VALUE_TAG)?;
                r.emit(RelocOp::StoreShadow { src: t, shadow: value });
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Selects the instructions a callback applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstFilter {
    All,
    Address(u64),
    Range(Range<u64>),
    Mnemonic(Mnemonic),
    /// Instructions whose recordable explicit access matches.
    MemoryAccess(MemoryAccessType),
}

impl InstFilter {
    pub fn matches(&self, analysis: &InstAnalysis) -> bool {
        match self {
            InstFilter::All => true,
            InstFilter::Address(addr) => analysis.address == *addr,
            InstFilter::Range(range) => range.contains(&analysis.address),
            InstFilter::Mnemonic(m) => analysis.mnemonic == *m,
            InstFilter::MemoryAccess(kind) => analysis
                .memory
                .map_or(false, |m| m.recordable && m.kind.intersects(*kind)),
        }
    }
}

/// Exits to the engine so it can run callback `id`.
#[derive(Debug, Clone)]
pub struct CallbackRule {
    pub id: u32,
    pub position: InstPosition,
    pub filter: InstFilter,
}

impl InstrRule for CallbackRule {
    fn instrument(&self, analysis: &InstAnalysis, hooks: &mut HookBuilder<'_>) -> Result<(), PatchError> {
        if !self.filter.matches(analysis) {
            return Ok(());
        }
        let id = self.id;
        hooks.at_internal(self.position, HookKind::Callback, |r| {
            let t = r.temp(Temp::INTERNAL)?;
            r.emit(RelocOp::MovImm {
                dst: t,
                imm: Constant(u64::from(id)),
            });
            r.emit(RelocOp::StoreContext {
                src: t,
                offset: Offset::from(CALLBACK_OFFSET),
            });
            r.emit(RelocOp::LoadPatchId { dst: t });
            r.emit(RelocOp::StoreContext {
                src: t,
                offset: Offset::from(ORIGIN_OFFSET),
            });
            r.emit(RelocOp::LoadResumeAddress { dst: t });
            r.emit(RelocOp::StoreContext {
                src: t,
                offset: Offset::from(SELECTOR_OFFSET),
            });
            r.exit_to_host();
            Ok(())
        })
    }
}

/// Counts executions of matching instructions in shadow `tag`.
///
/// The counter is updated with `lea`, so guest flags are untouched. Read it
/// back with `Engine::shadow_value`.
#[derive(Debug, Clone)]
pub struct ExecutionCounter {
    pub tag: u16,
    pub filter: InstFilter,
}

impl InstrRule for ExecutionCounter {
    fn instrument(&self, analysis: &InstAnalysis, hooks: &mut HookBuilder<'_>) -> Result<(), PatchError> {
        if !self.filter.matches(analysis) {
            return Ok(());
        }
        let tag = self.tag;
        hooks.at(InstPosition::PreInst, HookKind::Callback, |r| {
            let t = r.temp(Temp(0))?;
            let shadow = r.shadow(tag)?;
            r.emit(RelocOp::LoadShadow { dst: t, shadow });
            r.inst(encoder::lea(t, MemoryOperand::with_base_displ(t.into(), 1))?);
            r.emit(RelocOp::StoreShadow { src: t, shadow });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::decoder::decode;

    fn build(analysis: &InstAnalysis, rule: &dyn InstrRule) -> (Vec<HookOutput>, ShadowAllocator) {
        let mut shadows = ShadowAllocator::new();
        let outputs = {
            let mut hooks = HookBuilder::new(analysis, &mut shadows);
            rule.instrument(analysis, &mut hooks).unwrap();
            hooks.outputs
        };
        (outputs, shadows)
    }

    #[test]
    fn test_memory_read_hook() {
        // mov rax, [rbx+8]
        let a = decode(&[0x48, 0x8b, 0x43, 0x08], 0x1000).unwrap();
        let rule = MemoryAccessRule {
            kinds: MemoryAccessType::READ_WRITE,
        };
        let (outputs, shadows) = build(&a, &rule);

        assert_eq!(outputs.len(), 1);
        let pre = &outputs[0];
        assert_eq!(pre.position, InstPosition::PreInst);
        assert!(pre.insts.iter().all(|i| i.tag == RelocTag::PreInstMemAccess));
        // rax and rbx are used by the instruction, so the temp is rcx
        assert_eq!(pre.bindings[0].reg, Reg::new(2));
        assert!(shadows.contains(MEM_READ_ADDRESS_TAG));
        assert!(shadows.contains(MEM_READ_VALUE_TAG));
        assert!(!shadows.contains(MEM_WRITE_ADDRESS_TAG));

        // save, lea, store addr, load, store value, restore
        assert_eq!(pre.insts.len(), 6);
        assert!(matches!(pre.insts[0].op, RelocOp::StoreContext { .. }));
        assert!(matches!(pre.insts[5].op, RelocOp::LoadContext { .. }));
    }

    #[test]
    fn test_memory_write_hook_has_post_region() {
        // mov [rdi], esi
        let a = decode(&[0x89, 0x37], 0x1000).unwrap();
        let rule = MemoryAccessRule {
            kinds: MemoryAccessType::WRITE,
        };
        let (outputs, shadows) = build(&a, &rule);

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].position, InstPosition::PostInst);
        assert!(outputs[1]
            .insts
            .iter()
            .all(|i| i.tag == RelocTag::PostInstMemAccess));
        assert_eq!(shadows.len(), 2);
    }

    #[test]
    fn test_memory_rule_respects_kind() {
        // mov rax, [rbx+8] is only a read
        let a = decode(&[0x48, 0x8b, 0x43, 0x08], 0).unwrap();
        let rule = MemoryAccessRule {
            kinds: MemoryAccessType::WRITE,
        };
        let (outputs, _) = build(&a, &rule);
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_callback_hook_exits_to_host() {
        // nop
        let a = decode(&[0x90], 0x2000).unwrap();
        let rule = CallbackRule {
            id: 7,
            position: InstPosition::PostInst,
            filter: InstFilter::All,
        };
        let (outputs, _) = build(&a, &rule);

        let insts = &outputs[0].insts;
        assert!(insts.iter().all(|i| i.tag == RelocTag::PostInstCallback));
        assert_eq!(insts.last().unwrap().op, RelocOp::ResumePoint);
        assert_eq!(insts[insts.len() - 2].op, RelocOp::JmpEpilogue);
        assert!(matches!(insts[insts.len() - 3].op, RelocOp::LoadContext { .. }));
        assert!(insts.iter().any(|i| i.op
            == RelocOp::MovImm {
                dst: Reg::new(0),
                imm: Constant(7)
            }));
    }

    #[test]
    fn test_user_rule_cannot_use_internal_temp() {
        struct Greedy;
        impl InstrRule for Greedy {
            fn instrument(&self, _: &InstAnalysis, hooks: &mut HookBuilder<'_>) -> Result<(), PatchError> {
                hooks.at(InstPosition::PreInst, HookKind::Callback, |r| {
                    r.temp(Temp::INTERNAL)?;
                    Ok(())
                })
            }
        }

        let a = decode(&[0x90], 0).unwrap();
        let mut shadows = ShadowAllocator::new();
        let mut hooks = HookBuilder::new(&a, &mut shadows);
        assert_eq!(
            Greedy.instrument(&a, &mut hooks),
            Err(PatchError::ReservedTemp(0xFFFF_FFFF))
        );
    }

    #[test]
    fn test_filters() {
        let a = decode(&[0x48, 0x8b, 0x43, 0x08], 0x3000).unwrap();
        assert!(InstFilter::All.matches(&a));
        assert!(InstFilter::Address(0x3000).matches(&a));
        assert!(!InstFilter::Range(0..0x3000).matches(&a));
        assert!(InstFilter::Mnemonic(Mnemonic::Mov).matches(&a));
        assert!(InstFilter::MemoryAccess(MemoryAccessType::READ).matches(&a));
        assert!(!InstFilter::MemoryAccess(MemoryAccessType::WRITE).matches(&a));
    }
}
