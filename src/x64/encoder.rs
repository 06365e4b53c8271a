// This module turns relocatable patch sequences into machine code with iced-x86. The
// instruction helpers build the fixed set of flag-neutral instructions patch code is made
// of: 64-bit immediate loads, register moves, RIP-relative loads and stores of context and
// shadow slots, lea, sized zero-extending loads, push/pop and cmovcc. The Resolver lowers
// every placement-dependent item once the exec block has chosen an address and slot layout
// and encodes the result with the block encoder. Resume addresses point into the very code
// being encoded, so resolution runs twice: the first pass lays the code out with
// placeholder addresses, the second re-encodes with the real ones and must produce the
// same length.

//! Instruction helpers and placement-time resolution.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, ConditionCode, Instruction, InstructionBlock,
    MemoryOperand, Register,
};

use crate::core::error::PatchError;
use crate::core::reloc::RelocOp;
use crate::core::types::{Reg, Shadow};

use super::patch::Patch;

/// RIP-relative operand addressing the absolute `address`.
pub fn rip_mem(address: u64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::RIP, address as i64)
}

pub fn mov_imm(dst: Reg, imm: u64) -> Result<Instruction, PatchError> {
    Ok(Instruction::with2(Code::Mov_r64_imm64, Register::from(dst), imm)?)
}

pub fn mov_reg(dst: Reg, src: Reg) -> Result<Instruction, PatchError> {
    Ok(Instruction::with2(
        Code::Mov_r64_rm64,
        Register::from(dst),
        Register::from(src),
    )?)
}

pub fn load(dst: Register, mem: MemoryOperand) -> Result<Instruction, PatchError> {
    Ok(Instruction::with2(Code::Mov_r64_rm64, dst, mem)?)
}

pub fn store(mem: MemoryOperand, src: Register) -> Result<Instruction, PatchError> {
    Ok(Instruction::with2(Code::Mov_rm64_r64, mem, src)?)
}

pub fn lea(dst: Reg, mem: MemoryOperand) -> Result<Instruction, PatchError> {
    Ok(Instruction::with2(Code::Lea_r64_m, Register::from(dst), mem)?)
}

/// Zero-extending load of `size` bytes at `[base]` into `dst`.
pub fn load_sized(dst: Reg, base: Reg, size: u32) -> Result<Instruction, PatchError> {
    let mem = MemoryOperand::with_base(Register::from(base));
    let dst64 = Register::from(dst);
    let inst = match size {
        1 => Instruction::with2(Code::Movzx_r64_rm8, dst64, mem)?,
        2 => Instruction::with2(Code::Movzx_r64_rm16, dst64, mem)?,
        4 => Instruction::with2(Code::Mov_r32_rm32, dst64.full_register32(), mem)?,
        8 => Instruction::with2(Code::Mov_r64_rm64, dst64, mem)?,
        _ => {
            return Err(PatchError::Encoding(format!(
                "no sized load for {size} bytes"
            )))
        }
    };
    Ok(inst)
}

pub fn push(reg: Reg) -> Result<Instruction, PatchError> {
    Ok(Instruction::with1(Code::Push_r64, Register::from(reg))?)
}

pub fn pop(reg: Reg) -> Result<Instruction, PatchError> {
    Ok(Instruction::with1(Code::Pop_r64, Register::from(reg))?)
}

/// `lea rsp, [rsp + delta]`, leaving flags untouched.
pub fn adjust_stack(delta: i64) -> Result<Instruction, PatchError> {
    let mem = MemoryOperand::with_base_displ(Register::RSP, delta);
    Ok(Instruction::with2(Code::Lea_r64_m, Register::RSP, mem)?)
}

pub fn cmov(cc: ConditionCode, dst: Reg, src: Reg) -> Result<Instruction, PatchError> {
    let code = match cc {
        ConditionCode::o => Code::Cmovo_r64_rm64,
        ConditionCode::no => Code::Cmovno_r64_rm64,
        ConditionCode::b => Code::Cmovb_r64_rm64,
        ConditionCode::ae => Code::Cmovae_r64_rm64,
        ConditionCode::e => Code::Cmove_r64_rm64,
        ConditionCode::ne => Code::Cmovne_r64_rm64,
        ConditionCode::be => Code::Cmovbe_r64_rm64,
        ConditionCode::a => Code::Cmova_r64_rm64,
        ConditionCode::s => Code::Cmovs_r64_rm64,
        ConditionCode::ns => Code::Cmovns_r64_rm64,
        ConditionCode::p => Code::Cmovp_r64_rm64,
        ConditionCode::np => Code::Cmovnp_r64_rm64,
        ConditionCode::l => Code::Cmovl_r64_rm64,
        ConditionCode::ge => Code::Cmovge_r64_rm64,
        ConditionCode::le => Code::Cmovle_r64_rm64,
        ConditionCode::g => Code::Cmovg_r64_rm64,
        _ => return Err(PatchError::Encoding(format!("no cmov for {cc:?}"))),
    };
    Ok(Instruction::with2(code, Register::from(dst), Register::from(src))?)
}

pub fn jmp(target: u64) -> Result<Instruction, PatchError> {
    Ok(Instruction::with_branch(Code::Jmp_rel32_64, target)?)
}

/// Memory operand of a decoded instruction that has a base or index register.
pub fn operand_memory(inst: &Instruction) -> MemoryOperand {
    let displacement = inst.memory_displacement64() as i64;
    let displ_size = if displacement == 0 {
        0
    } else if i8::try_from(displacement).is_ok() {
        1
    } else {
        4
    };
    MemoryOperand::new(
        inst.memory_base(),
        inst.memory_index(),
        inst.memory_index_scale(),
        displacement,
        displ_size,
        false,
        inst.segment_prefix(),
    )
}

/// Slot assignment of one patch: tag -> slot index in the data region.
pub type SlotMap = Vec<(u16, usize)>;

/// Where a run of patches is being placed.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'p> {
    pub code_address: u64,
    pub context_address: u64,
    pub shadow_base: u64,
    pub epilogue_address: u64,
    /// Id of the first patch of the run inside its exec block.
    pub first_patch_id: u64,
    /// One entry per patch.
    pub slots: &'p [SlotMap],
}

impl Placement<'_> {
    fn slot_address(&self, patch: usize, shadow: Shadow) -> Option<u64> {
        self.slots
            .get(patch)?
            .iter()
            .find(|(tag, _)| *tag == shadow.tag())
            .map(|&(_, slot)| self.shadow_base + (slot * 8) as u64)
    }
}

/// Machine code for a run of patches.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub code: Vec<u8>,
    /// Offset of each patch's first byte in `code`.
    pub patch_offsets: Vec<usize>,
}

struct Lowered {
    insts: Vec<Instruction>,
    patch_starts: Vec<usize>,
    resume_points: Vec<usize>,
}

pub struct Resolver<'p> {
    placement: Placement<'p>,
}

impl<'p> Resolver<'p> {
    pub fn new(placement: Placement<'p>) -> Self {
        Self { placement }
    }

    pub fn resolve(&self, patches: &[Patch<'_>]) -> Result<Resolved, PatchError> {
        let base = self.placement.code_address;

        let first = self.lower(patches, &[])?;
        let (first_code, first_offsets) = encode(&first.insts, base)?;

        let resume: Vec<u64> = first
            .resume_points
            .iter()
            .map(|&idx| base + offset_of_inst(&first_offsets, idx, first_code.len()) as u64)
            .collect();

        let second = self.lower(patches, &resume)?;
        let (code, offsets) = encode(&second.insts, base)?;
        if code.len() != first_code.len() {
            return Err(PatchError::LayoutMismatch {
                first: first_code.len(),
                second: code.len(),
            });
        }

        let patch_offsets = second
            .patch_starts
            .iter()
            .map(|&idx| offset_of_inst(&offsets, idx, code.len()))
            .collect();
        log::trace!(
            "resolved {} patches into {} bytes at {:#x}",
            patches.len(),
            code.len(),
            base
        );
        Ok(Resolved {
            code,
            patch_offsets,
        })
    }

    fn lower(&self, patches: &[Patch<'_>], resume: &[u64]) -> Result<Lowered, PatchError> {
        let p = &self.placement;
        let ctx = |offset: i64| rip_mem(p.context_address.wrapping_add(offset as u64));
        let mut insts = Vec::new();
        let mut patch_starts = Vec::with_capacity(patches.len());
        let mut resume_points = Vec::new();
        let mut resume_requests = 0usize;

        for (pi, patch) in patches.iter().enumerate() {
            patch_starts.push(insts.len());
            for (index, item) in patch.insts.iter().enumerate() {
                let missing_slot = || PatchError::MalformedPatch {
                    tag: item.tag,
                    index,
                    reason: "shadow has no slot",
                };
                match item.op {
                    RelocOp::Checkpoint => {}
                    RelocOp::ResumePoint => resume_points.push(insts.len()),
                    RelocOp::Inst(mut inst) => {
                        // guest ips would collide across copies and could alias branch targets
                        inst.set_ip(0);
                        insts.push(inst);
                    }
                    RelocOp::MovImm { dst, imm } => insts.push(mov_imm(dst, imm.0)?),
                    RelocOp::LoadContext { dst, offset } => {
                        insts.push(load(dst.into(), ctx(offset.0))?)
                    }
                    RelocOp::StoreContext { src, offset } => {
                        insts.push(store(ctx(offset.0), src.into())?)
                    }
                    RelocOp::LoadShadow { dst, shadow } => {
                        if shadow.is_tagged() {
                            let addr = p.slot_address(pi, shadow).ok_or_else(missing_slot)?;
                            insts.push(load(dst.into(), rip_mem(addr))?);
                        }
                    }
                    RelocOp::StoreShadow { src, shadow } => {
                        if shadow.is_tagged() {
                            let addr = p.slot_address(pi, shadow).ok_or_else(missing_slot)?;
                            insts.push(store(rip_mem(addr), src.into())?);
                        }
                    }
                    RelocOp::LoadPatchId { dst } => {
                        insts.push(mov_imm(dst, p.first_patch_id + pi as u64)?)
                    }
                    RelocOp::LoadResumeAddress { dst } => {
                        let addr = resume.get(resume_requests).copied().unwrap_or(p.code_address);
                        resume_requests += 1;
                        insts.push(mov_imm(dst, addr)?);
                    }
                    RelocOp::JmpEpilogue => insts.push(jmp(p.epilogue_address)?),
                }
            }
        }

        Ok(Lowered {
            insts,
            patch_starts,
            resume_points,
        })
    }
}

fn encode(insts: &[Instruction], rip: u64) -> Result<(Vec<u8>, Vec<u32>), PatchError> {
    let block = InstructionBlock::new(insts, rip);
    let result = BlockEncoder::encode(64, block, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
    Ok((result.code_buffer, result.new_instruction_offsets))
}

fn offset_of_inst(offsets: &[u32], idx: usize, total: usize) -> usize {
    offsets.get(idx).map(|&o| o as usize).unwrap_or(total)
}
