// This module wraps the iced-x86 decoder and instruction info factory into the one analysis
// record the patch generator consumes. For each guest instruction it captures the decoded
// Instruction, its address and length, the mnemonic, an ordered operand list with access
// kinds, a simplified flow classification, the full 64-bit registers it reads or writes
// (explicitly or implicitly) and the explicit memory access, if any, together with whether
// that access can be recorded by the engine's memory hooks.

//! Guest instruction decoding and analysis.

use std::ops::{BitAnd, BitOr};

use iced_x86::{
    Code, Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, Mnemonic,
    OpAccess, OpKind, Register,
};

use crate::core::error::PatchError;
use crate::core::temp_manager::RegSet;
use crate::core::types::{NativeReg, Operand, Reg};

/// Longest x86 instruction.
pub const MAX_INST_LEN: usize = 15;

/// Kind of a memory access, usable as a small flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryAccessType(u8);

impl MemoryAccessType {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const READ_WRITE: Self = Self(3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MemoryAccessType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for MemoryAccessType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Control-flow class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Next,
    Jump,
    ConditionalJump,
    IndirectJump,
    Call,
    IndirectCall,
    Return,
    Interrupt,
    Exception,
    Transactional,
}

impl FlowKind {
    #[allow(unreachable_patterns)]
    fn from_iced(flow: FlowControl) -> Self {
        match flow {
            FlowControl::Next => FlowKind::Next,
            FlowControl::UnconditionalBranch => FlowKind::Jump,
            FlowControl::ConditionalBranch => FlowKind::ConditionalJump,
            FlowControl::IndirectBranch => FlowKind::IndirectJump,
            FlowControl::Call => FlowKind::Call,
            FlowControl::IndirectCall => FlowKind::IndirectCall,
            FlowControl::Return => FlowKind::Return,
            FlowControl::Interrupt => FlowKind::Interrupt,
            FlowControl::Exception => FlowKind::Exception,
            FlowControl::XbeginXabortXend => FlowKind::Transactional,
            _ => FlowKind::Exception,
        }
    }

    /// Classify `inst`. iced reports `xend` as ordinary flow, but it can
    /// transfer control to the abort handler of the enclosing `xbegin`.
    pub fn of(inst: &Instruction) -> Self {
        match inst.mnemonic() {
            Mnemonic::Xbegin | Mnemonic::Xabort | Mnemonic::Xend => FlowKind::Transactional,
            _ => Self::from_iced(inst.flow_control()),
        }
    }

    /// Whether translation stops after this instruction.
    pub fn ends_block(self) -> bool {
        self != FlowKind::Next
    }

    /// Whether the translated body writes the next guest pc itself.
    pub fn writes_pc(self) -> bool {
        matches!(
            self,
            FlowKind::Jump
                | FlowKind::ConditionalJump
                | FlowKind::IndirectJump
                | FlowKind::Call
                | FlowKind::IndirectCall
                | FlowKind::Return
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register(NativeReg),
    Immediate(u64),
    Memory,
    Branch(u64),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandInfo {
    pub kind: OperandKind,
    pub access: OpAccess,
}

/// The explicit memory operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessInfo {
    pub operand: Operand,
    pub kind: MemoryAccessType,
    /// Access size in bytes.
    pub size: u32,
    /// Absolute address for RIP-relative or absolute operands.
    pub absolute: Option<u64>,
    /// False for accesses the memory hooks skip (fs/gs, vsib, rsp-based pops).
    pub recordable: bool,
}

impl MemoryAccessInfo {
    /// Whether the accessed value can be captured in a shadow slot.
    pub fn value_size_supported(&self) -> bool {
        matches!(self.size, 1 | 2 | 4 | 8)
    }
}

/// Everything the generator needs to know about one guest instruction.
#[derive(Debug, Clone)]
pub struct InstAnalysis {
    pub instruction: Instruction,
    pub address: u64,
    pub size: usize,
    pub mnemonic: Mnemonic,
    pub flow: FlowKind,
    pub operands: Vec<OperandInfo>,
    pub used_registers: Vec<NativeReg>,
    pub memory: Option<MemoryAccessInfo>,
}

impl InstAnalysis {
    pub fn next_address(&self) -> u64 {
        self.address + self.size as u64
    }

    /// Logical slots the instruction touches, plus rsp and rip.
    pub fn reserved_regs(&self) -> RegSet {
        let mut set: RegSet = self
            .used_registers
            .iter()
            .filter_map(|&r| Reg::lookup(r))
            .collect();
        set.insert(crate::core::types::REG_SP);
        set.insert(crate::core::types::REG_PC);
        set
    }

    pub fn memory_operand(&self) -> Option<Operand> {
        self.memory.map(|m| m.operand)
    }

    pub fn mnemonic_name(&self) -> String {
        format!("{:?}", self.mnemonic)
    }
}

/// Decode the instruction at the start of `bytes`, located at `address`.
pub fn decode(bytes: &[u8], address: u64) -> Result<InstAnalysis, PatchError> {
    let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(PatchError::Decode { address });
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Err(PatchError::Decode { address });
    }
    Ok(analyze(instruction))
}

/// Build the analysis record of an already decoded instruction.
pub fn analyze(instruction: Instruction) -> InstAnalysis {
    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(&instruction);

    let mut operands = Vec::with_capacity(instruction.op_count() as usize);
    let mut memory = None;
    for i in 0..instruction.op_count() {
        let access = info.op_access(i);
        let kind = match instruction.op_kind(i) {
            OpKind::Register => OperandKind::Register(NativeReg::new(instruction.op_register(i))),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                OperandKind::Branch(instruction.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => OperandKind::Immediate(instruction.immediate(i)),
            OpKind::Memory => {
                if memory.is_none() {
                    memory = memory_info(&instruction, Operand(i), access);
                }
                OperandKind::Memory
            }
            _ => OperandKind::Other,
        };
        operands.push(OperandInfo { kind, access });
    }

    let mut used_registers: Vec<NativeReg> = info
        .used_registers()
        .iter()
        .map(|u| u.register().full_register())
        .filter(|r| r.is_gpr64())
        .map(NativeReg::new)
        .collect();
    used_registers.sort();
    used_registers.dedup();

    InstAnalysis {
        address: instruction.ip(),
        size: instruction.len(),
        mnemonic: instruction.mnemonic(),
        flow: FlowKind::of(&instruction),
        operands,
        used_registers,
        memory,
        instruction,
    }
}

fn memory_info(inst: &Instruction, operand: Operand, access: OpAccess) -> Option<MemoryAccessInfo> {
    let kind = match access {
        OpAccess::Read | OpAccess::CondRead => MemoryAccessType::READ,
        OpAccess::Write | OpAccess::CondWrite => MemoryAccessType::WRITE,
        OpAccess::ReadWrite | OpAccess::ReadCondWrite => MemoryAccessType::READ_WRITE,
        _ => return None,
    };

    let absolute = if inst.is_ip_rel_memory_operand() {
        Some(inst.ip_rel_memory_address())
    } else if inst.memory_base() == Register::None && inst.memory_index() == Register::None {
        Some(inst.memory_displacement64())
    } else {
        None
    };

    let segmented = matches!(inst.memory_segment(), Register::FS | Register::GS);
    let index = inst.memory_index();
    let vsib = index != Register::None && !index.is_gpr64();
    let pops_through_rsp = inst.memory_base() == Register::RSP
        && matches!(inst.code(), Code::Pop_rm64 | Code::Pop_rm16);

    Some(MemoryAccessInfo {
        operand,
        kind,
        size: inst.memory_size().size() as u32,
        absolute,
        recordable: !segmented && !vsib && !pops_through_rsp,
    })
}
