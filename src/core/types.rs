// This module holds the small typed wrappers that every other part of rewire passes around.
// NativeReg is an architecture register id as the decoder and encoder see it. Reg is a
// logical slot in the canonical context: its numeric id indexes the GPR region, it converts
// to a NativeReg only through the GPR_ID table and it deliberately cannot be compared with
// a bare integer. Constant, Offset, Temp and Operand wrap raw numbers so that an immediate,
// a context offset, a scratch register request and an operand index can never be confused
// with each other. Shadow names an 8-byte metadata slot by tag; the reserved tag range and
// the UNTAGGED sentinel are defined here too.

//! Register, value and shadow wrappers.

use std::cmp::Ordering;
use std::fmt;

use iced_x86::Register;

use crate::x64::context::{Context, GprState, GPR_ID, NUM_GPR};

/// Architecture register id.
///
/// Two `NativeReg`s are equal and ordered by their numeric id only.
#[derive(Debug, Clone, Copy, Hash)]
pub struct NativeReg(Register);

impl NativeReg {
    pub const fn new(reg: Register) -> Self {
        Self(reg)
    }

    /// Numeric id of the register.
    pub fn value(self) -> u32 {
        self.0 as u32
    }

    pub fn register(self) -> Register {
        self.0
    }
}

impl From<Register> for NativeReg {
    fn from(reg: Register) -> Self {
        Self(reg)
    }
}

impl From<NativeReg> for Register {
    fn from(reg: NativeReg) -> Self {
        reg.0
    }
}

impl PartialEq for NativeReg {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}

impl Eq for NativeReg {}

impl PartialOrd for NativeReg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NativeReg {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value().cmp(&other.value())
    }
}

impl PartialEq<u32> for NativeReg {
    fn eq(&self, other: &u32) -> bool {
        self.value() == *other
    }
}

impl PartialEq<NativeReg> for u32 {
    fn eq(&self, other: &NativeReg) -> bool {
        *self == other.value()
    }
}

impl fmt::Display for NativeReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Logical register slot in the canonical context.
///
/// The id indexes the general-purpose region. Converting to an architecture
/// register goes through the `GPR_ID` table; comparing with a plain integer
/// does not compile:
///
/// ```compile_fail
/// use rewire::Reg;
/// let reg = Reg::new(3);
/// let _ = reg == 3u32;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg {
    id: u32,
}

impl Reg {
    /// Create a slot. Panics when `id` is not a valid slot index.
    pub const fn new(id: u32) -> Self {
        assert!((id as usize) < NUM_GPR, "register slot out of range");
        Self { id }
    }

    pub const fn id(self) -> u32 {
        self.id
    }

    /// Architecture register backing this slot.
    pub fn native(self) -> NativeReg {
        NativeReg(GPR_ID[self.id as usize])
    }

    /// Numeric id of the backing architecture register.
    pub fn value(self) -> u32 {
        self.native().value()
    }

    /// Byte offset of this slot inside [`Context`].
    pub const fn offset(self) -> usize {
        std::mem::offset_of!(Context, gpr_state) + self.id as usize * std::mem::size_of::<u64>()
    }

    /// Find the slot backing `reg`. Sub-registers resolve to their full register.
    pub fn lookup(reg: NativeReg) -> Option<Reg> {
        let full = reg.register().full_register();
        GPR_ID
            .iter()
            .position(|&r| r == full)
            .map(|idx| Reg { id: idx as u32 })
    }
}

impl From<Reg> for NativeReg {
    fn from(reg: Reg) -> Self {
        reg.native()
    }
}

impl From<Reg> for Register {
    fn from(reg: Reg) -> Self {
        GPR_ID[reg.id as usize]
    }
}

impl PartialEq<NativeReg> for Reg {
    fn eq(&self, other: &NativeReg) -> bool {
        self.native() == *other
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.native())
    }
}

/// The instruction pointer slot.
pub const REG_PC: Reg = Reg::new(16);
/// The stack pointer slot.
pub const REG_SP: Reg = Reg::new(15);

const _: () = assert!(REG_PC.offset() == std::mem::offset_of!(GprState, rip));
const _: () = assert!(REG_SP.offset() == std::mem::offset_of!(GprState, rsp));

/// Immediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Constant(pub u64);

impl From<u64> for Constant {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<Constant> for u64 {
    fn from(c: Constant) -> Self {
        c.0
    }
}

/// Byte offset relative to the start of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Offset(pub i64);

impl From<i64> for Offset {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl From<usize> for Offset {
    fn from(v: usize) -> Self {
        Self(v as i64)
    }
}

impl From<Reg> for Offset {
    fn from(reg: Reg) -> Self {
        Self(reg.offset() as i64)
    }
}

impl From<Offset> for i64 {
    fn from(o: Offset) -> Self {
        o.0
    }
}

/// Request for a scratch register, resolved per hook region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temp(pub u32);

impl Temp {
    /// Reserved for engine-internal sequences.
    pub const INTERNAL: Temp = Temp(0xFFFF_FFFF);

    pub fn is_internal(self) -> bool {
        self == Self::INTERNAL
    }
}

impl From<u32> for Temp {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Index of an operand of the instruction being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand(pub u32);

impl From<u32> for Operand {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<Operand> for u32 {
    fn from(op: Operand) -> Self {
        op.0
    }
}

/// First tag of the range reserved for engine memory-access shadows.
pub const MEMORY_TAG_BEGIN: u16 = 0xffe0;
/// End (exclusive) of the reserved range.
pub const MEMORY_TAG_END: u16 = 0xfff0;

pub const MEM_READ_ADDRESS_TAG: u16 = MEMORY_TAG_BEGIN;
pub const MEM_READ_VALUE_TAG: u16 = MEMORY_TAG_BEGIN + 1;
pub const MEM_WRITE_ADDRESS_TAG: u16 = MEMORY_TAG_BEGIN + 2;
pub const MEM_WRITE_VALUE_TAG: u16 = MEMORY_TAG_BEGIN + 3;

/// Tagged 8-byte metadata slot in an exec block's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Shadow {
    tag: u16,
}

impl Shadow {
    /// Sentinel tag: a shadow that is never resolved to a slot.
    pub const UNTAGGED: u16 = 0xffff;

    pub(crate) const fn new(tag: u16) -> Self {
        Self { tag }
    }

    pub const fn untagged() -> Self {
        Self {
            tag: Self::UNTAGGED,
        }
    }

    pub const fn tag(self) -> u16 {
        self.tag
    }

    pub const fn is_tagged(self) -> bool {
        self.tag != Self::UNTAGGED
    }

    /// Whether the tag lies in the engine's reserved memory range.
    pub const fn is_memory_tag(tag: u16) -> bool {
        tag >= MEMORY_TAG_BEGIN && tag < MEMORY_TAG_END
    }
}
