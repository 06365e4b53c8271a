// This module defines the relocatable instruction IR. A RelocatableInst is one item of a
// patch sequence: either a fully-formed machine instruction, or an operation whose encoding
// depends on where the sequence is finally placed (context and shadow slots addressed
// RIP-relatively, the patch id, resume addresses and the jump to the block epilogue).
// Every item carries a RelocTag naming the logical position it occupies in the patch. The
// tags let hooks be spliced in at exact points and let placement check that a sequence is
// well formed before any byte of it is written.

//! Tagged relocatable instructions.

use std::fmt;

use iced_x86::Instruction;

use super::error::PatchError;
use super::types::{Constant, Offset, Reg, Shadow};

/// Logical position of an item inside a patch.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelocTag {
    RelocInst = 0x00,
    ChangeScratchRegister = 0x01,
    PatchBegin = 0x10,
    PreInstMemAccess = 0x20,
    PreInstCallback = 0x21,
    PatchInstBegin = 0x30,
    PatchInstEnd = 0x31,
    PostInstMemAccess = 0x40,
    PostInstCallback = 0x41,
    Invalid = 0xff,
}

impl RelocTag {
    /// Map a raw byte back to a tag; unknown values become `Invalid`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => RelocTag::RelocInst,
            0x01 => RelocTag::ChangeScratchRegister,
            0x10 => RelocTag::PatchBegin,
            0x20 => RelocTag::PreInstMemAccess,
            0x21 => RelocTag::PreInstCallback,
            0x30 => RelocTag::PatchInstBegin,
            0x31 => RelocTag::PatchInstEnd,
            0x40 => RelocTag::PostInstMemAccess,
            0x41 => RelocTag::PostInstCallback,
            _ => RelocTag::Invalid,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Tags emitted as zero-size checkpoints.
    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            RelocTag::PatchBegin | RelocTag::PatchInstBegin | RelocTag::PatchInstEnd
        )
    }

    pub fn is_pre_hook(self) -> bool {
        matches!(self, RelocTag::PreInstMemAccess | RelocTag::PreInstCallback)
    }

    pub fn is_post_hook(self) -> bool {
        matches!(self, RelocTag::PostInstMemAccess | RelocTag::PostInstCallback)
    }

    pub fn is_body(self) -> bool {
        matches!(self, RelocTag::RelocInst | RelocTag::ChangeScratchRegister)
    }
}

/// Operation of a relocatable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocOp {
    /// Zero-size marker.
    Checkpoint,
    /// Instruction emitted as is.
    Inst(Instruction),
    MovImm { dst: Reg, imm: Constant },
    /// `dst = [context + offset]`.
    LoadContext { dst: Reg, offset: Offset },
    /// `[context + offset] = src`.
    StoreContext { src: Reg, offset: Offset },
    LoadShadow { dst: Reg, shadow: Shadow },
    StoreShadow { src: Reg, shadow: Shadow },
    /// `dst = id of the patch in its exec block`.
    LoadPatchId { dst: Reg },
    /// `dst = address of the next ResumePoint`.
    LoadResumeAddress { dst: Reg },
    /// Zero-size marker where execution continues after a host call-out.
    ResumePoint,
    /// Leave translated code through the block epilogue.
    JmpEpilogue,
}

impl RelocOp {
    /// Whether the op encodes to no bytes.
    pub fn is_marker(&self) -> bool {
        matches!(self, RelocOp::Checkpoint | RelocOp::ResumePoint)
    }
}

impl fmt::Display for RelocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocOp::Checkpoint => write!(f, "--"),
            RelocOp::Inst(inst) => write!(f, "{inst}"),
            RelocOp::MovImm { dst, imm } => write!(f, "mov {dst}, {:#x}", imm.0),
            RelocOp::LoadContext { dst, offset } => write!(f, "mov {dst}, ctx[{:#x}]", offset.0),
            RelocOp::StoreContext { src, offset } => write!(f, "mov ctx[{:#x}], {src}", offset.0),
            RelocOp::LoadShadow { dst, shadow } => {
                write!(f, "mov {dst}, shadow[{:#06x}]", shadow.tag())
            }
            RelocOp::StoreShadow { src, shadow } => {
                write!(f, "mov shadow[{:#06x}], {src}", shadow.tag())
            }
            RelocOp::LoadPatchId { dst } => write!(f, "mov {dst}, <patch id>"),
            RelocOp::LoadResumeAddress { dst } => write!(f, "mov {dst}, <resume>"),
            RelocOp::ResumePoint => write!(f, "<resume>:"),
            RelocOp::JmpEpilogue => write!(f, "jmp <epilogue>"),
        }
    }
}

/// One tagged item of a patch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatableInst {
    pub tag: RelocTag,
    pub op: RelocOp,
}

impl RelocatableInst {
    pub fn new(tag: RelocTag, op: RelocOp) -> Self {
        Self { tag, op }
    }

    pub fn checkpoint(tag: RelocTag) -> Self {
        Self {
            tag,
            op: RelocOp::Checkpoint,
        }
    }
}

impl fmt::Display for RelocatableInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<22} {}", format!("{:?}", self.tag), self.op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Start,
    Pre,
    Body,
    Post,
}

/// Check that `seq` has the shape of a single patch.
///
/// `PatchBegin` first, pre hooks, `PatchInstBegin`, body items, `PatchInstEnd`,
/// then post hooks. Each checkpoint appears once, and no item is `Invalid`.
pub fn validate_patch(seq: &[RelocatableInst]) -> Result<(), PatchError> {
    let mut phase = Phase::Start;
    let malformed = |tag, index, reason| PatchError::MalformedPatch { tag, index, reason };

    for (index, item) in seq.iter().enumerate() {
        let tag = item.tag;
        if tag == RelocTag::Invalid {
            return Err(PatchError::InvalidTag { index });
        }
        if tag.is_checkpoint() && item.op != RelocOp::Checkpoint {
            return Err(malformed(tag, index, "checkpoint carries an instruction"));
        }
        phase = match (phase, tag) {
            (Phase::Start, RelocTag::PatchBegin) => Phase::Pre,
            (Phase::Start, _) => return Err(malformed(tag, index, "expected PatchBegin")),
            (_, RelocTag::PatchBegin) => return Err(malformed(tag, index, "repeated PatchBegin")),
            (Phase::Pre, t) if t.is_pre_hook() => Phase::Pre,
            (Phase::Pre, RelocTag::PatchInstBegin) => Phase::Body,
            (Phase::Body, t) if t.is_body() => Phase::Body,
            (Phase::Body, RelocTag::PatchInstEnd) => Phase::Post,
            (Phase::Post, t) if t.is_post_hook() => Phase::Post,
            _ => return Err(malformed(tag, index, "tag out of position")),
        };
    }

    if phase != Phase::Post {
        let index = seq.len();
        let tag = seq.last().map(|i| i.tag).unwrap_or(RelocTag::Invalid);
        return Err(malformed(tag, index, "sequence ends before PatchInstEnd"));
    }
    Ok(())
}
