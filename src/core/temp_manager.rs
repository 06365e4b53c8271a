// This module resolves Temp requests to physical scratch registers. Each hook region and each
// instruction body owns one TempManager. Registers the instruction touches (explicitly or
// implicitly, as reported by the decoder) are excluded, as are rsp and rip, and the lowest
// free slot is assigned first so that the same instruction always gets the same temps. A
// scratch register still holds a live guest value, so the manager also produces the spill
// sequence that saves it to its own context slot before the region and reloads it after.

//! Scratch register allocation for patch regions.

use super::error::PatchError;
use super::reloc::{RelocOp, RelocTag, RelocatableInst};
use super::types::{Offset, Reg, Temp};
use crate::x64::context::AVAILABLE_GPR;

/// Bit set over logical register slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegSet {
    bits: u32,
}

impl RegSet {
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    /// Set holding the first `count` slots.
    pub fn first(count: usize) -> Self {
        Self {
            bits: ((1u64 << count) - 1) as u32,
        }
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.bits & (1 << reg.id()) != 0
    }

    pub fn insert(&mut self, reg: Reg) {
        self.bits |= 1 << reg.id();
    }

    pub fn remove(&mut self, reg: Reg) {
        self.bits &= !(1 << reg.id());
    }

    pub fn union(&mut self, other: &RegSet) {
        self.bits |= other.bits;
    }

    /// Lowest slot in `self` that is not in `exclude`.
    pub fn find_first(&self, exclude: &RegSet) -> Option<Reg> {
        let available = self.bits & !exclude.bits;
        if available == 0 {
            return None;
        }
        Some(Reg::new(available.trailing_zeros()))
    }

    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut set = RegSet::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

/// A temp together with the register it was resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempBinding {
    pub region: RelocTag,
    pub temp: Temp,
    pub reg: Reg,
}

#[derive(Debug, Clone)]
pub struct TempManager {
    address: u64,
    excluded: RegSet,
    used: RegSet,
    bindings: Vec<(Temp, Reg)>,
    allow_internal: bool,
}

impl TempManager {
    /// `excluded` holds every register the instruction at `address` touches.
    pub fn new(address: u64, excluded: RegSet) -> Self {
        Self {
            address,
            excluded,
            used: RegSet::new(),
            bindings: Vec::new(),
            allow_internal: false,
        }
    }

    /// Manager for engine sequences, which may use [`Temp::INTERNAL`].
    pub fn internal(address: u64, excluded: RegSet) -> Self {
        Self {
            allow_internal: true,
            ..Self::new(address, excluded)
        }
    }

    /// Register for `temp`, allocating on first use.
    pub fn get(&mut self, temp: Temp) -> Result<Reg, PatchError> {
        if temp.is_internal() && !self.allow_internal {
            return Err(PatchError::ReservedTemp(temp.0));
        }
        if let Some(&(_, reg)) = self.bindings.iter().find(|(t, _)| *t == temp) {
            return Ok(reg);
        }

        let mut taken = self.excluded;
        taken.union(&self.used);
        let reg = RegSet::first(AVAILABLE_GPR)
            .find_first(&taken)
            .ok_or(PatchError::TempExhausted {
                address: self.address,
                temp: temp.0,
            })?;

        self.used.insert(reg);
        self.bindings.push((temp, reg));
        log::trace!("temp {:#x} -> {} at {:#x}", temp.0, reg, self.address);
        Ok(reg)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self, region: RelocTag) -> impl Iterator<Item = TempBinding> + '_ {
        self.bindings.iter().map(move |&(temp, reg)| TempBinding { region, temp, reg })
    }

    /// Spill every allocated register to its own context slot.
    pub fn save_sequence(&self, tag: RelocTag) -> Vec<RelocatableInst> {
        self.bindings
            .iter()
            .map(|&(_, reg)| {
                RelocatableInst::new(
                    tag,
                    RelocOp::StoreContext {
                        src: reg,
                        offset: Offset::from(reg),
                    },
                )
            })
            .collect()
    }

    /// Reload every allocated register from its context slot.
    pub fn restore_sequence(&self, tag: RelocTag) -> Vec<RelocatableInst> {
        self.bindings
            .iter()
            .rev()
            .map(|&(_, reg)| {
                RelocatableInst::new(
                    tag,
                    RelocOp::LoadContext {
                        dst: reg,
                        offset: Offset::from(reg),
                    },
                )
            })
            .collect()
    }
}
